//! SQLite storage for the coven daemon.
//!
//! One table per entity bucket (tasks, workflows, agents, questions, events,
//! meta). All cross-entity mutations run in a single transaction: claim plus
//! workflow insert, step completion plus checkpoint, workflow completion plus
//! task close. The event log sequence is assigned here and never reused.

use chrono::{DateTime, Utc};
use coven_core::events::{EventPayload, EventType};
use coven_core::{
    Agent, AgentStatus, DeliveryStatus, Event, Id, Question, StepResult, Task, TaskStatus,
    TaskType, Workflow, WorkflowStatus,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("question not found: {0}")]
    QuestionNotFound(String),
    #[error("task already claimed: {0}")]
    AlreadyClaimed(String),
    #[error("question already answered: {0}")]
    AlreadyAnswered(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
    /// Directory holding per-agent output logs, for retention sweeps.
    output_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        Ok(Self {
            pool,
            output_dir: None,
        })
    }

    /// Point retention sweeps at the agent output log directory.
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task operations ---

    /// Insert a task. Replaces nothing: duplicate ids are a database error.
    pub async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, description, priority, task_type, status, labels,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.priority)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.labels)?)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a task coming from the external tracker, preserving the local
    /// status once the task is known.
    pub async fn import_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, description, priority, task_type, status, labels,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                priority = excluded.priority,
                task_type = excluded.task_type,
                labels = excluded.labels,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.priority)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.labels)?)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        row.into_task()
    }

    /// List tasks ordered by priority (lower first), then creation time.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks WHERE status = ?1 ORDER BY priority ASC, created_at ASC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskRow>(
                    "SELECT * FROM tasks ORDER BY priority ASC, created_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Update task status, enforcing the transition machine.
    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let task = self.get_task(id).await?;
        if !task.status.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                from: task.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Workflow operations ---

    /// Atomically claim a task and create its workflow.
    ///
    /// Rejects with `already_claimed` when the task is not `open`; the guarded
    /// UPDATE makes concurrent claimers lose cleanly.
    pub async fn claim_task_and_start_workflow(
        &self,
        task_id: &str,
        grimoire: &str,
    ) -> Result<Workflow> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::TaskNotFound(task_id.to_string()));
        }

        let claimed = sqlx::query(
            "UPDATE tasks SET status = 'in_progress', updated_at = ?1 \
             WHERE id = ?2 AND status = 'open'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            return Err(StorageError::AlreadyClaimed(task_id.to_string()));
        }

        let workflow = Workflow::new(task_id, grimoire);
        insert_workflow(&mut tx, &workflow).await?;

        tx.commit().await?;
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: &Id) -> Result<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::WorkflowNotFound(id.to_string()))?;
        row.into_workflow()
    }

    /// The newest workflow for a task, preferring a non-terminal one.
    pub async fn get_workflow_for_task(&self, task_id: &str) -> Result<Workflow> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE task_id = ?1 ORDER BY started_at DESC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        let workflows: Vec<Workflow> = rows
            .into_iter()
            .map(WorkflowRow::into_workflow)
            .collect::<Result<_>>()?;
        workflows
            .iter()
            .find(|w| !w.status.is_terminal())
            .or_else(|| workflows.first())
            .cloned()
            .ok_or_else(|| StorageError::WorkflowNotFound(task_id.to_string()))
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as::<_, WorkflowRow>(
                    "SELECT * FROM workflows WHERE status = ?1 ORDER BY started_at ASC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows ORDER BY started_at ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    /// Workflows that should be re-entered after a daemon restart.
    pub async fn list_resumable_workflows(&self) -> Result<Vec<Workflow>> {
        self.list_workflows(Some(WorkflowStatus::Running)).await
    }

    /// Persist the workflow's resume point: step index, completed steps,
    /// variable bindings, worktree, status, and checkpoint timestamp.
    pub async fn checkpoint_workflow(&self, workflow: &Workflow) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workflows SET worktree_path = ?1, current_step = ?2, completed_steps = ?3, \
             variables = ?4, status = ?5, error = ?6, conflicts = ?7, finished_at = ?8, \
             checkpointed_at = ?9 WHERE id = ?10",
        )
        .bind(&workflow.worktree_path)
        .bind(workflow.current_step as i64)
        .bind(serde_json::to_string(&workflow.completed_steps)?)
        .bind(serde_json::to_string(&workflow.variables)?)
        .bind(workflow.status.as_str())
        .bind(&workflow.error)
        .bind(serde_json::to_string(&workflow.conflicts)?)
        .bind(workflow.finished_at.map(|t| t.timestamp_millis()))
        .bind(Utc::now().timestamp_millis())
        .bind(workflow.id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(workflow.id.to_string()));
        }
        Ok(())
    }

    /// Close a workflow and move its task, in one transaction.
    pub async fn complete_workflow(
        &self,
        workflow: &Workflow,
        task_status: TaskStatus,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let task_row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM tasks WHERE id = ?1")
                .bind(&workflow.task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = task_row
            .and_then(|(s,)| TaskStatus::parse(&s))
            .ok_or_else(|| StorageError::TaskNotFound(workflow.task_id.clone()))?;
        if current != task_status {
            if !current.can_transition_to(task_status) {
                return Err(StorageError::InvalidTransition {
                    from: current.as_str().to_string(),
                    to: task_status.as_str().to_string(),
                });
            }
            sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(task_status.as_str())
                .bind(Utc::now().timestamp_millis())
                .bind(&workflow.task_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE workflows SET worktree_path = ?1, current_step = ?2, completed_steps = ?3, \
             variables = ?4, status = ?5, error = ?6, conflicts = ?7, finished_at = ?8, \
             checkpointed_at = ?9 WHERE id = ?10",
        )
        .bind(&workflow.worktree_path)
        .bind(workflow.current_step as i64)
        .bind(serde_json::to_string(&workflow.completed_steps)?)
        .bind(serde_json::to_string(&workflow.variables)?)
        .bind(workflow.status.as_str())
        .bind(&workflow.error)
        .bind(serde_json::to_string(&workflow.conflicts)?)
        .bind(workflow.finished_at.map(|t| t.timestamp_millis()))
        .bind(Utc::now().timestamp_millis())
        .bind(workflow.id.as_ref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // --- Agent operations ---

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (step_task_id, workflow_id, task_id, pid, status, worktree,
                                branch, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(step_task_id) DO UPDATE SET
                pid = excluded.pid,
                status = excluded.status,
                worktree = excluded.worktree,
                branch = excluded.branch,
                started_at = excluded.started_at
            "#,
        )
        .bind(&agent.step_task_id)
        .bind(agent.workflow_id.as_ref())
        .bind(&agent.task_id)
        .bind(agent.pid.map(i64::from))
        .bind(agent.status.as_str())
        .bind(&agent.worktree)
        .bind(&agent.branch)
        .bind(agent.started_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_agent_status(&self, step_task_id: &str, status: AgentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE agents SET status = ?1 WHERE step_task_id = ?2")
            .bind(status.as_str())
            .bind(step_task_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(step_task_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_agent(&self, step_task_id: &str) -> Result<Agent> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE step_task_id = ?1")
            .bind(step_task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AgentNotFound(step_task_id.to_string()))?;
        Ok(row.into_agent())
    }

    /// Find an agent by the owning task id, preferring a live one.
    pub async fn get_agent_for_task(&self, task_id: &str) -> Result<Agent> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT * FROM agents WHERE task_id = ?1 ORDER BY started_at DESC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        let agents: Vec<Agent> = rows.into_iter().map(AgentRow::into_agent).collect();
        agents
            .iter()
            .find(|a| a.status.is_live())
            .or_else(|| agents.first())
            .cloned()
            .ok_or_else(|| StorageError::AgentNotFound(task_id.to_string()))
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows =
            sqlx::query_as::<_, AgentRow>("SELECT * FROM agents ORDER BY started_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(AgentRow::into_agent).collect())
    }

    /// Count agents in `starting` or `running` state.
    pub async fn count_live_agents(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agents WHERE status IN ('starting', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    // --- Question operations ---

    pub async fn insert_question(&self, question: &Question) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO questions (id, task_id, step_task_id, text, suggested_answers, asked_at,
                                   answer, answered_at, delivery, delivery_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(question.id.as_ref())
        .bind(&question.task_id)
        .bind(&question.step_task_id)
        .bind(&question.text)
        .bind(serde_json::to_string(&question.suggested_answers)?)
        .bind(question.asked_at.timestamp_millis())
        .bind(&question.answer)
        .bind(question.answered_at.map(|t| t.timestamp_millis()))
        .bind(question.delivery.as_str())
        .bind(&question.delivery_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_question(&self, id: &Id) -> Result<Question> {
        let row = sqlx::query_as::<_, QuestionRow>("SELECT * FROM questions WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::QuestionNotFound(id.to_string()))?;
        row.into_question()
    }

    pub async fn list_questions(
        &self,
        task_id: Option<&str>,
        pending_only: bool,
    ) -> Result<Vec<Question>> {
        let mut sql = String::from("SELECT * FROM questions");
        let mut clauses = Vec::new();
        if task_id.is_some() {
            clauses.push("task_id = ?1");
        }
        if pending_only {
            clauses.push("answered_at IS NULL");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY asked_at ASC");

        let mut query = sqlx::query_as::<_, QuestionRow>(&sql);
        if let Some(tid) = task_id {
            query = query.bind(tid);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(QuestionRow::into_question).collect()
    }

    /// Record an answer exactly once.
    ///
    /// The `answered_at IS NULL` guard makes a second answer lose atomically.
    pub async fn answer_question(&self, id: &Id, answer: &str) -> Result<Question> {
        let result = sqlx::query(
            "UPDATE questions SET answer = ?1, answered_at = ?2 \
             WHERE id = ?3 AND answered_at IS NULL",
        )
        .bind(answer)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Distinguish missing from already answered.
            let _ = self.get_question(id).await?;
            return Err(StorageError::AlreadyAnswered(id.to_string()));
        }
        self.get_question(id).await
    }

    pub async fn update_question_delivery(
        &self,
        id: &Id,
        delivery: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE questions SET delivery = ?1, delivery_error = ?2 WHERE id = ?3")
                .bind(delivery.as_str())
                .bind(error)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::QuestionNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Event operations ---

    /// Append an event; the store assigns the sequence number.
    pub async fn append_event(
        &self,
        event_type: EventType,
        entity_kind: &str,
        entity_id: &str,
        payload: &EventPayload,
    ) -> Result<Event> {
        let now = Utc::now();
        let payload_json = payload.to_json()?;
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO events (ts, type, entity_kind, entity_id, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING seq",
        )
        .bind(now.timestamp_millis())
        .bind(event_type.as_str())
        .bind(entity_kind)
        .bind(entity_id)
        .bind(&payload_json)
        .fetch_one(&self.pool)
        .await?;

        Ok(Event {
            seq: row.0,
            timestamp: now,
            event_type: event_type.as_str().to_string(),
            entity_kind: entity_kind.to_string(),
            entity_id: entity_id.to_string(),
            payload_json,
        })
    }

    /// Events with `seq > since_seq`, optionally filtered.
    pub async fn range_events(
        &self,
        since_seq: i64,
        entity_kind: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<Vec<Event>> {
        let mut sql = String::from("SELECT * FROM events WHERE seq > ?1");
        if entity_kind.is_some() {
            sql.push_str(" AND entity_kind = ?2");
        }
        if entity_id.is_some() {
            sql.push_str(" AND entity_id = ?3");
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut query = sqlx::query_as::<_, EventRow>(&sql).bind(since_seq);
        if let Some(kind) = entity_kind {
            query = query.bind(kind);
        }
        if let Some(id) = entity_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Latest assigned event sequence, 0 when the log is empty.
    pub async fn latest_event_seq(&self) -> Result<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }

    // --- Retention ---

    /// Delete expired events, hard-delete completed workflows past retention,
    /// and unlink agent output logs whose workflow no longer exists.
    pub async fn retention_sweep(
        &self,
        now: DateTime<Utc>,
        event_retention: chrono::Duration,
        workflow_retention: chrono::Duration,
    ) -> Result<()> {
        let event_cutoff = (now - event_retention).timestamp_millis();
        sqlx::query("DELETE FROM events WHERE ts < ?1")
            .bind(event_cutoff)
            .execute(&self.pool)
            .await?;

        let wf_cutoff = (now - workflow_retention).timestamp_millis();
        let expired = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE status IN ('completed', 'failed', 'cancelled') \
             AND finished_at IS NOT NULL AND finished_at < ?1",
        )
        .bind(wf_cutoff)
        .fetch_all(&self.pool)
        .await?;

        for row in expired {
            let workflow_id = row.id.clone();
            sqlx::query("DELETE FROM agents WHERE workflow_id = ?1")
                .bind(&workflow_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM workflows WHERE id = ?1")
                .bind(&workflow_id)
                .execute(&self.pool)
                .await?;
            if let Some(dir) = &self.output_dir {
                remove_output_logs(dir, &workflow_id);
            }
        }
        Ok(())
    }

    /// Running workflows whose last checkpoint predates the cutoff.
    pub async fn list_stale_workflows(&self, cutoff: DateTime<Utc>) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE status = 'running' AND checkpointed_at < ?1",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }
}

async fn insert_workflow(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    workflow: &Workflow,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflows (id, task_id, grimoire, worktree_path, current_step,
                               completed_steps, variables, status, error, conflicts,
                               started_at, finished_at, checkpointed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(workflow.id.as_ref())
    .bind(&workflow.task_id)
    .bind(&workflow.grimoire)
    .bind(&workflow.worktree_path)
    .bind(workflow.current_step as i64)
    .bind(serde_json::to_string(&workflow.completed_steps)?)
    .bind(serde_json::to_string(&workflow.variables)?)
    .bind(workflow.status.as_str())
    .bind(&workflow.error)
    .bind(serde_json::to_string(&workflow.conflicts)?)
    .bind(workflow.started_at.timestamp_millis())
    .bind(workflow.finished_at.map(|t| t.timestamp_millis()))
    .bind(workflow.checkpointed_at.timestamp_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Unlink `output/<workflow_id>:*.log` files for a deleted workflow.
fn remove_output_logs(dir: &Path, workflow_id: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let prefix = format!("{workflow_id}:");
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&prefix) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    title: String,
    description: String,
    priority: i64,
    task_type: String,
    status: String,
    labels: String,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            title: self.title,
            description: self.description,
            priority: self.priority,
            task_type: TaskType::parse(&self.task_type).unwrap_or_default(),
            status: TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Blocked),
            labels: serde_json::from_str(&self.labels)?,
            created_at: millis(self.created_at),
            updated_at: millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    task_id: String,
    grimoire: String,
    worktree_path: Option<String>,
    current_step: i64,
    completed_steps: String,
    variables: String,
    status: String,
    error: Option<String>,
    conflicts: String,
    started_at: i64,
    finished_at: Option<i64>,
    checkpointed_at: i64,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow> {
        let completed_steps: Vec<StepResult> = serde_json::from_str(&self.completed_steps)?;
        let variables: Vec<(String, String)> = serde_json::from_str(&self.variables)?;
        let conflicts: Vec<String> = serde_json::from_str(&self.conflicts)?;
        Ok(Workflow {
            id: Id::from_string(self.id),
            task_id: self.task_id,
            grimoire: self.grimoire,
            worktree_path: self.worktree_path,
            current_step: self.current_step as usize,
            completed_steps,
            variables,
            status: WorkflowStatus::parse(&self.status).unwrap_or(WorkflowStatus::Failed),
            error: self.error,
            conflicts,
            started_at: millis(self.started_at),
            finished_at: self.finished_at.map(millis),
            checkpointed_at: millis(self.checkpointed_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    step_task_id: String,
    workflow_id: String,
    task_id: String,
    pid: Option<i64>,
    status: String,
    worktree: Option<String>,
    branch: Option<String>,
    started_at: i64,
}

impl AgentRow {
    fn into_agent(self) -> Agent {
        Agent {
            step_task_id: self.step_task_id,
            workflow_id: Id::from_string(self.workflow_id),
            task_id: self.task_id,
            pid: self.pid.map(|p| p as u32),
            status: AgentStatus::parse(&self.status).unwrap_or(AgentStatus::Failed),
            worktree: self.worktree,
            branch: self.branch,
            started_at: millis(self.started_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: String,
    task_id: String,
    step_task_id: String,
    text: String,
    suggested_answers: String,
    asked_at: i64,
    answer: Option<String>,
    answered_at: Option<i64>,
    delivery: String,
    delivery_error: Option<String>,
}

impl QuestionRow {
    fn into_question(self) -> Result<Question> {
        Ok(Question {
            id: Id::from_string(self.id),
            task_id: self.task_id,
            step_task_id: self.step_task_id,
            text: self.text,
            suggested_answers: serde_json::from_str(&self.suggested_answers)?,
            asked_at: millis(self.asked_at),
            answer: self.answer,
            answered_at: self.answered_at.map(millis),
            delivery: DeliveryStatus::parse(&self.delivery).unwrap_or_default(),
            delivery_error: self.delivery_error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    ts: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    entity_kind: String,
    entity_id: String,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            seq: self.seq,
            timestamp: millis(self.ts),
            event_type: self.event_type,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            payload_json: self.payload_json,
        }
    }
}

fn millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}
