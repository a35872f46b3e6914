//! Core types for the coven daemon.
//!
//! Tasks come from the tracker, workflows interpret grimoires against a
//! worktree, agents are the child processes a workflow spawns, and questions
//! are the interactive prompts those agents raise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for workflows, questions, and other daemon-owned rows.
/// Uses `UUIDv7` for time-ordered lexicographic sorting. Task ids are
/// externally assigned by the tracker and stay plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compose the step task id used to address a step's process.
///
/// Questions are raised by a step's process, not the workflow, so the
/// process manager keys children by `workflow_id:step_name`.
pub fn step_task_id(workflow_id: &Id, step_name: &str) -> String {
    format!("{}:{}", workflow_id, step_name)
}

// --- Task ---

/// Task classification from the tracker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Task,
    Bug,
    Feature,
    Test,
    Refactor,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Test => "test",
            Self::Refactor => "refactor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "bug" => Some(Self::Bug),
            "feature" => Some(Self::Feature),
            "test" => Some(Self::Test),
            "refactor" => Some(Self::Refactor),
            _ => None,
        }
    }
}

/// Task lifecycle status.
///
/// Transitions: `open -> in_progress -> {closed, blocked}`, `blocked -> open`.
/// `closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Open, Self::InProgress) => true,
            (Self::InProgress, Self::Closed | Self::Blocked) => true,
            (Self::Blocked, Self::Open) => true,
            _ => false,
        }
    }
}

/// A unit of work pulled from the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable, externally assigned identity.
    pub id: String,
    pub title: String,
    pub description: String,
    /// Lower is higher priority.
    pub priority: i64,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Ordered labels; `grimoire:<name>` selects a grimoire explicitly.
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Workflow ---

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Blocked,
    Completed,
    Failed,
    PendingMerge,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PendingMerge => "pending_merge",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "blocked" => Some(Self::Blocked),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "pending_merge" => Some(Self::PendingMerge),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses release the worktree and never resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The recorded outcome of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    /// Step kind name: `script`, `agent`, `loop`, or `merge`.
    pub step_type: String,
    pub success: bool,
    /// Exit code for script steps.
    pub exit_code: Option<i32>,
    /// Captured output, truncated to the configured byte limit.
    pub output: String,
    /// Variable name the output was bound to, if declared.
    pub output_var: Option<String>,
    pub skipped: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// One execution of a grimoire against a task.
///
/// The pair (`current_step`, `completed_steps`) is the resume point;
/// `completed_steps` is append-only and preserves first-completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub task_id: String,
    pub grimoire: String,
    pub worktree_path: Option<String>,
    /// Index into the grimoire's top-level step list.
    pub current_step: usize,
    pub completed_steps: Vec<StepResult>,
    /// Template bindings accumulated from step outputs.
    pub variables: Vec<(String, String)>,
    pub status: WorkflowStatus,
    /// Error kind string when blocked/failed (e.g. `step_timeout`).
    pub error: Option<String>,
    /// Conflicting paths reported by a failed merge.
    pub conflicts: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub checkpointed_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a fresh workflow at step 0 for a claimed task.
    pub fn new(task_id: impl Into<String>, grimoire: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            task_id: task_id.into(),
            grimoire: grimoire.into(),
            worktree_path: None,
            current_step: 0,
            completed_steps: Vec::new(),
            variables: Vec::new(),
            status: WorkflowStatus::Running,
            error: None,
            conflicts: Vec::new(),
            started_at: now,
            finished_at: None,
            checkpointed_at: now,
        }
    }

    /// Look up a completed step result by name.
    pub fn step_result(&self, name: &str) -> Option<&StepResult> {
        self.completed_steps.iter().find(|r| r.step_name == name)
    }

    /// Record a step result, keyed by step name.
    ///
    /// A re-executed step (loop iterations, retries) replaces its previous
    /// result in place, preserving first-completion order.
    pub fn record_step(&mut self, result: StepResult) {
        if let Some(slot) = self
            .completed_steps
            .iter_mut()
            .find(|r| r.step_name == result.step_name)
        {
            *slot = result;
        } else {
            self.completed_steps.push(result);
        }
    }

    /// Bind or rebind a template variable.
    pub fn bind_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.variables.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.variables.push((name, value));
        }
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

// --- Agent ---

/// Agent process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// A running external process bound to one step of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Composite key `workflow_id:step_name`.
    pub step_task_id: String,
    pub workflow_id: Id,
    /// Owning task id, for external addressing.
    pub task_id: String,
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
}

// --- Question ---

/// Delivery status of an answered question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    DeliveryFailed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::DeliveryFailed => "delivery_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "delivery_failed" => Some(Self::DeliveryFailed),
            _ => None,
        }
    }
}

/// An interactive prompt detected on an agent's output stream.
///
/// Answerable only while `answered_at` is unset and the agent is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Id,
    pub task_id: String,
    pub step_task_id: String,
    pub text: String,
    pub suggested_answers: Vec<String>,
    pub asked_at: DateTime<Utc>,
    pub answer: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub delivery: DeliveryStatus,
    pub delivery_error: Option<String>,
}

// --- Event ---

/// An entry in the durable event log.
///
/// `seq` is assigned by the store, strictly increasing for the daemon's
/// lifetime, and is the SSE reconnect cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    /// Entity kind: `task`, `workflow`, `agent`, or `question`.
    pub entity_kind: String,
    pub entity_id: String,
    pub payload_json: String,
}
