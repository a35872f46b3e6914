//! Merge review gateway.
//!
//! A workflow whose merge step carries `require_review` parks at
//! `pending_merge` after a clean conflict probe. Approval performs the real
//! merge, records the merge step, and re-enters the engine so any remaining
//! steps run; rejection aborts the worktree and blocks the task.

use chrono::Utc;
use coven_core::events::{EventPayload, EventType, TaskEventPayload, WorkflowEventPayload};
use coven_core::{ErrorKind, Id, StepResult, TaskStatus, WorkflowStatus};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::engine::WorkflowEngine;
use crate::registry::GrimoireRegistry;
use crate::storage::{Storage, StorageError};
use crate::worktree::WorktreeProvider;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("workflow not pending merge: {0}")]
    NotPendingMerge(String),
    #[error("merge conflict: {0:?}")]
    MergeConflict(Vec<String>),
    #[error("worktree error: {0}")]
    Worktree(#[from] crate::worktree::WorktreeError),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// Result of an approved merge.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MergeApproval {
    pub status: String,
    pub workflow_id: Id,
}

/// Human approval surface for reviewed merges.
pub struct ReviewGateway {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    worktrees: Arc<dyn WorktreeProvider>,
    registry: Arc<GrimoireRegistry>,
    engine: Arc<WorkflowEngine>,
}

impl std::fmt::Debug for ReviewGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewGateway").finish_non_exhaustive()
    }
}

impl ReviewGateway {
    pub fn new(
        storage: Arc<Storage>,
        bus: Arc<EventBus>,
        worktrees: Arc<dyn WorktreeProvider>,
        registry: Arc<GrimoireRegistry>,
        engine: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            storage,
            bus,
            worktrees,
            registry,
            engine,
        }
    }

    /// Approve a pending merge: perform it, clean up the worktree, record
    /// the merge step, and resume the workflow past it.
    pub async fn approve(&self, workflow_id: &Id, feedback: Option<&str>) -> Result<MergeApproval> {
        let mut workflow = self.storage.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::PendingMerge {
            return Err(ReviewError::NotPendingMerge(workflow_id.to_string()));
        }
        let task = self.storage.get_task(&workflow.task_id).await?;
        let worktree = PathBuf::from(
            workflow
                .worktree_path
                .clone()
                .unwrap_or_default(),
        );

        let mut message = format!("coven: land {} ({})", task.id, task.title);
        if let Some(feedback) = feedback {
            if !feedback.trim().is_empty() {
                message.push_str("\n\n");
                message.push_str(feedback.trim());
            }
        }

        let started_at = Utc::now();
        let outcome = self
            .worktrees
            .merge(&worktree, self.engine.base_branch(), &message)?;
        if !outcome.success {
            workflow.status = WorkflowStatus::Blocked;
            workflow.error = Some(ErrorKind::MergeConflict.as_str().to_string());
            workflow.conflicts = outcome.conflicts.clone();
            self.storage
                .complete_workflow(&workflow, TaskStatus::Blocked)
                .await?;
            self.publish_workflow(EventType::WorkflowBlocked, &workflow).await;
            return Err(ReviewError::MergeConflict(outcome.conflicts));
        }

        if let Err(e) = self.worktrees.cleanup(&worktree) {
            warn!(workflow_id = %workflow.id, error = %e, "worktree cleanup failed");
        }

        // Record the merge step under its grimoire name and advance past it.
        let step_name = self
            .registry
            .get(&workflow.grimoire)
            .ok()
            .and_then(|g| g.steps.get(workflow.current_step).map(|s| s.name.clone()))
            .unwrap_or_else(|| "merge".to_string());
        workflow.record_step(StepResult {
            step_name,
            step_type: "merge".to_string(),
            success: true,
            exit_code: None,
            output: String::new(),
            output_var: None,
            skipped: false,
            started_at,
            ended_at: Utc::now(),
            error: None,
        });
        workflow.current_step += 1;
        workflow.status = WorkflowStatus::Running;
        workflow.conflicts = Vec::new();
        self.storage.checkpoint_workflow(&workflow).await?;

        info!(workflow_id = %workflow.id, task_id = %task.id, "merge approved");
        self.publish_workflow(EventType::WorkflowResumed, &workflow).await;

        // Remaining steps (usually none) run through the normal driver.
        self.engine.spawn_workflow(workflow.clone());

        Ok(MergeApproval {
            status: "merged".to_string(),
            workflow_id: workflow.id,
        })
    }

    /// Reject a pending merge: abort the worktree, block the workflow and
    /// its task. The worktree itself is kept for a later retry.
    pub async fn reject(&self, workflow_id: &Id, reason: Option<&str>) -> Result<()> {
        let mut workflow = self.storage.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::PendingMerge {
            return Err(ReviewError::NotPendingMerge(workflow_id.to_string()));
        }

        if let Some(path) = workflow.worktree_path.clone() {
            if let Err(e) = self.worktrees.abort(PathBuf::from(path).as_path()) {
                warn!(workflow_id = %workflow.id, error = %e, "worktree abort failed");
            }
        }

        workflow.status = WorkflowStatus::Blocked;
        workflow.error = Some(
            reason
                .filter(|r| !r.trim().is_empty())
                .map(|r| format!("merge_rejected: {}", r.trim()))
                .unwrap_or_else(|| "merge_rejected".to_string()),
        );
        self.storage
            .complete_workflow(&workflow, TaskStatus::Blocked)
            .await?;

        info!(workflow_id = %workflow.id, "merge rejected");
        self.publish_workflow(EventType::WorkflowBlocked, &workflow).await;
        let task = self.storage.get_task(&workflow.task_id).await?;
        if let Err(e) = self
            .bus
            .publish(
                EventType::TaskUpdated,
                "task",
                &task.id,
                EventPayload::Task(TaskEventPayload {
                    task_id: task.id.clone(),
                    status: task.status,
                    workflow_id: Some(workflow.id.clone()),
                }),
            )
            .await
        {
            warn!(error = %e, "failed to publish task event");
        }
        Ok(())
    }

    async fn publish_workflow(&self, event_type: EventType, workflow: &coven_core::Workflow) {
        if let Err(e) = self
            .bus
            .publish(
                event_type,
                "workflow",
                workflow.id.as_ref(),
                EventPayload::Workflow(WorkflowEventPayload {
                    workflow_id: workflow.id.clone(),
                    task_id: workflow.task_id.clone(),
                    grimoire: workflow.grimoire.clone(),
                    status: workflow.status,
                    error: workflow.error.clone(),
                    conflicts: workflow.conflicts.clone(),
                }),
            )
            .await
        {
            warn!(error = %e, "failed to publish workflow event");
        }
    }
}
