//! Scheduler: task polling, atomic claims, and background sweeps.
//!
//! Polls the task source on an interval, claims open tasks through the
//! store, and hands claimed workflows to the engine. Claims are deferred
//! while the global agent cap is exhausted. Background jobs recover stale
//! claims and run retention sweeps.

use chrono::Utc;
use coven_core::{Config, ErrorKind, TaskStatus, WorkflowStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::engine::WorkflowEngine;
use crate::registry::GrimoireRegistry;
use crate::storage::{Storage, StorageError};
use crate::tracker::TaskSource;

/// How often the stale-claim and retention sweeps run.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("scheduler shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Drives claiming and background maintenance.
pub struct Scheduler {
    storage: Arc<Storage>,
    engine: Arc<WorkflowEngine>,
    registry: Arc<GrimoireRegistry>,
    source: Arc<dyn TaskSource>,
    config: Config,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        engine: Arc<WorkflowEngine>,
        registry: Arc<GrimoireRegistry>,
        source: Arc<dyn TaskSource>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            engine,
            registry,
            source,
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the poll loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(100));
        let mut sweep_elapsed = Duration::ZERO;

        loop {
            if self.is_shutdown() {
                info!("scheduler stopped");
                return;
            }

            if let Err(e) = self.poll_once().await {
                error!(error = %e, "scheduler poll failed");
            }

            sweep_elapsed += poll_interval;
            if sweep_elapsed >= SWEEP_INTERVAL {
                sweep_elapsed = Duration::ZERO;
                if let Err(e) = self.recover_stale_claims().await {
                    warn!(error = %e, "stale claim sweep failed");
                }
                if let Err(e) = self.retention_sweep().await {
                    warn!(error = %e, "retention sweep failed");
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// One poll cycle: claim every eligible open task, deferring when the
    /// agent cap leaves no headroom.
    pub async fn poll_once(&self) -> Result<usize> {
        let tasks = self.source.poll().await?;
        let mut claimed = 0;

        for task in tasks {
            if self.is_shutdown() {
                return Err(SchedulerError::Shutdown);
            }
            if self.engine.agent_permits().available_permits() == 0 {
                // Every agent slot is busy; leave the rest for the next poll.
                break;
            }

            let grimoire = self.registry.resolve_name(&task, &self.config);
            if self.registry.get(&grimoire).is_err() {
                warn!(
                    task_id = %task.id,
                    grimoire = %grimoire,
                    "skipping task: grimoire resolution failed"
                );
                continue;
            }

            match self
                .storage
                .claim_task_and_start_workflow(&task.id, &grimoire)
                .await
            {
                Ok(workflow) => {
                    info!(
                        task_id = %task.id,
                        workflow_id = %workflow.id,
                        grimoire = %grimoire,
                        "claimed task"
                    );
                    self.engine.spawn_workflow(workflow);
                    claimed += 1;
                }
                Err(StorageError::AlreadyClaimed(_)) => {
                    // Lost the race; someone else owns it now.
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(claimed)
    }

    /// Mark running workflows nobody is driving as blocked with
    /// `stale_claim` once their checkpoint is old enough.
    pub async fn recover_stale_claims(&self) -> Result<usize> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.stale_claim_timeout_sec as i64);
        let stale = self.storage.list_stale_workflows(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let active = self.engine.active_workflows().await;
        let mut recovered = 0;
        for mut workflow in stale {
            if active.contains(&workflow.id) {
                continue;
            }
            warn!(
                workflow_id = %workflow.id,
                task_id = %workflow.task_id,
                "recovering stale claim"
            );
            workflow.status = WorkflowStatus::Blocked;
            workflow.error = Some(ErrorKind::StaleClaim.as_str().to_string());
            self.storage
                .complete_workflow(&workflow, TaskStatus::Blocked)
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Apply configured retention to events and finished workflows.
    pub async fn retention_sweep(&self) -> Result<()> {
        self.storage
            .retention_sweep(
                Utc::now(),
                chrono::Duration::hours(self.config.event_retention_hours as i64),
                chrono::Duration::hours(self.config.workflow_retention_hours as i64),
            )
            .await?;
        Ok(())
    }
}
