//! The workflow engine: interprets a grimoire against a claimed task.
//!
//! One engine drives every workflow. Each workflow runs in its own tokio
//! task under a cancellation token derived from the daemon's root token, and
//! checkpoints to the store at every step boundary. Suspension points (child
//! processes, worktree operations, awaited approvals) never hold a store
//! transaction.

use chrono::Utc;
use coven_core::events::{
    AgentEventPayload, AgentOutputPayload, EventPayload, EventType, QuestionEventPayload,
    ReviewCheckPayload, StepCompletedPayload, TaskEventPayload, WorkflowEventPayload,
};
use coven_core::types::step_task_id;
use coven_core::{
    Agent, AgentStatus, Config, DeliveryStatus, ErrorKind, Grimoire, Id, OnMaxIterations,
    Question, Step, StepAction, StepKind, StepResult, Task, TaskStatus, TemplateContext, Workflow,
    WorkflowStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::process::{OutputLine, OutputStream, ProcessManager, SpawnSpec, SpawnedChild};
use crate::questions::QuestionDetector;
use crate::registry::GrimoireRegistry;
use crate::storage::{Storage, StorageError};
use crate::worktree::{WorktreeError, WorktreeProvider};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("bus error: {0}")]
    Bus(#[from] crate::bus::BusError),
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("grimoire resolution failed: {0}")]
    GrimoireResolution(#[from] crate::registry::RegistryError),
    #[error("workflow not in a retryable state: {0}")]
    NotRetryable(String),
    #[error("workflow cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// How a sequence of steps concluded.
enum RunOutcome {
    /// Every step ran (or was skipped); the sequence is done.
    Completed,
    /// An inner step requested `exit_loop`; carries the step's success.
    ExitLoop(bool),
    /// Transition the workflow to blocked.
    Blocked(String),
    /// Transition the workflow to failed.
    Failed(String),
    /// A reviewed merge parked the workflow; suspend without finishing.
    PendingMerge,
}

/// The interpreter for grimoire-driven workflows.
pub struct WorkflowEngine {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    processes: Arc<ProcessManager>,
    worktrees: Arc<dyn WorktreeProvider>,
    registry: Arc<GrimoireRegistry>,
    config: Config,
    base_branch: String,
    /// Global cap on concurrently running agent steps.
    agent_permits: Arc<Semaphore>,
    /// Per-workflow cancellation tokens, children of the root token.
    tokens: Mutex<HashMap<Id, CancellationToken>>,
    root_token: CancellationToken,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine").finish_non_exhaustive()
    }
}

/// Per-run mutable state threaded through the interpreter.
struct ExecCx {
    workflow: Workflow,
    task: Task,
    worktree: PathBuf,
    token: CancellationToken,
    /// Workflow-level deadline, armed when the grimoire declares a timeout.
    deadline: Option<Instant>,
    /// Loop iteration scope, innermost last.
    loop_scopes: Vec<(u32, u32)>,
    /// Process-manager keys spawned during this run, released at the end.
    ran_keys: Vec<String>,
}

impl WorkflowEngine {
    pub fn new(
        storage: Arc<Storage>,
        bus: Arc<EventBus>,
        processes: Arc<ProcessManager>,
        worktrees: Arc<dyn WorktreeProvider>,
        registry: Arc<GrimoireRegistry>,
        config: Config,
        base_branch: String,
        root_token: CancellationToken,
    ) -> Self {
        let max_agents = config.max_concurrent_agents.max(1);
        Self {
            storage,
            bus,
            processes,
            worktrees,
            registry,
            config,
            base_branch,
            agent_permits: Arc::new(Semaphore::new(max_agents)),
            tokens: Mutex::new(HashMap::new()),
            root_token,
        }
    }

    pub fn agent_permits(&self) -> &Arc<Semaphore> {
        &self.agent_permits
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Ids of workflows currently driven by this engine.
    pub async fn active_workflows(&self) -> Vec<Id> {
        self.tokens.lock().await.keys().cloned().collect()
    }

    /// Spawn a tokio task driving the workflow to a suspension or terminal
    /// state. Errors inside the driver mark the workflow failed.
    pub fn spawn_workflow(self: &Arc<Self>, workflow: Workflow) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let workflow_id = workflow.id.clone();
            if let Err(e) = engine.run_workflow(workflow).await {
                if matches!(e, EngineError::Cancelled) {
                    return;
                }
                error!(workflow_id = %workflow_id, error = %e, "workflow driver failed");
                if let Err(fail_err) = engine
                    .fail_workflow_by_id(&workflow_id, ErrorKind::InternalError.as_str())
                    .await
                {
                    warn!(
                        workflow_id = %workflow_id,
                        error = %fail_err,
                        "failed to record workflow failure"
                    );
                }
            }
        });
    }

    /// Drive a workflow from its resume point to suspension or completion.
    pub async fn run_workflow(&self, workflow: Workflow) -> Result<()> {
        let workflow_id = workflow.id.clone();
        let token = self.register_token(&workflow_id).await;
        let result = self.run_workflow_inner(workflow, token).await;
        // Token cleanup on every exit path, including errors and cancel.
        self.remove_token(&workflow_id).await;
        result
    }

    async fn run_workflow_inner(
        &self,
        mut workflow: Workflow,
        token: CancellationToken,
    ) -> Result<()> {
        let workflow_id = workflow.id.clone();
        let task = self.storage.get_task(&workflow.task_id).await?;

        let grimoire = match self.registry.get(&workflow.grimoire) {
            Ok(g) => g.clone(),
            Err(e) => {
                workflow.status = WorkflowStatus::Failed;
                workflow.error = Some(ErrorKind::GrimoireResolutionFailed.as_str().to_string());
                workflow.finished_at = Some(Utc::now());
                self.storage
                    .complete_workflow(&workflow, TaskStatus::Blocked)
                    .await?;
                self.publish_workflow_event(EventType::WorkflowFailed, &workflow)
                    .await;
                return Err(e.into());
            }
        };

        let is_fresh = workflow.current_step == 0 && workflow.completed_steps.is_empty();
        if is_fresh {
            self.publish_task_event(EventType::TaskStarted, &task, Some(&workflow_id))
                .await;
            self.publish_workflow_event(EventType::WorkflowStarted, &workflow)
                .await;
        } else {
            self.publish_workflow_event(EventType::WorkflowResumed, &workflow)
                .await;
        }

        // Acquire (or re-acquire) the worktree before interpreting.
        let worktree = match self.worktrees.create(&task.id, &self.base_branch) {
            Ok(path) => path,
            Err(e) => {
                workflow.status = WorkflowStatus::Failed;
                workflow.error = Some(ErrorKind::WorktreeError.as_str().to_string());
                workflow.finished_at = Some(Utc::now());
                self.storage
                    .complete_workflow(&workflow, TaskStatus::Blocked)
                    .await?;
                self.publish_workflow_event(EventType::WorkflowFailed, &workflow)
                    .await;
                return Err(e.into());
            }
        };
        workflow.worktree_path = Some(worktree.display().to_string());
        self.storage.checkpoint_workflow(&workflow).await?;

        let deadline = grimoire.timeout.map(|t| Instant::now() + t);
        let mut cx = ExecCx {
            workflow,
            task,
            worktree,
            token,
            deadline,
            loop_scopes: Vec::new(),
            ran_keys: Vec::new(),
        };

        let outcome = self.run_top_level(&grimoire, &mut cx).await?;
        let ExecCx {
            mut workflow,
            ran_keys,
            ..
        } = cx;

        match outcome {
            RunOutcome::Completed => {
                workflow.status = WorkflowStatus::Completed;
                workflow.finished_at = Some(Utc::now());
                self.storage
                    .complete_workflow(&workflow, TaskStatus::Closed)
                    .await?;
                self.publish_workflow_event(EventType::WorkflowCompleted, &workflow)
                    .await;
                let task = self.storage.get_task(&workflow.task_id).await?;
                self.publish_task_event(EventType::TaskCompleted, &task, Some(&workflow.id))
                    .await;
                if let Some(path) = &workflow.worktree_path {
                    if let Err(e) = self.worktrees.cleanup(PathBuf::from(path).as_path()) {
                        warn!(workflow_id = %workflow.id, error = %e, "worktree cleanup failed");
                    }
                }
                self.release_ran(&ran_keys);
                info!(workflow_id = %workflow.id, "workflow completed");
            }
            RunOutcome::Failed(kind) => {
                workflow.status = WorkflowStatus::Failed;
                workflow.error = Some(kind);
                workflow.finished_at = Some(Utc::now());
                self.storage
                    .complete_workflow(&workflow, TaskStatus::Blocked)
                    .await?;
                self.publish_workflow_event(EventType::WorkflowFailed, &workflow)
                    .await;
                let task = self.storage.get_task(&workflow.task_id).await?;
                self.publish_task_event(EventType::TaskFailed, &task, Some(&workflow.id))
                    .await;
                // Worktree stays for inspection until retry or cancel.
                self.release_ran(&ran_keys);
            }
            RunOutcome::Blocked(kind) => {
                workflow.status = WorkflowStatus::Blocked;
                workflow.error = Some(kind);
                self.storage
                    .complete_workflow(&workflow, TaskStatus::Blocked)
                    .await?;
                self.publish_workflow_event(EventType::WorkflowBlocked, &workflow)
                    .await;
                let task = self.storage.get_task(&workflow.task_id).await?;
                self.publish_task_event(EventType::TaskUpdated, &task, Some(&workflow.id))
                    .await;
            }
            RunOutcome::PendingMerge => {
                workflow.status = WorkflowStatus::PendingMerge;
                self.storage.checkpoint_workflow(&workflow).await?;
                self.publish_workflow_event(EventType::WorkflowPendingMerge, &workflow)
                    .await;
            }
            RunOutcome::ExitLoop(_) => {
                // Validation rejects exit_loop outside loops; reaching this
                // is an interpreter bug.
                return self.fail_workflow(workflow, ErrorKind::InternalError.as_str()).await;
            }
        }
        Ok(())
    }

    /// Interpret the top-level step list from the workflow's resume point.
    async fn run_top_level(&self, grimoire: &Grimoire, cx: &mut ExecCx) -> Result<RunOutcome> {
        loop {
            if cx.token.is_cancelled() {
                return self.handle_cancel(cx).await;
            }
            let i = cx.workflow.current_step;
            if i >= grimoire.steps.len() {
                return Ok(RunOutcome::Completed);
            }
            let step = &grimoire.steps[i];

            match self.run_step_sequence_item(step, cx).await? {
                RunOutcome::Completed => {
                    cx.workflow.current_step += 1;
                    self.storage.checkpoint_workflow(&cx.workflow).await?;
                }
                RunOutcome::PendingMerge => return Ok(RunOutcome::PendingMerge),
                other @ (RunOutcome::Blocked(_) | RunOutcome::Failed(_)) => {
                    // Resume point is preserved: current_step still names the
                    // failing step.
                    self.storage.checkpoint_workflow(&cx.workflow).await?;
                    return Ok(other);
                }
                RunOutcome::ExitLoop(_) => return Ok(RunOutcome::Failed(
                    ErrorKind::InternalError.as_str().to_string(),
                )),
            }
        }
    }

    /// Run one step (including a whole loop) and fold its action into a
    /// sequence-level outcome. `Completed` means "advance past this step".
    async fn run_step_sequence_item(&self, step: &Step, cx: &mut ExecCx) -> Result<RunOutcome> {
        if cx.token.is_cancelled() {
            return self.handle_cancel(cx).await;
        }
        if self.workflow_deadline_expired(cx) {
            self.record_timeout_result(step, cx, ErrorKind::WorkflowTimeout)
                .await?;
            return Ok(RunOutcome::Failed(
                ErrorKind::WorkflowTimeout.as_str().to_string(),
            ));
        }

        // Conditions are evaluated once at dispatch.
        if let Some(when) = &step.when {
            let ctx = self.template_context(step, cx);
            if !ctx.eval_condition(when) {
                let now = Utc::now();
                let result = StepResult {
                    step_name: step.name.clone(),
                    step_type: step.kind.type_name().to_string(),
                    success: true,
                    exit_code: None,
                    output: String::new(),
                    output_var: step.output.clone(),
                    skipped: true,
                    started_at: now,
                    ended_at: now,
                    error: None,
                };
                self.finish_step(step, result, cx).await?;
                return Ok(RunOutcome::Completed);
            }
        }

        match &step.kind {
            StepKind::Script { command } => {
                let result = self.execute_script(step, command, cx).await?;
                self.step_outcome(step, result, cx).await
            }
            StepKind::Agent { spell } => {
                let result = self.execute_agent(step, spell, cx).await?;
                self.step_outcome(step, result, cx).await
            }
            StepKind::Loop {
                max_iterations,
                on_max_iterations,
                steps,
            } => {
                self.execute_loop(step, *max_iterations, *on_max_iterations, steps, cx)
                    .await
            }
            StepKind::Merge { require_review } => {
                self.execute_merge(step, *require_review, cx).await
            }
        }
    }

    /// Apply the step's on_success / on_fail action.
    async fn step_outcome(
        &self,
        step: &Step,
        result: StepResult,
        cx: &mut ExecCx,
    ) -> Result<RunOutcome> {
        let success = result.success;
        let error = result.error.clone();
        self.finish_step(step, result, cx).await?;

        let action = if success {
            step.success_action()
        } else {
            step.fail_action()
        };
        Ok(match action {
            StepAction::Continue => RunOutcome::Completed,
            StepAction::ExitLoop => RunOutcome::ExitLoop(success),
            StepAction::Block => RunOutcome::Blocked(
                error.unwrap_or_else(|| format!("step {} blocked", step.name)),
            ),
            StepAction::Fail => RunOutcome::Failed(
                error.unwrap_or_else(|| format!("step {} failed", step.name)),
            ),
        })
    }

    /// Record a result, bind its output variable, publish `step.completed`,
    /// and checkpoint.
    async fn finish_step(&self, step: &Step, result: StepResult, cx: &mut ExecCx) -> Result<()> {
        if let (Some(var), false) = (&step.output, result.skipped) {
            cx.workflow
                .bind_variable(var.clone(), result.output.trim().to_string());
        }
        let payload = EventPayload::StepCompleted(StepCompletedPayload {
            workflow_id: cx.workflow.id.clone(),
            step_name: result.step_name.clone(),
            step_type: result.step_type.clone(),
            success: result.success,
            skipped: result.skipped,
            exit_code: result.exit_code,
            error: result.error.clone(),
        });
        cx.workflow.record_step(result);
        self.storage.checkpoint_workflow(&cx.workflow).await?;
        self.publish(
            EventType::StepCompleted,
            "workflow",
            cx.workflow.id.clone().as_ref(),
            payload,
        )
        .await;
        Ok(())
    }

    // --- Script steps ---

    async fn execute_script(
        &self,
        step: &Step,
        command: &str,
        cx: &mut ExecCx,
    ) -> Result<StepResult> {
        let started_at = Utc::now();
        let ctx = self.template_context(step, cx);
        let rendered = match ctx.render(command) {
            Ok(cmd) => cmd,
            Err(e) => {
                return Ok(StepResult {
                    step_name: step.name.clone(),
                    step_type: "script".to_string(),
                    success: false,
                    exit_code: None,
                    output: e.to_string(),
                    output_var: step.output.clone(),
                    skipped: false,
                    started_at,
                    ended_at: Utc::now(),
                    error: Some(ErrorKind::TemplateError.as_str().to_string()),
                });
            }
        };

        let task_key = step_task_id(&cx.workflow.id, &step.name);
        let child = self
            .processes
            .spawn(SpawnSpec {
                task_key: task_key.clone(),
                argv: vec!["sh".to_string(), "-c".to_string(), rendered],
                cwd: cx.worktree.clone(),
                env: vec![
                    ("COVEN_TASK_ID".to_string(), cx.task.id.clone()),
                    ("COVEN_WORKFLOW_ID".to_string(), cx.workflow.id.to_string()),
                ],
                stdin_open: false,
            })
            .await?;
        cx.ran_keys.push(task_key.clone());

        let wait = self
            .drive_script(child, step.timeout, &task_key, cx)
            .await?;
        let ended_at = Utc::now();

        Ok(match wait {
            ChildWait::Exited { code, output } => StepResult {
                step_name: step.name.clone(),
                step_type: "script".to_string(),
                success: code == 0,
                exit_code: Some(code),
                output: self.cap_output(output),
                output_var: step.output.clone(),
                skipped: false,
                started_at,
                ended_at,
                error: (code != 0).then(|| format!("exit code {code}")),
            },
            ChildWait::StepTimeout { output } => StepResult {
                step_name: step.name.clone(),
                step_type: "script".to_string(),
                success: false,
                exit_code: None,
                output: self.cap_output(output),
                output_var: step.output.clone(),
                skipped: false,
                started_at,
                ended_at,
                error: Some(ErrorKind::StepTimeout.as_str().to_string()),
            },
            ChildWait::WorkflowTimeout { output } => StepResult {
                step_name: step.name.clone(),
                step_type: "script".to_string(),
                success: false,
                exit_code: None,
                output: self.cap_output(output),
                output_var: step.output.clone(),
                skipped: false,
                started_at,
                ended_at,
                error: Some(ErrorKind::WorkflowTimeout.as_str().to_string()),
            },
            ChildWait::Cancelled => return Err(EngineError::Cancelled),
        })
    }

    /// Await a script child while collecting output, honoring the step
    /// timeout, the workflow deadline, and cancellation.
    async fn drive_script(
        &self,
        mut child: SpawnedChild,
        step_timeout: Option<Duration>,
        task_key: &str,
        cx: &ExecCx,
    ) -> Result<ChildWait> {
        let mut output = String::new();
        let step_deadline = step_timeout.map(|t| Instant::now() + t);

        loop {
            let step_sleep = sleep_until_opt(step_deadline);
            let wf_sleep = sleep_until_opt(cx.deadline);
            tokio::select! {
                line = child.lines.recv() => {
                    if let Some(line) = line {
                        append_line(&mut output, &line);
                    } else {
                        // Readers finished; the exit code follows shortly.
                        let code = wait_exit(&mut child.exit).await;
                        return Ok(ChildWait::Exited { code, output });
                    }
                }
                changed = child.exit.changed() => {
                    let exited = changed.is_err() || child.exit.borrow().is_some();
                    if exited {
                        drain_lines(&mut child.lines, &mut output);
                        let code = child.exit.borrow().unwrap_or(-1);
                        return Ok(ChildWait::Exited { code, output });
                    }
                }
                () = step_sleep => {
                    self.processes.kill(task_key, None).await?;
                    drain_lines(&mut child.lines, &mut output);
                    return Ok(ChildWait::StepTimeout { output });
                }
                () = wf_sleep => {
                    self.processes.kill(task_key, None).await?;
                    drain_lines(&mut child.lines, &mut output);
                    return Ok(ChildWait::WorkflowTimeout { output });
                }
                () = cx.token.cancelled() => {
                    self.processes.kill(task_key, None).await?;
                    return Ok(ChildWait::Cancelled);
                }
            }
        }
    }

    // --- Agent steps ---

    async fn execute_agent(&self, step: &Step, spell: &str, cx: &mut ExecCx) -> Result<StepResult> {
        let started_at = Utc::now();
        let ctx = self.template_context(step, cx);
        let prompt = match ctx.render(spell) {
            Ok(p) => p,
            Err(e) => {
                return Ok(StepResult {
                    step_name: step.name.clone(),
                    step_type: "agent".to_string(),
                    success: false,
                    exit_code: None,
                    output: e.to_string(),
                    output_var: step.output.clone(),
                    skipped: false,
                    started_at,
                    ended_at: Utc::now(),
                    error: Some(ErrorKind::TemplateError.as_str().to_string()),
                });
            }
        };

        // Count against the global agent cap for the duration of the step.
        let _permit = Arc::clone(&self.agent_permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled)?;

        let task_key = step_task_id(&cx.workflow.id, &step.name);
        let mut argv = vec![self.config.agent_bin.display().to_string()];
        argv.extend(self.config.agent_args.iter().cloned());
        argv.push(prompt);

        let child = self
            .processes
            .spawn(SpawnSpec {
                task_key: task_key.clone(),
                argv,
                cwd: cx.worktree.clone(),
                env: vec![
                    ("COVEN_TASK_ID".to_string(), cx.task.id.clone()),
                    ("COVEN_WORKFLOW_ID".to_string(), cx.workflow.id.to_string()),
                ],
                stdin_open: true,
            })
            .await?;
        cx.ran_keys.push(task_key.clone());

        let agent = Agent {
            step_task_id: task_key.clone(),
            workflow_id: cx.workflow.id.clone(),
            task_id: cx.task.id.clone(),
            pid: Some(child.pid),
            status: AgentStatus::Running,
            worktree: Some(cx.worktree.display().to_string()),
            branch: None,
            started_at,
        };
        self.storage.upsert_agent(&agent).await?;
        self.publish(
            EventType::AgentStarted,
            "agent",
            &task_key,
            EventPayload::Agent(AgentEventPayload {
                step_task_id: task_key.clone(),
                workflow_id: cx.workflow.id.clone(),
                task_id: cx.task.id.clone(),
                pid: Some(child.pid),
                exit_code: None,
            }),
        )
        .await;

        let wait = self.drive_agent(child, step, &task_key, cx).await?;
        let ended_at = Utc::now();

        let (status, event, result) = match wait {
            ChildWait::Exited { code, output } => {
                let success = code == 0;
                (
                    if success {
                        AgentStatus::Completed
                    } else {
                        AgentStatus::Failed
                    },
                    if success {
                        EventType::AgentCompleted
                    } else {
                        EventType::AgentFailed
                    },
                    StepResult {
                        step_name: step.name.clone(),
                        step_type: "agent".to_string(),
                        success,
                        exit_code: Some(code),
                        output: self.cap_output(output),
                        output_var: step.output.clone(),
                        skipped: false,
                        started_at,
                        ended_at,
                        error: (!success).then(|| format!("exit code {code}")),
                    },
                )
            }
            ChildWait::StepTimeout { output } => (
                AgentStatus::Killed,
                EventType::AgentKilled,
                StepResult {
                    step_name: step.name.clone(),
                    step_type: "agent".to_string(),
                    success: false,
                    exit_code: None,
                    output: self.cap_output(output),
                    output_var: step.output.clone(),
                    skipped: false,
                    started_at,
                    ended_at,
                    error: Some(ErrorKind::StepTimeout.as_str().to_string()),
                },
            ),
            ChildWait::WorkflowTimeout { output } => (
                AgentStatus::Killed,
                EventType::AgentKilled,
                StepResult {
                    step_name: step.name.clone(),
                    step_type: "agent".to_string(),
                    success: false,
                    exit_code: None,
                    output: self.cap_output(output),
                    output_var: step.output.clone(),
                    skipped: false,
                    started_at,
                    ended_at,
                    error: Some(ErrorKind::WorkflowTimeout.as_str().to_string()),
                },
            ),
            ChildWait::Cancelled => {
                self.storage
                    .update_agent_status(&task_key, AgentStatus::Killed)
                    .await?;
                self.publish(
                    EventType::AgentKilled,
                    "agent",
                    &task_key,
                    EventPayload::Agent(AgentEventPayload {
                        step_task_id: task_key.clone(),
                        workflow_id: cx.workflow.id.clone(),
                        task_id: cx.task.id.clone(),
                        pid: None,
                        exit_code: None,
                    }),
                )
                .await;
                return Err(EngineError::Cancelled);
            }
        };

        self.storage.update_agent_status(&task_key, status).await?;
        self.publish(
            event,
            "agent",
            &task_key,
            EventPayload::Agent(AgentEventPayload {
                step_task_id: task_key.clone(),
                workflow_id: cx.workflow.id.clone(),
                task_id: cx.task.id.clone(),
                pid: None,
                exit_code: result.exit_code,
            }),
        )
        .await;
        Ok(result)
    }

    /// Await an agent child: stream output events, detect questions, honor
    /// timeouts and cancellation. A detected question pauses nothing; the
    /// step stays active (and its timers keep counting) until the agent
    /// exits or an answer arrives over stdin.
    async fn drive_agent(
        &self,
        mut child: SpawnedChild,
        step: &Step,
        task_key: &str,
        cx: &ExecCx,
    ) -> Result<ChildWait> {
        let mut output = String::new();
        let mut detector = QuestionDetector::new(self.config.question_window_lines);
        let step_deadline = step.timeout.map(|t| Instant::now() + t);

        loop {
            let step_sleep = sleep_until_opt(step_deadline);
            let wf_sleep = sleep_until_opt(cx.deadline);
            tokio::select! {
                line = child.lines.recv() => {
                    if let Some(line) = line {
                        self.on_agent_line(&line, &mut detector, task_key, cx).await;
                        append_line(&mut output, &line);
                    } else {
                        let code = wait_exit(&mut child.exit).await;
                        return Ok(ChildWait::Exited { code, output });
                    }
                }
                changed = child.exit.changed() => {
                    let exited = changed.is_err() || child.exit.borrow().is_some();
                    if exited {
                        let mut rest = Vec::new();
                        while let Ok(line) = child.lines.try_recv() {
                            rest.push(line);
                        }
                        for line in rest {
                            self.on_agent_line(&line, &mut detector, task_key, cx).await;
                            append_line(&mut output, &line);
                        }
                        let code = child.exit.borrow().unwrap_or(-1);
                        return Ok(ChildWait::Exited { code, output });
                    }
                }
                () = step_sleep => {
                    self.processes.kill(task_key, None).await?;
                    drain_lines(&mut child.lines, &mut output);
                    return Ok(ChildWait::StepTimeout { output });
                }
                () = wf_sleep => {
                    self.processes.kill(task_key, None).await?;
                    drain_lines(&mut child.lines, &mut output);
                    return Ok(ChildWait::WorkflowTimeout { output });
                }
                () = cx.token.cancelled() => {
                    self.processes.kill(task_key, None).await?;
                    return Ok(ChildWait::Cancelled);
                }
            }
        }
    }

    async fn on_agent_line(
        &self,
        line: &OutputLine,
        detector: &mut QuestionDetector,
        task_key: &str,
        cx: &ExecCx,
    ) {
        self.publish(
            EventType::AgentOutput,
            "agent",
            task_key,
            EventPayload::AgentOutput(AgentOutputPayload {
                step_task_id: task_key.to_string(),
                seq: line.seq,
                stream: line.stream.as_str().to_string(),
                text: line.text.clone(),
            }),
        )
        .await;

        if line.stream == OutputStream::Stderr {
            return;
        }
        if let Some(detected) = detector.feed(&line.text) {
            let question = Question {
                id: Id::new(),
                task_id: cx.task.id.clone(),
                step_task_id: task_key.to_string(),
                text: detected.text,
                suggested_answers: detected.suggested_answers,
                asked_at: Utc::now(),
                answer: None,
                answered_at: None,
                delivery: DeliveryStatus::Pending,
                delivery_error: None,
            };
            if let Err(e) = self.storage.insert_question(&question).await {
                warn!(task_key = %task_key, error = %e, "failed to persist question");
                return;
            }
            self.publish(
                EventType::QuestionsAsked,
                "question",
                question.id.clone().as_ref(),
                EventPayload::Question(QuestionEventPayload {
                    question_id: question.id.clone(),
                    task_id: question.task_id.clone(),
                    step_task_id: question.step_task_id.clone(),
                    text: question.text.clone(),
                    suggested_answers: question.suggested_answers.clone(),
                    answer: None,
                    delivered: None,
                }),
            )
            .await;
            info!(task_key = %task_key, question_id = %question.id, "question detected");
        }
    }

    // --- Loop steps ---

    async fn execute_loop(
        &self,
        step: &Step,
        max_iterations: u32,
        on_max: OnMaxIterations,
        inner: &[Step],
        cx: &mut ExecCx,
    ) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let mut exited_with: Option<bool> = None;

        'iterations: for iteration in 1..=max_iterations {
            cx.loop_scopes.push((iteration, max_iterations));
            let iteration_result = self.run_inner_sequence(inner, cx).await;
            cx.loop_scopes.pop();

            match iteration_result? {
                RunOutcome::Completed => {}
                RunOutcome::ExitLoop(success) => {
                    exited_with = Some(success);
                    break 'iterations;
                }
                RunOutcome::PendingMerge => return Ok(RunOutcome::PendingMerge),
                other @ (RunOutcome::Blocked(_) | RunOutcome::Failed(_)) => return Ok(other),
            }
        }

        let (success, outcome) = match exited_with {
            Some(success) => (success, RunOutcome::Completed),
            // All iterations ran without an exit_loop.
            None => match on_max {
                OnMaxIterations::Continue => (true, RunOutcome::Completed),
                OnMaxIterations::Block => (
                    false,
                    RunOutcome::Blocked("max_iterations".to_string()),
                ),
                OnMaxIterations::Fail => (
                    false,
                    RunOutcome::Failed("max_iterations".to_string()),
                ),
            },
        };

        let result = StepResult {
            step_name: step.name.clone(),
            step_type: "loop".to_string(),
            success,
            exit_code: None,
            output: String::new(),
            output_var: None,
            skipped: false,
            started_at,
            ended_at: Utc::now(),
            error: match &outcome {
                RunOutcome::Blocked(e) | RunOutcome::Failed(e) => Some(e.clone()),
                _ => None,
            },
        };
        self.finish_step(step, result, cx).await?;
        Ok(outcome)
    }

    /// Run a nested (loop body) step sequence. Unlike the top level, the
    /// workflow's `current_step` does not move; results are still recorded
    /// and checkpointed per step.
    ///
    /// Boxed: loops nest, so this future recurses through
    /// `run_step_sequence_item`.
    fn run_inner_sequence<'a>(
        &'a self,
        steps: &'a [Step],
        cx: &'a mut ExecCx,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RunOutcome>> + Send + 'a>> {
        Box::pin(async move {
            for step in steps {
                if cx.token.is_cancelled() {
                    return self.handle_cancel(cx).await;
                }
                match self.run_step_sequence_item(step, cx).await? {
                    RunOutcome::Completed => {}
                    other => return Ok(other),
                }
            }
            Ok(RunOutcome::Completed)
        })
    }

    // --- Merge steps ---

    async fn execute_merge(
        &self,
        step: &Step,
        require_review: bool,
        cx: &mut ExecCx,
    ) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let worktree = cx.worktree.clone();

        if require_review {
            // Probe only; the real merge happens on approval.
            let check = match self.worktrees.check(&worktree, &self.base_branch) {
                Ok(check) => check,
                Err(e) => {
                    let result = merge_step_result(
                        step,
                        started_at,
                        false,
                        Some(ErrorKind::WorktreeError.as_str().to_string()),
                    );
                    self.finish_step(step, result, cx).await?;
                    warn!(workflow_id = %cx.workflow.id, error = %e, "merge check failed");
                    return Ok(RunOutcome::Failed(
                        ErrorKind::WorktreeError.as_str().to_string(),
                    ));
                }
            };
            self.publish(
                EventType::ReviewCheckCompleted,
                "workflow",
                cx.workflow.id.clone().as_ref(),
                EventPayload::ReviewCheck(ReviewCheckPayload {
                    workflow_id: cx.workflow.id.clone(),
                    task_id: cx.task.id.clone(),
                    clean: check.success,
                    conflicts: check.conflicts.clone(),
                }),
            )
            .await;

            if !check.success {
                cx.workflow.conflicts = check.conflicts;
                let result = merge_step_result(
                    step,
                    started_at,
                    false,
                    Some(ErrorKind::MergeConflict.as_str().to_string()),
                );
                self.finish_step(step, result, cx).await?;
                return Ok(RunOutcome::Blocked(
                    ErrorKind::MergeConflict.as_str().to_string(),
                ));
            }
            // Clean: park for human approval without recording the step;
            // approval completes it and advances.
            return Ok(RunOutcome::PendingMerge);
        }

        let message = format!("coven: land {} ({})", cx.task.id, cx.task.title);
        match self.worktrees.merge(&worktree, &self.base_branch, &message) {
            Ok(outcome) if outcome.success => {
                if let Err(e) = self.worktrees.cleanup(&worktree) {
                    warn!(workflow_id = %cx.workflow.id, error = %e, "worktree cleanup failed");
                }
                let result = merge_step_result(step, started_at, true, None);
                self.step_outcome(step, result, cx).await
            }
            Ok(outcome) => {
                cx.workflow.conflicts = outcome.conflicts;
                let result = merge_step_result(
                    step,
                    started_at,
                    false,
                    Some(ErrorKind::MergeConflict.as_str().to_string()),
                );
                self.finish_step(step, result, cx).await?;
                Ok(RunOutcome::Blocked(
                    ErrorKind::MergeConflict.as_str().to_string(),
                ))
            }
            Err(e) => {
                warn!(workflow_id = %cx.workflow.id, error = %e, "merge failed");
                let result = merge_step_result(
                    step,
                    started_at,
                    false,
                    Some(ErrorKind::WorktreeError.as_str().to_string()),
                );
                self.step_outcome(step, result, cx).await
            }
        }
    }

    // --- Cancellation / retry / resume ---

    /// Cancel a workflow: kill its children, abort the worktree, mark it
    /// cancelled and the task blocked.
    pub async fn cancel_workflow(&self, workflow_id: &Id) -> Result<()> {
        let workflow = self.storage.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(EngineError::NotRetryable(workflow_id.to_string()));
        }

        // Signal the driver first; it kills the in-flight child.
        let token = self.tokens.lock().await.get(workflow_id).cloned();
        let driver_active = token.is_some();
        if let Some(token) = token {
            token.cancel();
        }

        if !driver_active {
            // Suspended workflow (blocked / pending_merge): finalize here.
            self.finalize_cancel(workflow).await?;
        }
        Ok(())
    }

    /// Terminal bookkeeping for a cancelled workflow.
    async fn finalize_cancel(&self, mut workflow: Workflow) -> Result<()> {
        if let Some(path) = workflow.worktree_path.clone() {
            let path = PathBuf::from(path);
            if let Err(e) = self.worktrees.abort(&path) {
                warn!(workflow_id = %workflow.id, error = %e, "worktree abort failed");
            }
            if let Err(e) = self.worktrees.cleanup(&path) {
                warn!(workflow_id = %workflow.id, error = %e, "worktree cleanup failed");
            }
        }
        workflow.status = WorkflowStatus::Cancelled;
        workflow.finished_at = Some(Utc::now());
        self.storage
            .complete_workflow(&workflow, TaskStatus::Blocked)
            .await?;
        self.publish_workflow_event(EventType::WorkflowCancelled, &workflow)
            .await;
        Ok(())
    }

    /// Cancellation observed inside the interpreter loop.
    ///
    /// Daemon shutdown (root token) leaves the workflow `running` so it
    /// resumes on restart; a per-workflow cancel finalizes it as cancelled.
    async fn handle_cancel(&self, cx: &mut ExecCx) -> Result<RunOutcome> {
        if self.root_token.is_cancelled() {
            self.storage.checkpoint_workflow(&cx.workflow).await?;
        } else {
            self.finalize_cancel(cx.workflow.clone()).await?;
        }
        self.release_ran(&cx.ran_keys);
        Err(EngineError::Cancelled)
    }

    /// Re-enter a failed or blocked workflow at its failing step.
    pub async fn retry_workflow(self: &Arc<Self>, workflow_id: &Id) -> Result<Workflow> {
        let mut workflow = self.storage.get_workflow(workflow_id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Failed | WorkflowStatus::Blocked
        ) {
            return Err(EngineError::NotRetryable(workflow_id.to_string()));
        }

        let task = self.storage.get_task(&workflow.task_id).await?;
        if task.status == TaskStatus::Blocked {
            self.storage
                .update_task_status(&task.id, TaskStatus::Open)
                .await?;
            self.storage
                .update_task_status(&task.id, TaskStatus::InProgress)
                .await?;
        }

        workflow.status = WorkflowStatus::Running;
        workflow.error = None;
        workflow.conflicts = Vec::new();
        workflow.finished_at = None;
        self.storage.checkpoint_workflow(&workflow).await?;
        self.spawn_workflow(workflow.clone());
        Ok(workflow)
    }

    /// Resume every non-terminal running workflow after a daemon restart.
    pub async fn resume_interrupted(self: &Arc<Self>) -> Result<Vec<Workflow>> {
        let workflows = self.storage.list_resumable_workflows().await?;
        for workflow in &workflows {
            info!(
                workflow_id = %workflow.id,
                task_id = %workflow.task_id,
                step = workflow.current_step,
                "resuming interrupted workflow"
            );
            self.spawn_workflow(workflow.clone());
        }
        Ok(workflows)
    }

    /// Mark a workflow failed outside the normal driver path.
    async fn fail_workflow_by_id(&self, workflow_id: &Id, kind: &str) -> Result<()> {
        let workflow = self.storage.get_workflow(workflow_id).await?;
        self.fail_workflow(workflow, kind).await
    }

    async fn fail_workflow(&self, mut workflow: Workflow, kind: &str) -> Result<()> {
        if workflow.status.is_terminal() {
            return Ok(());
        }
        workflow.status = WorkflowStatus::Failed;
        workflow.error = Some(kind.to_string());
        workflow.finished_at = Some(Utc::now());
        let task_status = self
            .storage
            .get_task(&workflow.task_id)
            .await
            .map(|t| {
                if t.status == TaskStatus::InProgress {
                    TaskStatus::Blocked
                } else {
                    t.status
                }
            })
            .unwrap_or(TaskStatus::Blocked);
        self.storage
            .complete_workflow(&workflow, task_status)
            .await?;
        self.publish_workflow_event(EventType::WorkflowFailed, &workflow)
            .await;
        Ok(())
    }

    // --- Helpers ---

    fn template_context(&self, step: &Step, cx: &ExecCx) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.set_task(&cx.task);
        for (name, value) in &cx.workflow.variables {
            ctx.set_variable(name.clone(), value.clone());
        }
        if let Some(last) = cx.workflow.completed_steps.last() {
            ctx.set_previous(last);
        }
        if let Some((iteration, max)) = cx.loop_scopes.last() {
            ctx.set_loop(*iteration, *max);
        }
        ctx.set_builtin("workflow.id", cx.workflow.id.to_string());
        ctx.set_builtin("workflow.grimoire", cx.workflow.grimoire.clone());
        ctx.set_builtin("workflow.worktree", cx.worktree.display().to_string());
        ctx.set_builtin("step.name", step.name.clone());
        ctx
    }

    fn workflow_deadline_expired(&self, cx: &ExecCx) -> bool {
        cx.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn record_timeout_result(
        &self,
        step: &Step,
        cx: &mut ExecCx,
        kind: ErrorKind,
    ) -> Result<()> {
        let now = Utc::now();
        let result = StepResult {
            step_name: step.name.clone(),
            step_type: step.kind.type_name().to_string(),
            success: false,
            exit_code: None,
            output: String::new(),
            output_var: None,
            skipped: false,
            started_at: now,
            ended_at: now,
            error: Some(kind.as_str().to_string()),
        };
        self.finish_step(step, result, cx).await
    }

    fn cap_output(&self, output: String) -> String {
        let cap = self.config.output_capture_bytes;
        if output.len() <= cap {
            return output;
        }
        // Keep the tail; find a char boundary.
        let mut start = output.len() - cap;
        while !output.is_char_boundary(start) {
            start += 1;
        }
        output[start..].to_string()
    }

    fn release_ran(&self, keys: &[String]) {
        for key in keys {
            self.processes.release(key);
        }
    }

    async fn register_token(&self, workflow_id: &Id) -> CancellationToken {
        let token = self.root_token.child_token();
        self.tokens
            .lock()
            .await
            .insert(workflow_id.clone(), token.clone());
        token
    }

    async fn remove_token(&self, workflow_id: &Id) {
        self.tokens.lock().await.remove(workflow_id);
    }

    async fn publish(
        &self,
        event_type: EventType,
        entity_kind: &str,
        entity_id: &str,
        payload: EventPayload,
    ) {
        if let Err(e) = self
            .bus
            .publish(event_type, entity_kind, entity_id, payload)
            .await
        {
            warn!(event = event_type.as_str(), error = %e, "failed to publish event");
        }
    }

    async fn publish_workflow_event(&self, event_type: EventType, workflow: &Workflow) {
        self.publish(
            event_type,
            "workflow",
            workflow.id.clone().as_ref(),
            EventPayload::Workflow(WorkflowEventPayload {
                workflow_id: workflow.id.clone(),
                task_id: workflow.task_id.clone(),
                grimoire: workflow.grimoire.clone(),
                status: workflow.status,
                error: workflow.error.clone(),
                conflicts: workflow.conflicts.clone(),
            }),
        )
        .await;
    }

    async fn publish_task_event(&self, event_type: EventType, task: &Task, workflow_id: Option<&Id>) {
        self.publish(
            event_type,
            "task",
            &task.id.clone(),
            EventPayload::Task(TaskEventPayload {
                task_id: task.id.clone(),
                status: task.status,
                workflow_id: workflow_id.cloned(),
            }),
        )
        .await;
    }
}

/// Outcome of awaiting one child process.
enum ChildWait {
    Exited { code: i32, output: String },
    StepTimeout { output: String },
    WorkflowTimeout { output: String },
    Cancelled,
}

fn merge_step_result(
    step: &Step,
    started_at: chrono::DateTime<Utc>,
    success: bool,
    error: Option<String>,
) -> StepResult {
    StepResult {
        step_name: step.name.clone(),
        step_type: "merge".to_string(),
        success,
        exit_code: None,
        output: String::new(),
        output_var: None,
        skipped: false,
        started_at,
        ended_at: Utc::now(),
        error,
    }
}

fn append_line(output: &mut String, line: &OutputLine) {
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(&line.text);
}

fn drain_lines(rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutputLine>, output: &mut String) {
    while let Ok(line) = rx.try_recv() {
        append_line(output, &line);
    }
}

async fn wait_exit(exit: &mut tokio::sync::watch::Receiver<Option<i32>>) -> i32 {
    loop {
        if let Some(code) = *exit.borrow() {
            return code;
        }
        if exit.changed().await.is_err() {
            return exit.borrow().unwrap_or(-1);
        }
    }
}

/// Sleep until an optional deadline; pends forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::{GitWorktrees, MergeOutcome};
    use coven_core::TaskType;
    use std::path::Path;
    use tempfile::TempDir;

    /// Worktree double handing out plain directories; merges always succeed.
    #[derive(Debug)]
    struct FakeWorktrees {
        root: PathBuf,
    }

    impl WorktreeProvider for FakeWorktrees {
        fn create(
            &self,
            task_id: &str,
            _base_branch: &str,
        ) -> std::result::Result<PathBuf, WorktreeError> {
            let path = self.root.join(task_id);
            std::fs::create_dir_all(&path).unwrap();
            Ok(path)
        }

        fn check(
            &self,
            _path: &Path,
            _base: &str,
        ) -> std::result::Result<MergeOutcome, WorktreeError> {
            Ok(MergeOutcome {
                success: true,
                conflicts: Vec::new(),
            })
        }

        fn merge(
            &self,
            _path: &Path,
            _base: &str,
            _message: &str,
        ) -> std::result::Result<MergeOutcome, WorktreeError> {
            Ok(MergeOutcome {
                success: true,
                conflicts: Vec::new(),
            })
        }

        fn abort(&self, _path: &Path) -> std::result::Result<(), WorktreeError> {
            Ok(())
        }

        fn cleanup(&self, path: &Path) -> std::result::Result<(), WorktreeError> {
            let _ = std::fs::remove_dir_all(path);
            Ok(())
        }
    }

    struct TestEngine {
        engine: Arc<WorkflowEngine>,
        storage: Arc<Storage>,
        worktree_root: PathBuf,
        _dir: TempDir,
    }

    /// Build an engine whose registry holds the given user grimoires.
    async fn create_test_engine(grimoires: &[&str]) -> TestEngine {
        create_test_engine_with_config(grimoires, Config::default()).await
    }

    async fn create_test_engine_with_config(grimoires: &[&str], config: Config) -> TestEngine {
        let dir = TempDir::new().unwrap();
        let grimoire_dir = dir.path().join("grimoires");
        std::fs::create_dir_all(&grimoire_dir).unwrap();
        for (i, yaml) in grimoires.iter().enumerate() {
            std::fs::write(grimoire_dir.join(format!("g{i}.yaml")), yaml).unwrap();
        }

        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let bus = Arc::new(EventBus::new(
            Arc::clone(&storage),
            Duration::from_secs(5),
        ));
        let processes = Arc::new(ProcessManager::new(
            dir.path().join("output"),
            500,
            Duration::from_millis(300),
        ));
        let registry = Arc::new(GrimoireRegistry::load(&grimoire_dir));
        let worktree_root = dir.path().join("worktrees");
        let worktrees = Arc::new(FakeWorktrees {
            root: worktree_root.clone(),
        });
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            bus,
            processes,
            worktrees,
            registry,
            config,
            "main".to_string(),
            CancellationToken::new(),
        ));
        TestEngine {
            engine,
            storage,
            worktree_root,
            _dir: dir,
        }
    }

    fn test_task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            title: "Add feature".to_string(),
            description: "Do the thing".to_string(),
            priority: 2,
            task_type: TaskType::Task,
            status: TaskStatus::Open,
            labels: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn claim(h: &TestEngine, task_id: &str, grimoire: &str) -> Workflow {
        h.storage.create_task(&test_task(task_id)).await.unwrap();
        h.storage
            .claim_task_and_start_workflow(task_id, grimoire)
            .await
            .unwrap()
    }

    async fn event_types(h: &TestEngine) -> Vec<String> {
        h.storage
            .range_events(0, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn happy_path_two_scripts() {
        let h = create_test_engine(&[r#"
name: test-simple
steps:
  - name: step1
    type: script
    command: echo step1
  - name: step2
    type: script
    command: echo step2
"#])
        .await;
        let workflow = claim(&h, "t-1", "test-simple").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.completed_steps.len(), 2);
        assert!(done.completed_steps.iter().all(|r| r.success));
        assert_eq!(done.completed_steps[0].output, "step1");

        let task = h.storage.get_task("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);

        // Lifecycle events in order.
        let types = event_types(&h).await;
        let positions: Vec<usize> = [
            "task.started",
            "workflow.started",
            "step.completed",
            "workflow.completed",
            "task.completed",
        ]
        .iter()
        .map(|t| types.iter().position(|e| e == t).unwrap_or_else(|| panic!("missing {t}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(types.iter().filter(|t| *t == "step.completed").count(), 2);
    }

    #[tokio::test]
    async fn script_failure_fails_fast() {
        let h = create_test_engine(&[r#"
name: fail-fast
steps:
  - name: break
    type: script
    command: exit 1
  - name: never
    type: script
    command: echo never
"#])
        .await;
        let workflow = claim(&h, "t-1", "fail-fast").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.completed_steps.len(), 1);
        assert!(!done.completed_steps[0].success);
        assert_eq!(done.completed_steps[0].exit_code, Some(1));
        // Resume point preserved at the failing step.
        assert_eq!(done.current_step, 0);

        let task = h.storage.get_task("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);

        // The second step never produced output anywhere in the log.
        let events = h.storage.range_events(0, None, None).await.unwrap();
        assert!(!events.iter().any(|e| e.payload_json.contains("never")));
    }

    #[tokio::test]
    async fn loop_retries_until_exit_loop() {
        let h = create_test_engine(&[r#"
name: retry
steps:
  - name: attempts
    type: loop
    max_iterations: 5
    steps:
      - name: try
        type: script
        command: "c=$(cat n 2>/dev/null || echo 0); c=$((c+1)); echo $c > n; [ $c -ge 3 ]"
        on_success: exit_loop
        on_fail: continue
"#])
        .await;
        let workflow = claim(&h, "t-1", "retry").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        // Exactly three iterations touched the counter.
        let counter =
            std::fs::read_to_string(h.worktree_root.join("t-1").join("n")).unwrap();
        assert_eq!(counter.trim(), "3");

        let loop_result = done.step_result("attempts").unwrap();
        assert!(loop_result.success);
        assert_eq!(loop_result.step_type, "loop");
    }

    #[tokio::test]
    async fn loop_exhaustion_blocks_when_configured() {
        let h = create_test_engine(&[r#"
name: exhaust
steps:
  - name: attempts
    type: loop
    max_iterations: 2
    on_max_iterations: block
    steps:
      - name: try
        type: script
        command: "false"
        on_fail: continue
"#])
        .await;
        let workflow = claim(&h, "t-1", "exhaust").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Blocked);
        assert_eq!(done.error.as_deref(), Some("max_iterations"));
        let task = h.storage.get_task("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn zero_iteration_loop_succeeds() {
        let h = create_test_engine(&[r#"
name: noop-loop
steps:
  - name: nothing
    type: loop
    max_iterations: 0
    steps:
      - name: unreachable
        type: script
        command: echo unreachable
"#])
        .await;
        let workflow = claim(&h, "t-1", "noop-loop").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        let loop_result = done.step_result("nothing").unwrap();
        assert!(loop_result.success);
        assert!(done.step_result("unreachable").is_none());
    }

    #[tokio::test]
    async fn empty_grimoire_completes_immediately() {
        let h = create_test_engine(&["name: empty\nsteps: []\n"]).await;
        let workflow = claim(&h, "t-1", "empty").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.completed_steps.is_empty());
        let task = h.storage.get_task("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
    }

    #[tokio::test]
    async fn when_condition_skips_step() {
        let h = create_test_engine(&[r#"
name: conditional
steps:
  - name: ok
    type: script
    command: echo ok
  - name: cleanup
    type: script
    command: echo cleaning
    when: "{{ previous.failed }}"
"#])
        .await;
        let workflow = claim(&h, "t-1", "conditional").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        let skipped = done.step_result("cleanup").unwrap();
        assert!(skipped.skipped);
        assert!(skipped.success);
        assert!(skipped.output.is_empty());
    }

    #[tokio::test]
    async fn output_variables_flow_between_steps() {
        let h = create_test_engine(&[r#"
name: vars
steps:
  - name: produce
    type: script
    command: echo hello
    output: greeting
  - name: consume
    type: script
    command: "echo {{ greeting }} again"
    output: echoed
"#])
        .await;
        let workflow = claim(&h, "t-1", "vars").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.variable("greeting"), Some("hello"));
        assert_eq!(done.variable("echoed"), Some("hello again"));
    }

    #[tokio::test]
    async fn unresolved_template_fails_step() {
        let h = create_test_engine(&[r#"
name: bad-template
steps:
  - name: broken
    type: script
    command: "echo {{ no_such_var }}"
"#])
        .await;
        let workflow = claim(&h, "t-1", "bad-template").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        let result = done.step_result("broken").unwrap();
        assert_eq!(result.error.as_deref(), Some("template_error"));
    }

    #[tokio::test]
    async fn step_timeout_kills_and_reports() {
        let h = create_test_engine(&[r#"
name: slow
steps:
  - name: sleepy
    type: script
    command: sleep 30
    timeout: 300ms
"#])
        .await;
        let workflow = claim(&h, "t-1", "slow").await;
        let started = Instant::now();
        h.engine.run_workflow(workflow.clone()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("step_timeout"));
        let result = done.step_result("sleepy").unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("step_timeout"));
    }

    #[tokio::test]
    async fn workflow_timeout_cancels_current_step() {
        let h = create_test_engine(&[r#"
name: slow-workflow
timeout: 300ms
steps:
  - name: sleepy
    type: script
    command: sleep 30
"#])
        .await;
        let workflow = claim(&h, "t-1", "slow-workflow").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("workflow_timeout"));
    }

    #[tokio::test]
    async fn agent_question_is_detected_and_answer_delivered() {
        let mut config = Config::default();
        config.agent_bin = PathBuf::from("sh");
        config.agent_args = vec![
            "-c".to_string(),
            "echo 'Do you want to proceed?'; read ans; echo got:$ans".to_string(),
        ];
        let h = create_test_engine_with_config(
            &[r#"
name: asker
steps:
  - name: implement
    type: agent
    spell: "work on {{ bead.id }}"
    output: agent_log
"#],
            config,
        )
        .await;
        let workflow = claim(&h, "t-1", "asker").await;
        let engine = Arc::clone(&h.engine);
        let handle = tokio::spawn(async move { engine.run_workflow(workflow).await });

        // Wait for the detector to surface the question.
        let question = loop {
            let questions = h.storage.list_questions(Some("t-1"), true).await.unwrap();
            if let Some(q) = questions.into_iter().next() {
                break q;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(question.text, "Do you want to proceed?");

        // Answer over stdin; the agent echoes and exits.
        let answered = h.storage.answer_question(&question.id, "y").await.unwrap();
        h.engine
            .processes
            .write_stdin(&answered.step_task_id, "y")
            .await
            .unwrap();

        handle.await.unwrap().unwrap();
        let workflow = h.storage.get_workflow_for_task("t-1").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(workflow.variable("agent_log").unwrap().contains("got:y"));

        let types = event_types(&h).await;
        assert!(types.iter().any(|t| t == "questions.asked"));
        assert!(types.iter().any(|t| t == "agent.started"));
        assert!(types.iter().any(|t| t == "agent.completed"));
        assert!(types.iter().any(|t| t == "agent.output"));
    }

    #[tokio::test]
    async fn cancel_kills_running_step() {
        let h = create_test_engine(&[r#"
name: cancellable
steps:
  - name: long
    type: script
    command: sleep 60
"#])
        .await;
        let workflow = claim(&h, "t-1", "cancellable").await;
        let engine = Arc::clone(&h.engine);
        let wf = workflow.clone();
        let handle = tokio::spawn(async move { engine.run_workflow(wf).await });

        // Let the step spawn, then cancel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.engine.cancel_workflow(&workflow.id).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Cancelled);
        let task = h.storage.get_task("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn resume_skips_completed_steps() {
        let h = create_test_engine(&[r#"
name: resumable
steps:
  - name: first
    type: script
    command: touch first_ran
  - name: second
    type: script
    command: touch second_ran
"#])
        .await;
        let mut workflow = claim(&h, "t-1", "resumable").await;

        // Simulate a crash after step one: recorded, advanced, still running.
        let now = Utc::now();
        workflow.record_step(StepResult {
            step_name: "first".to_string(),
            step_type: "script".to_string(),
            success: true,
            exit_code: Some(0),
            output: String::new(),
            output_var: None,
            skipped: false,
            started_at: now,
            ended_at: now,
            error: None,
        });
        workflow.current_step = 1;
        h.storage.checkpoint_workflow(&workflow).await.unwrap();

        let resumed = h.engine.resume_interrupted().await.unwrap();
        assert_eq!(resumed.len(), 1);

        // Wait for the spawned driver to finish.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let wf = h.storage.get_workflow(&workflow.id).await.unwrap();
            if wf.status == WorkflowStatus::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "workflow did not complete");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let worktree = h.worktree_root.join("t-1");
        assert!(!worktree.exists() || !worktree.join("first_ran").exists());
    }

    #[tokio::test]
    async fn retry_reenters_at_failing_step() {
        let h = create_test_engine(&[r#"
name: flaky
steps:
  - name: first
    type: script
    command: "echo once >> log"
  - name: gate
    type: script
    command: "test -f pass"
"#])
        .await;
        let workflow = claim(&h, "t-1", "flaky").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let failed = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.current_step, 1);

        // Make the gate pass and retry.
        std::fs::write(h.worktree_root.join("t-1").join("pass"), "").unwrap();
        h.engine.retry_workflow(&workflow.id).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let wf = h.storage.get_workflow(&workflow.id).await.unwrap();
            if wf.status == WorkflowStatus::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "retry did not complete");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The first step did not re-run.
        let log = std::fs::read_to_string(h.worktree_root.join("t-1").join("log"));
        if let Ok(log) = log {
            assert_eq!(log.matches("once").count(), 1);
        }
    }

    #[tokio::test]
    async fn reviewed_merge_parks_pending() {
        let h = create_test_engine(&[r#"
name: reviewed
steps:
  - name: work
    type: script
    command: echo done > artifact.txt
  - name: land
    type: merge
    require_review: true
"#])
        .await;
        let workflow = claim(&h, "t-1", "reviewed").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let parked = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(parked.status, WorkflowStatus::PendingMerge);
        // Merge step is not recorded until approval.
        assert!(parked.step_result("land").is_none());
        assert_eq!(parked.current_step, 1);
        // Worktree still present.
        assert!(h.worktree_root.join("t-1").exists());

        let types = event_types(&h).await;
        assert!(types.iter().any(|t| t == "review.check.completed"));
        assert!(types.iter().any(|t| t == "workflow.pending_merge"));
    }

    #[tokio::test]
    async fn unreviewed_merge_completes_workflow() {
        let h = create_test_engine(&[r#"
name: auto-land
steps:
  - name: work
    type: script
    command: echo done > artifact.txt
  - name: land
    type: merge
"#])
        .await;
        let workflow = claim(&h, "t-1", "auto-land").await;
        h.engine.run_workflow(workflow.clone()).await.unwrap();

        let done = h.storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.step_result("land").unwrap().success);
    }

    #[tokio::test]
    async fn end_to_end_review_gate_with_git() {
        use std::process::Command as StdCommand;
        // Real repo, real worktrees: the reviewed file must appear on the
        // base branch only after approval.
        let repo = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git")
                .args(&args)
                .current_dir(repo.path())
                .output()
                .unwrap();
        }
        std::fs::write(repo.path().join("README.md"), "# repo\n").unwrap();
        StdCommand::new("git")
            .args(["add", "-A"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(repo.path())
            .output()
            .unwrap();

        let dir = TempDir::new().unwrap();
        let grimoire_dir = dir.path().join("grimoires");
        std::fs::create_dir_all(&grimoire_dir).unwrap();
        std::fs::write(
            grimoire_dir.join("g.yaml"),
            r#"
name: reviewed
steps:
  - name: work
    type: script
    command: echo done > artifact.txt
  - name: land
    type: merge
    require_review: true
"#,
        )
        .unwrap();

        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let bus = Arc::new(EventBus::new(Arc::clone(&storage), Duration::from_secs(5)));
        let processes = Arc::new(ProcessManager::new(
            dir.path().join("output"),
            500,
            Duration::from_millis(300),
        ));
        let registry = Arc::new(GrimoireRegistry::load(&grimoire_dir));
        let worktrees: Arc<dyn WorktreeProvider> =
            Arc::new(GitWorktrees::new(repo.path().to_path_buf()));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            Arc::clone(&bus),
            processes,
            Arc::clone(&worktrees),
            Arc::clone(&registry),
            Config::default(),
            "main".to_string(),
            CancellationToken::new(),
        ));
        let review = crate::review::ReviewGateway::new(
            Arc::clone(&storage),
            bus,
            worktrees,
            registry,
            Arc::clone(&engine),
        );

        let now = Utc::now();
        storage
            .create_task(&Task {
                id: "t-1".to_string(),
                title: "reviewed change".to_string(),
                description: String::new(),
                priority: 1,
                task_type: TaskType::Task,
                status: TaskStatus::Open,
                labels: Vec::new(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let workflow = storage
            .claim_task_and_start_workflow("t-1", "reviewed")
            .await
            .unwrap();
        engine.run_workflow(workflow.clone()).await.unwrap();

        let parked = storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(parked.status, WorkflowStatus::PendingMerge);
        // Not yet on the base branch.
        assert!(!repo.path().join("artifact.txt").exists());

        let approval = review.approve(&workflow.id, Some("looks good")).await.unwrap();
        assert_eq!(approval.status, "merged");
        assert!(repo.path().join("artifact.txt").exists());

        // The resumed driver finishes the (now empty) remainder.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let wf = storage.get_workflow(&workflow.id).await.unwrap();
            if wf.status == WorkflowStatus::Completed {
                assert!(wf.step_result("land").unwrap().success);
                break;
            }
            assert!(Instant::now() < deadline, "approval did not complete workflow");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Worktree cleaned up after approval.
        assert!(!repo.path().join(".coven/worktrees/t-1").exists());
    }

    #[tokio::test]
    async fn agent_cap_is_respected() {
        let mut config = Config::default();
        config.max_concurrent_agents = 1;
        config.agent_bin = PathBuf::from("sh");
        config.agent_args = vec!["-c".to_string(), "sleep 0.3".to_string()];
        let h = create_test_engine_with_config(
            &[r#"
name: agented
steps:
  - name: run
    type: agent
    spell: "noop"
"#],
            config,
        )
        .await;

        let wf1 = claim(&h, "t-1", "agented").await;
        let wf2 = claim(&h, "t-2", "agented").await;

        let e1 = Arc::clone(&h.engine);
        let e2 = Arc::clone(&h.engine);
        let h1 = tokio::spawn(async move { e1.run_workflow(wf1).await });
        let h2 = tokio::spawn(async move { e2.run_workflow(wf2).await });

        // With one permit the two sleeps serialize.
        let started = Instant::now();
        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(600));

        assert_eq!(h.storage.count_live_agents().await.unwrap(), 0);
    }
}
