//! HTTP control plane over the daemon's Unix socket.
//!
//! Request/response bodies are JSON; errors map domain kinds to statuses
//! (`not_found` -> 404, claim/answer/transition conflicts -> 409, shape
//! errors -> 400, everything else -> 500). `GET /events` is a Server-Sent
//! Events stream that replays from the durable log when the client presents
//! `Last-Event-ID`, then switches to live fan-out with no duplicates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use coven_core::events::{EventPayload, EventType, QuestionEventPayload};
use coven_core::{DeliveryStatus, ErrorKind, Id, Task, TaskStatus, TaskType, Workflow};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::engine::{EngineError, WorkflowEngine};
use crate::process::{ProcessError, ProcessManager};
use crate::registry::GrimoireRegistry;
use crate::review::{ReviewError, ReviewGateway};
use crate::storage::{Storage, StorageError};
use crate::worktree::WorktreeProvider;

/// Interval between SSE heartbeat frames.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub bus: Arc<EventBus>,
    pub engine: Arc<WorkflowEngine>,
    pub registry: Arc<GrimoireRegistry>,
    pub review: Arc<ReviewGateway>,
    pub processes: Arc<ProcessManager>,
    pub worktrees: Arc<dyn WorktreeProvider>,
    pub config: coven_core::Config,
    pub workspace: std::path::PathBuf,
    pub started_at: Instant,
    /// Root token; cancelling it begins daemon shutdown.
    pub shutdown: CancellationToken,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/shutdown", post(shutdown))
        .route("/state", get(state_snapshot))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/stop", post(stop_task))
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/output", get(agent_output))
        .route("/agents/{id}/kill", post(kill_agent))
        .route("/agents/{id}/respond", post(respond_agent))
        .route("/questions", get(list_questions))
        .route("/questions/{id}/answer", post(answer_question))
        .route("/workflows/{task_id}", get(get_workflow))
        .route("/workflows/{id}/approve-merge", post(approve_merge))
        .route("/workflows/{id}/reject-merge", post(reject_merge))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/retry", post(retry_workflow))
        .route("/events", get(stream_events))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router over an already-bound Unix socket listener.
pub async fn serve(
    listener: tokio::net::UnixListener,
    state: Arc<AppState>,
) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Error plumbing ---

/// API error carrying a domain kind.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorBody {
                error: self.kind.as_str().to_string(),
                message: self.message,
                details: self.details,
            }),
        )
            .into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        let kind = match &e {
            StorageError::TaskNotFound(_)
            | StorageError::WorkflowNotFound(_)
            | StorageError::AgentNotFound(_)
            | StorageError::QuestionNotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyClaimed(_) => ErrorKind::AlreadyClaimed,
            StorageError::AlreadyAnswered(_) => ErrorKind::AlreadyAnswered,
            StorageError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            _ => ErrorKind::InternalError,
        };
        ApiError::new(kind, e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let kind = match &e {
            EngineError::Storage(inner) => return ApiError::from_storage_ref(inner, e.to_string()),
            EngineError::NotRetryable(_) => ErrorKind::NotRunning,
            EngineError::GrimoireResolution(_) => ErrorKind::GrimoireResolutionFailed,
            EngineError::Worktree(_) => ErrorKind::WorktreeError,
            _ => ErrorKind::InternalError,
        };
        ApiError::new(kind, e.to_string())
    }
}

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        match e {
            ReviewError::Storage(inner) => inner.into(),
            ReviewError::NotPendingMerge(id) => ApiError::new(
                ErrorKind::NotPendingMerge,
                format!("workflow not pending merge: {id}"),
            ),
            ReviewError::MergeConflict(conflicts) => {
                ApiError::new(ErrorKind::MergeConflict, "merge conflict")
                    .with_details(serde_json::json!({ "conflicts": conflicts }))
            }
            ReviewError::Worktree(inner) => ApiError::new(ErrorKind::WorktreeError, inner.to_string()),
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        let kind = match &e {
            ProcessError::NotFound(_) => ErrorKind::NotFound,
            ProcessError::AgentNotRunning(_) => ErrorKind::AgentNotRunning,
            ProcessError::StdinClosed(_) => ErrorKind::StdinClosed,
            ProcessError::Io(_) => ErrorKind::InternalError,
        };
        ApiError::new(kind, e.to_string())
    }
}

impl ApiError {
    fn from_storage_ref(e: &StorageError, message: String) -> Self {
        let kind = match e {
            StorageError::TaskNotFound(_)
            | StorageError::WorkflowNotFound(_)
            | StorageError::AgentNotFound(_)
            | StorageError::QuestionNotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyClaimed(_) => ErrorKind::AlreadyClaimed,
            StorageError::AlreadyAnswered(_) => ErrorKind::AlreadyAnswered,
            StorageError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            _ => ErrorKind::InternalError,
        };
        ApiError::new(kind, message)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Basic endpoints ---

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_sec: u64,
    workspace: String,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_sec: state.started_at.elapsed().as_secs(),
        workspace: state.workspace.display().to_string(),
    })
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("shutdown requested over API");
    let token = state.shutdown.clone();
    // Let the response flush before tearing the listener down.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });
    Json(serde_json::json!({ "status": "shutting_down" }))
}

// --- State snapshot ---

#[derive(Debug, Serialize)]
struct StateSnapshot {
    workflow: Option<Workflow>,
    tasks: Vec<Task>,
    agents: Vec<coven_core::Agent>,
    timestamp: i64,
}

async fn build_snapshot(state: &AppState) -> ApiResult<StateSnapshot> {
    let tasks = state.storage.list_tasks(None).await?;
    let agents = state.storage.list_agents().await?;
    let workflow = state
        .storage
        .list_workflows(None)
        .await?
        .into_iter()
        .find(|w| !w.status.is_terminal());
    Ok(StateSnapshot {
        workflow,
        tasks,
        agents,
        timestamp: Utc::now().timestamp_millis(),
    })
}

async fn state_snapshot(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(build_snapshot(&state).await?))
}

// --- Tasks ---

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: i64,
    #[serde(default, rename = "type")]
    task_type: TaskType,
    #[serde(default)]
    labels: Vec<String>,
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let tasks = state.storage.list_tasks(None).await?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let now = Utc::now();
    let task = Task {
        id: req.id,
        title: req.title,
        description: req.description,
        priority: req.priority,
        task_type: req.task_type,
        status: TaskStatus::Open,
        labels: req.labels,
        created_at: now,
        updated_at: now,
    };
    state.storage.create_task(&task).await?;
    info!(task_id = %task.id, "task created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "task": task }))))
}

#[derive(Debug, Deserialize, Default)]
struct StartTaskRequest {
    #[serde(default)]
    grimoire: Option<String>,
}

async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StartTaskRequest>>,
) -> ApiResult<impl IntoResponse> {
    let task = state.storage.get_task(&id).await?;
    let grimoire = match body.and_then(|Json(b)| b.grimoire) {
        Some(name) => name,
        None => state.registry.resolve_name(&task, &state.config),
    };
    state
        .registry
        .get(&grimoire)
        .map_err(|e| ApiError::new(ErrorKind::GrimoireResolutionFailed, e.to_string()))?;

    let workflow = state
        .storage
        .claim_task_and_start_workflow(&id, &grimoire)
        .await?;
    info!(task_id = %id, workflow_id = %workflow.id, grimoire = %grimoire, "task started");
    state.engine.spawn_workflow(workflow.clone());
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state.storage.get_workflow_for_task(&id).await?;
    if workflow.status.is_terminal() {
        return Err(ApiError::new(
            ErrorKind::NotRunning,
            format!("no running workflow for task {id}"),
        ));
    }
    state.engine.cancel_workflow(&workflow.id).await?;
    Ok(Json(serde_json::json!({ "status": "cancelling" })))
}

// --- Agents ---

/// Resolve an agent identifier: a step task id (`wf:step`) verbatim, or a
/// task id the daemon translates to the task's live agent.
async fn resolve_agent(state: &AppState, id: &str) -> ApiResult<coven_core::Agent> {
    if id.contains(':') {
        Ok(state.storage.get_agent(id).await?)
    } else {
        Ok(state.storage.get_agent_for_task(id).await?)
    }
}

async fn list_agents(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let agents = state.storage.list_agents().await?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent = resolve_agent(&state, &id).await?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}

#[derive(Debug, Deserialize, Default)]
struct OutputQuery {
    #[serde(default)]
    since: u64,
}

async fn agent_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<impl IntoResponse> {
    let agent = resolve_agent(&state, &id).await?;
    match state.processes.get_output(&agent.step_task_id, query.since) {
        Ok(slice) => Ok(Json(serde_json::json!({
            "step_task_id": agent.step_task_id,
            "lines": slice.lines,
            "truncated_from_seq": slice.truncated_from_seq,
        }))),
        // Buffer already released (or daemon restarted): empty delta.
        Err(ProcessError::NotFound(_)) => Ok(Json(serde_json::json!({
            "step_task_id": agent.step_task_id,
            "lines": [],
            "truncated_from_seq": null,
        }))),
        Err(e) => Err(e.into()),
    }
}

async fn kill_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent = resolve_agent(&state, &id).await?;
    state.processes.kill(&agent.step_task_id, None).await?;
    Ok(Json(serde_json::json!({ "status": "killed" })))
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    response: String,
}

async fn respond_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RespondRequest>,
) -> ApiResult<impl IntoResponse> {
    let agent = resolve_agent(&state, &id).await?;
    match state
        .processes
        .write_stdin(&agent.step_task_id, &req.response)
        .await
    {
        Ok(()) => Ok(Json(serde_json::json!({ "delivered": true }))),
        Err(ProcessError::NotFound(key)) => Err(ApiError::new(
            ErrorKind::AgentNotRunning,
            format!("agent not running: {key}"),
        )),
        Err(e) => Err(e.into()),
    }
}

// --- Questions ---

#[derive(Debug, Deserialize, Default)]
struct QuestionsQuery {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    pending: Option<bool>,
}

async fn list_questions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QuestionsQuery>,
) -> ApiResult<impl IntoResponse> {
    let questions = state
        .storage
        .list_questions(query.task_id.as_deref(), query.pending.unwrap_or(false))
        .await?;
    Ok(Json(serde_json::json!({ "questions": questions })))
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    answer: String,
}

async fn answer_question(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<impl IntoResponse> {
    let question_id = Id::from_string(&id);
    let question = state.storage.answer_question(&question_id, &req.answer).await?;

    // Deliver to the asking process's stdin.
    let (delivery, delivery_error) = match state
        .processes
        .write_stdin(&question.step_task_id, &req.answer)
        .await
    {
        Ok(()) => (DeliveryStatus::Delivered, None),
        Err(e) => {
            warn!(question_id = %id, error = %e, "answer delivery failed");
            (DeliveryStatus::DeliveryFailed, Some(e.to_string()))
        }
    };
    state
        .storage
        .update_question_delivery(&question_id, delivery, delivery_error.as_deref())
        .await?;

    let delivered = delivery == DeliveryStatus::Delivered;
    if let Err(e) = state
        .bus
        .publish(
            EventType::QuestionsAnswered,
            "question",
            question_id.as_ref(),
            EventPayload::Question(QuestionEventPayload {
                question_id: question_id.clone(),
                task_id: question.task_id.clone(),
                step_task_id: question.step_task_id.clone(),
                text: question.text.clone(),
                suggested_answers: Vec::new(),
                answer: Some(req.answer.clone()),
                delivered: Some(delivered),
            }),
        )
        .await
    {
        warn!(error = %e, "failed to publish questions.answered");
    }

    Ok(Json(serde_json::json!({ "delivered": delivered })))
}

// --- Workflows ---

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state.storage.get_workflow_for_task(&task_id).await?;
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

#[derive(Debug, Deserialize, Default)]
struct ApproveRequest {
    #[serde(default)]
    feedback: Option<String>,
}

async fn approve_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ApproveRequest>>,
) -> ApiResult<impl IntoResponse> {
    let feedback = body.and_then(|Json(b)| b.feedback);
    let approval = state
        .review
        .approve(&Id::from_string(&id), feedback.as_deref())
        .await?;
    Ok(Json(approval))
}

#[derive(Debug, Deserialize, Default)]
struct RejectRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn reject_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<impl IntoResponse> {
    let reason = body.and_then(|Json(b)| b.reason);
    state
        .review
        .reject(&Id::from_string(&id), reason.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "status": "rejected" })))
}

async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.engine.cancel_workflow(&Id::from_string(&id)).await?;
    Ok(Json(serde_json::json!({ "status": "cancelling" })))
}

async fn retry_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state.engine.retry_workflow(&Id::from_string(&id)).await?;
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

// --- SSE ---

fn event_frame(event: &coven_core::Event) -> SseEvent {
    let data: serde_json::Value = serde_json::from_str(&event.payload_json)
        .unwrap_or(serde_json::Value::Null);
    let body = serde_json::json!({
        "seq": event.seq,
        "timestamp": event.timestamp.timestamp_millis(),
        "entity_kind": event.entity_kind,
        "entity_id": event.entity_id,
        "payload": data,
    });
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.event_type.clone())
        .data(body.to_string())
}

/// GET /events: snapshot frame, replay after `Last-Event-ID`, then live.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>>>> {
    let since: i64 = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // Subscribe before reading the replay so no event can fall between.
    let (sub_id, mut live) = state.bus.subscribe().await;
    let snapshot = build_snapshot(&state).await?;
    let replay = state.storage.range_events(since, None, None).await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<
        std::result::Result<SseEvent, std::convert::Infallible>,
    >(64);
    let bus = Arc::clone(&state.bus);
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let snapshot_frame = SseEvent::default()
            .event(EventType::StateSnapshot.as_str())
            .data(serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()));
        if tx.send(Ok(snapshot_frame)).await.is_err() {
            bus.unsubscribe(sub_id).await;
            return;
        }

        let mut cursor = since;
        for event in &replay {
            cursor = event.seq;
            if tx.send(Ok(event_frame(event))).await.is_err() {
                bus.unsubscribe(sub_id).await;
                return;
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick is immediate; skip it

        loop {
            tokio::select! {
                // Close the stream on daemon shutdown so the connection can
                // finish draining.
                () = shutdown.cancelled() => break,
                event = live.recv() => {
                    match event {
                        // Replayed events may race in through the live feed;
                        // the cursor filters duplicates.
                        Some(event) if event.seq > cursor => {
                            cursor = event.seq;
                            if tx.send(Ok(event_frame(&event))).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = SseEvent::default()
                        .event(EventType::Heartbeat.as_str())
                        .data(
                            serde_json::json!({
                                "timestamp": Utc::now().timestamp_millis()
                            })
                            .to_string(),
                        );
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
        bus.unsubscribe(sub_id).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}
