//! Integration tests for the HTTP control plane and SSE streaming.
//!
//! Exercises task lifecycle, workflow dispatch, question answering, error
//! statuses, and SSE replay through the router without a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use coven_core::events::{EventPayload, EventType, TaskEventPayload};
use coven_core::{Config, DeliveryStatus, Id, Question, TaskStatus};
use covend::bus::EventBus;
use covend::engine::WorkflowEngine;
use covend::process::ProcessManager;
use covend::registry::GrimoireRegistry;
use covend::review::ReviewGateway;
use covend::server::{create_router, AppState};
use covend::storage::Storage;
use covend::worktree::{MergeOutcome, WorktreeError, WorktreeProvider};
use http_body_util::BodyExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Worktree double: plain directories, merges always clean.
#[derive(Debug)]
struct FakeWorktrees {
    root: PathBuf,
}

impl WorktreeProvider for FakeWorktrees {
    fn create(&self, task_id: &str, _base: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.root.join(task_id);
        std::fs::create_dir_all(&path).unwrap();
        Ok(path)
    }

    fn check(&self, _path: &Path, _base: &str) -> Result<MergeOutcome, WorktreeError> {
        Ok(MergeOutcome {
            success: true,
            conflicts: Vec::new(),
        })
    }

    fn merge(&self, _path: &Path, _base: &str, _msg: &str) -> Result<MergeOutcome, WorktreeError> {
        Ok(MergeOutcome {
            success: true,
            conflicts: Vec::new(),
        })
    }

    fn abort(&self, _path: &Path) -> Result<(), WorktreeError> {
        Ok(())
    }

    fn cleanup(&self, path: &Path) -> Result<(), WorktreeError> {
        let _ = std::fs::remove_dir_all(path);
        Ok(())
    }
}

async fn create_test_app() -> (axum::Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();

    // Register a minimal grimoire alongside the built-ins.
    let grimoire_dir = dir.path().join("grimoires");
    std::fs::create_dir_all(&grimoire_dir).unwrap();
    std::fs::write(
        grimoire_dir.join("test-simple.yaml"),
        "name: test-simple\nsteps:\n  - name: step1\n    type: script\n    command: echo step1\n  - name: step2\n    type: script\n    command: echo step2\n",
    )
    .unwrap();

    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);
    let config = Config::default();
    let bus = Arc::new(EventBus::new(Arc::clone(&storage), Duration::from_secs(5)));
    let processes = Arc::new(ProcessManager::new(
        dir.path().join("output"),
        500,
        Duration::from_millis(300),
    ));
    let registry = Arc::new(GrimoireRegistry::load(&grimoire_dir));
    let worktrees: Arc<dyn WorktreeProvider> = Arc::new(FakeWorktrees {
        root: dir.path().join("worktrees"),
    });
    let engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&storage),
        Arc::clone(&bus),
        Arc::clone(&processes),
        Arc::clone(&worktrees),
        Arc::clone(&registry),
        config.clone(),
        "main".to_string(),
        CancellationToken::new(),
    ));
    let review = Arc::new(ReviewGateway::new(
        Arc::clone(&storage),
        Arc::clone(&bus),
        Arc::clone(&worktrees),
        Arc::clone(&registry),
        Arc::clone(&engine),
    ));

    let state = Arc::new(AppState {
        storage,
        bus,
        engine,
        registry,
        review,
        processes,
        worktrees,
        config,
        workspace: dir.path().to_path_buf(),
        started_at: std::time::Instant::now(),
        shutdown: CancellationToken::new(),
    });
    let router = create_router(Arc::clone(&state));
    (router, state, dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_task(app: &axum::Router, id: &str) {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks",
            serde_json::json!({
                "id": id,
                "title": "Add feature",
                "type": "task",
                "priority": 2,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

// --- Basic endpoints ---

#[tokio::test]
async fn health_reports_healthy() {
    let (app, _, _dir) = create_test_app().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert!(json["workspace"].as_str().is_some());
}

#[tokio::test]
async fn version_is_exposed() {
    let (app, _, _dir) = create_test_app().await;
    let response = app.oneshot(get("/version")).await.unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

// --- Task lifecycle ---

#[tokio::test]
async fn task_create_list_start_completes_workflow() {
    let (app, state, _dir) = create_test_app().await;
    create_task(&app, "t-1").await;

    let response = app.clone().oneshot(get("/tasks")).await.unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(json["tasks"][0]["status"], "open");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/t-1/start",
            serde_json::json!({ "grimoire": "test-simple" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["workflow"]["grimoire"], "test-simple");
    assert_eq!(json["workflow"]["task_id"], "t-1");

    // The spawned driver runs two echo steps to completion.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = state.storage.get_task("t-1").await.unwrap();
        if task.status == TaskStatus::Closed {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "workflow did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = app.clone().oneshot(get("/state")).await.unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["tasks"][0]["status"], "closed");

    let response = app.clone().oneshot(get("/workflows/t-1")).await.unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["workflow"]["status"], "completed");
    assert_eq!(
        json["workflow"]["completed_steps"].as_array().unwrap().len(),
        2
    );
    assert!(json["workflow"]["worktree_path"].as_str().is_some());
}

#[tokio::test]
async fn starting_a_claimed_task_conflicts() {
    let (app, _, _dir) = create_test_app().await;
    create_task(&app, "t-1").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/t-1/start",
            serde_json::json!({ "grimoire": "test-simple" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tasks/t-1/start",
            serde_json::json!({ "grimoire": "test-simple" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "already_claimed");
}

#[tokio::test]
async fn starting_missing_task_is_404() {
    let (app, _, _dir) = create_test_app().await;
    let response = app
        .oneshot(json_request("POST", "/tasks/ghost/start", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn unknown_grimoire_is_rejected() {
    let (app, _, _dir) = create_test_app().await;
    create_task(&app, "t-1").await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/tasks/t-1/start",
            serde_json::json!({ "grimoire": "no-such" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "grimoire_resolution_failed");
}

#[tokio::test]
async fn stopping_idle_task_is_conflict() {
    let (app, state, _dir) = create_test_app().await;
    create_task(&app, "t-1").await;

    // No workflow at all -> 404; terminal workflow -> 409.
    let response = app.clone().oneshot(json_request("POST", "/tasks/t-1/stop", serde_json::json!({}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let workflow = state
        .storage
        .claim_task_and_start_workflow("t-1", "test-simple")
        .await
        .unwrap();
    state.engine.run_workflow(workflow).await.unwrap();

    let response = app
        .oneshot(json_request("POST", "/tasks/t-1/stop", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "not_running");
}

// --- Questions ---

async fn insert_question(state: &AppState, id: &Id) {
    let question = Question {
        id: id.clone(),
        task_id: "t-1".to_string(),
        step_task_id: "wf-1:implement".to_string(),
        text: "Do you want to proceed?".to_string(),
        suggested_answers: vec!["y".to_string(), "n".to_string()],
        asked_at: Utc::now(),
        answer: None,
        answered_at: None,
        delivery: DeliveryStatus::Pending,
        delivery_error: None,
    };
    state.storage.insert_question(&question).await.unwrap();
}

#[tokio::test]
async fn question_listing_and_answering() {
    let (app, state, _dir) = create_test_app().await;
    let question_id = Id::new();
    insert_question(&state, &question_id).await;

    let response = app
        .clone()
        .oneshot(get("/questions?task_id=t-1&pending=true"))
        .await
        .unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["questions"].as_array().unwrap().len(), 1);
    assert_eq!(json["questions"][0]["text"], "Do you want to proceed?");

    // Answer once; the agent process is gone, so delivery fails but the
    // answer is recorded.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/questions/{question_id}/answer"),
            serde_json::json!({ "answer": "y" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["delivered"], false);

    // Second answer conflicts.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/questions/{question_id}/answer"),
            serde_json::json!({ "answer": "n" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "already_answered");

    // Pending filter now excludes it.
    let response = app
        .oneshot(get("/questions?task_id=t-1&pending=true"))
        .await
        .unwrap();
    let json = body_to_json(response).await;
    assert!(json["questions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn answering_missing_question_is_404() {
    let (app, _, _dir) = create_test_app().await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/questions/nope/answer",
            serde_json::json!({ "answer": "y" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// --- Workflows ---

#[tokio::test]
async fn approve_merge_requires_pending_state() {
    let (app, state, _dir) = create_test_app().await;
    create_task(&app, "t-1").await;
    let workflow = state
        .storage
        .claim_task_and_start_workflow("t-1", "test-simple")
        .await
        .unwrap();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/workflows/{}/approve-merge", workflow.id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "not_pending_merge");
}

#[tokio::test]
async fn retry_requires_failed_or_blocked() {
    let (app, state, _dir) = create_test_app().await;
    create_task(&app, "t-1").await;
    let workflow = state
        .storage
        .claim_task_and_start_workflow("t-1", "test-simple")
        .await
        .unwrap();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/workflows/{}/retry", workflow.id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

// --- Agents ---

#[tokio::test]
async fn agent_endpoints_translate_task_ids() {
    let (app, state, _dir) = create_test_app().await;
    let agent = coven_core::Agent {
        step_task_id: "wf-1:implement".to_string(),
        workflow_id: Id::from_string("wf-1"),
        task_id: "t-1".to_string(),
        pid: Some(4242),
        status: coven_core::AgentStatus::Completed,
        worktree: None,
        branch: None,
        started_at: Utc::now(),
    };
    state.storage.upsert_agent(&agent).await.unwrap();

    // By task id.
    let response = app.clone().oneshot(get("/agents/t-1")).await.unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["agent"]["step_task_id"], "wf-1:implement");

    // By step task id.
    let response = app.clone().oneshot(get("/agents/wf-1:implement")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Output of a released agent is an empty delta, not an error.
    let response = app
        .clone()
        .oneshot(get("/agents/t-1/output?since=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert!(json["lines"].as_array().unwrap().is_empty());

    // Responding to an exited agent maps to agent_not_running.
    let response = app
        .oneshot(json_request(
            "POST",
            "/agents/t-1/respond",
            serde_json::json!({ "response": "y" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_to_json(response).await;
    assert_eq!(json["error"], "agent_not_running");
}

// --- SSE ---

/// Read SSE body chunks until the predicate matches or the timeout fires.
async fn read_sse_until(
    response: Response,
    deadline: Duration,
    mut done: impl FnMut(&str) -> bool,
) -> String {
    let mut body = response.into_body();
    let mut text = String::new();
    let result = tokio::time::timeout(deadline, async {
        while let Some(frame) = body.frame().await {
            let frame = frame.unwrap();
            if let Some(data) = frame.data_ref() {
                text.push_str(&String::from_utf8_lossy(data));
                if done(&text) {
                    break;
                }
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for SSE data: {text}");
    text
}

#[tokio::test]
async fn sse_replays_from_last_event_id_without_duplicates() {
    let (app, state, _dir) = create_test_app().await;

    // Seed three events.
    let mut seqs = Vec::new();
    for i in 0..3 {
        let event = state
            .bus
            .publish(
                EventType::TaskUpdated,
                "task",
                &format!("t-{i}"),
                EventPayload::Task(TaskEventPayload {
                    task_id: format!("t-{i}"),
                    status: TaskStatus::Open,
                    workflow_id: None,
                }),
            )
            .await
            .unwrap();
        seqs.push(event.seq);
    }

    let request = Request::builder()
        .uri("/events")
        .header("last-event-id", seqs[0].to_string())
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let last_id = format!("id: {}", seqs[2]);
    let text = read_sse_until(response, Duration::from_secs(5), |t| t.contains(&last_id)).await;

    // Snapshot first, then exactly the events after the cursor.
    assert!(text.contains("event: state.snapshot"));
    assert!(!text.contains(&format!("id: {}", seqs[0])));
    assert!(text.contains(&format!("id: {}", seqs[1])));
    assert!(text.contains(&format!("id: {}", seqs[2])));
    assert_eq!(text.matches(&format!("id: {}", seqs[1])).count(), 1);
}

#[tokio::test]
async fn sse_streams_live_events_after_replay() {
    let (app, state, _dir) = create_test_app().await;

    let response = app.clone().oneshot(get("/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Publish after the stream is up; it must arrive live.
    let bus = Arc::clone(&state.bus);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(
            EventType::TaskUpdated,
            "task",
            "t-live",
            EventPayload::Task(TaskEventPayload {
                task_id: "t-live".to_string(),
                status: TaskStatus::Open,
                workflow_id: None,
            }),
        )
        .await
        .unwrap();
    });

    let text =
        read_sse_until(response, Duration::from_secs(5), |t| t.contains("t-live")).await;
    assert!(text.contains("event: task.updated"));
}
