//! HTTP client for the covend control socket.
//!
//! Speaks HTTP/1.1 over the daemon's Unix socket at
//! `<workspace>/.coven/covend.sock`; one connection per request, except the
//! long-lived SSE tail.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {socket}\n  → start with: covend {workspace}")]
    ConnectionFailed { socket: String, workspace: String },

    #[error("{error}: {message}")]
    Api {
        status: u16,
        error: String,
        message: String,
        details: Option<Value>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Control-socket client.
#[derive(Debug, Clone)]
pub struct Client {
    workspace: PathBuf,
    socket_path: PathBuf,
}

impl Client {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            socket_path: workspace.join(".coven/covend.sock"),
        }
    }

    async fn connect(&self) -> Result<http1::SendRequest<Full<Bytes>>> {
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|_| ClientError::ConnectionFailed {
                    socket: self.socket_path.display().to_string(),
                    workspace: self.workspace.display().to_string(),
                })?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            // Connection driver; errors surface on the request side.
            let _ = conn.await;
        });
        Ok(sender)
    }

    async fn request_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response<Incoming>> {
        let mut sender = self.connect().await?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("host", "covend");
        let payload = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Bytes::from(value.to_string())
            }
            None => Bytes::new(),
        };
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(sender.send_request(request).await?)
    }

    /// One JSON request/response round trip with API error mapping.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let response = self.request_raw(method, path, body).await?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(ClientError::Http)?
            .to_bytes();
        let value: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?
        };

        if status.is_success() {
            Ok(value)
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                error: value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string(),
                details: value.get("details").cloned(),
            })
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.request(Method::POST, path, body).await
    }

    /// Tail `GET /events`, invoking the callback with each raw SSE chunk.
    pub async fn tail_events(
        &self,
        last_event_id: Option<i64>,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<()> {
        let mut sender = self.connect().await?;
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri("/events")
            .header("host", "covend")
            .header("accept", "text/event-stream");
        if let Some(id) = last_event_id {
            builder = builder.header("last-event-id", id.to_string());
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            return Err(ClientError::Api {
                status: response.status().as_u16(),
                error: "stream_failed".to_string(),
                message: format!("unexpected status {}", response.status()),
                details: None,
            });
        }

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame?;
            if let Some(data) = frame.data_ref() {
                on_chunk(&String::from_utf8_lossy(data));
            }
        }
        Ok(())
    }

    // --- Typed wrappers ---

    pub async fn health(&self) -> Result<Value> {
        self.get("/health").await
    }

    pub async fn state(&self) -> Result<Value> {
        self.get("/state").await
    }

    pub async fn tasks(&self) -> Result<Value> {
        self.get("/tasks").await
    }

    pub async fn create_task(&self, task: Value) -> Result<Value> {
        self.post("/tasks", Some(task)).await
    }

    pub async fn start_task(&self, id: &str, grimoire: Option<&str>) -> Result<Value> {
        let body = grimoire.map(|g| serde_json::json!({ "grimoire": g }));
        self.post(&format!("/tasks/{id}/start"), body).await
    }

    pub async fn stop_task(&self, id: &str) -> Result<Value> {
        self.post(&format!("/tasks/{id}/stop"), None).await
    }

    pub async fn agents(&self) -> Result<Value> {
        self.get("/agents").await
    }

    pub async fn agent_output(&self, id: &str, since: u64) -> Result<Value> {
        self.get(&format!("/agents/{id}/output?since={since}")).await
    }

    pub async fn kill_agent(&self, id: &str) -> Result<Value> {
        self.post(&format!("/agents/{id}/kill"), None).await
    }

    pub async fn respond(&self, id: &str, response: &str) -> Result<Value> {
        self.post(
            &format!("/agents/{id}/respond"),
            Some(serde_json::json!({ "response": response })),
        )
        .await
    }

    pub async fn questions(&self, task_id: Option<&str>, pending: bool) -> Result<Value> {
        let mut path = String::from("/questions?");
        if let Some(task_id) = task_id {
            path.push_str(&format!("task_id={task_id}&"));
        }
        if pending {
            path.push_str("pending=true");
        }
        self.get(&path).await
    }

    pub async fn answer(&self, id: &str, answer: &str) -> Result<Value> {
        self.post(
            &format!("/questions/{id}/answer"),
            Some(serde_json::json!({ "answer": answer })),
        )
        .await
    }

    pub async fn workflow(&self, task_id: &str) -> Result<Value> {
        self.get(&format!("/workflows/{task_id}")).await
    }

    pub async fn approve_merge(&self, id: &str, feedback: Option<&str>) -> Result<Value> {
        let body = feedback.map(|f| serde_json::json!({ "feedback": f }));
        self.post(&format!("/workflows/{id}/approve-merge"), body).await
    }

    pub async fn reject_merge(&self, id: &str, reason: Option<&str>) -> Result<Value> {
        let body = reason.map(|r| serde_json::json!({ "reason": r }));
        self.post(&format!("/workflows/{id}/reject-merge"), body).await
    }

    pub async fn cancel_workflow(&self, id: &str) -> Result<Value> {
        self.post(&format!("/workflows/{id}/cancel"), None).await
    }

    pub async fn retry_workflow(&self, id: &str) -> Result<Value> {
        self.post(&format!("/workflows/{id}/retry"), None).await
    }

    pub async fn shutdown(&self) -> Result<Value> {
        self.post("/shutdown", None).await
    }
}
