//! Event types for the durable log and the SSE stream.

use crate::types::{Id, TaskStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};

/// Closed set of event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.blocked")]
    WorkflowBlocked,
    #[serde(rename = "workflow.paused")]
    WorkflowPaused,
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "workflow.pending_merge")]
    WorkflowPendingMerge,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.output")]
    AgentOutput,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.failed")]
    AgentFailed,
    #[serde(rename = "agent.killed")]
    AgentKilled,
    #[serde(rename = "questions.asked")]
    QuestionsAsked,
    #[serde(rename = "questions.answered")]
    QuestionsAnswered,
    #[serde(rename = "review.check.completed")]
    ReviewCheckCompleted,
    #[serde(rename = "state.snapshot")]
    StateSnapshot,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowBlocked => "workflow.blocked",
            Self::WorkflowPaused => "workflow.paused",
            Self::WorkflowResumed => "workflow.resumed",
            Self::WorkflowPendingMerge => "workflow.pending_merge",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::StepCompleted => "step.completed",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskUpdated => "task.updated",
            Self::AgentStarted => "agent.started",
            Self::AgentOutput => "agent.output",
            Self::AgentCompleted => "agent.completed",
            Self::AgentFailed => "agent.failed",
            Self::AgentKilled => "agent.killed",
            Self::QuestionsAsked => "questions.asked",
            Self::QuestionsAnswered => "questions.answered",
            Self::ReviewCheckCompleted => "review.check.completed",
            Self::StateSnapshot => "state.snapshot",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Payload for workflow lifecycle events (`workflow.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventPayload {
    pub workflow_id: Id,
    pub task_id: String,
    pub grimoire: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

/// Payload for `step.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub workflow_id: Id,
    pub step_name: String,
    pub step_type: String,
    pub success: bool,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for task lifecycle events (`task.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventPayload {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Id>,
}

/// Payload for agent lifecycle events (`agent.started/completed/failed/killed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEventPayload {
    pub step_task_id: String,
    pub workflow_id: Id,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Payload for `agent.output`, one line per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub step_task_id: String,
    /// Per-agent line sequence, independent of the log's event sequence.
    pub seq: u64,
    /// `stdout` or `stderr`.
    pub stream: String,
    pub text: String,
}

/// Payload for `questions.asked` / `questions.answered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionEventPayload {
    pub question_id: Id,
    pub task_id: String,
    pub step_task_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_answers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<bool>,
}

/// Payload for `review.check.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCheckPayload {
    pub workflow_id: Id,
    pub task_id: String,
    pub clean: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

/// Union of all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Workflow(WorkflowEventPayload),
    StepCompleted(StepCompletedPayload),
    Task(TaskEventPayload),
    Agent(AgentEventPayload),
    AgentOutput(AgentOutputPayload),
    Question(QuestionEventPayload),
    ReviewCheck(ReviewCheckPayload),
    /// Free-form payload for snapshot and heartbeat frames.
    Raw(serde_json::Value),
}

impl EventPayload {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_are_dotted() {
        assert_eq!(EventType::WorkflowStarted.as_str(), "workflow.started");
        assert_eq!(
            EventType::WorkflowPendingMerge.as_str(),
            "workflow.pending_merge"
        );
        assert_eq!(EventType::QuestionsAsked.as_str(), "questions.asked");
        assert_eq!(
            EventType::ReviewCheckCompleted.as_str(),
            "review.check.completed"
        );
        assert_eq!(EventType::Heartbeat.as_str(), "heartbeat");
    }

    #[test]
    fn serde_names_match_as_str() {
        let ty = EventType::AgentOutput;
        let json = serde_json::to_string(&ty).unwrap();
        assert_eq!(json, format!("\"{}\"", ty.as_str()));
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }

    #[test]
    fn agent_output_payload_round_trip() {
        let payload = EventPayload::AgentOutput(AgentOutputPayload {
            step_task_id: "wf-1:implement".to_string(),
            seq: 42,
            stream: "stdout".to_string(),
            text: "hello".to_string(),
        });
        let json = payload.to_json().unwrap();
        assert!(json.contains("\"seq\":42"));
        assert!(json.contains("wf-1:implement"));
    }
}
