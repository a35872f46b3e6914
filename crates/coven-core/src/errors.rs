//! Domain error kinds shared across the daemon and its API surface.

use serde::{Deserialize, Serialize};

/// Closed set of domain error kinds.
///
/// The API maps these to HTTP statuses; everything else is `internal_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyClaimed,
    AlreadyAnswered,
    InvalidTransition,
    AgentNotRunning,
    StdinClosed,
    StepTimeout,
    WorkflowTimeout,
    GrimoireResolutionFailed,
    TemplateError,
    WorktreeError,
    MergeConflict,
    NotPendingMerge,
    NotRunning,
    StaleClaim,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyClaimed => "already_claimed",
            Self::AlreadyAnswered => "already_answered",
            Self::InvalidTransition => "invalid_transition",
            Self::AgentNotRunning => "agent_not_running",
            Self::StdinClosed => "stdin_closed",
            Self::StepTimeout => "step_timeout",
            Self::WorkflowTimeout => "workflow_timeout",
            Self::GrimoireResolutionFailed => "grimoire_resolution_failed",
            Self::TemplateError => "template_error",
            Self::WorktreeError => "worktree_error",
            Self::MergeConflict => "merge_conflict",
            Self::NotPendingMerge => "not_pending_merge",
            Self::NotRunning => "not_running",
            Self::StaleClaim => "stale_claim",
            Self::InternalError => "internal_error",
        }
    }

    /// HTTP status code for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::AlreadyClaimed
            | Self::AlreadyAnswered
            | Self::InvalidTransition
            | Self::NotPendingMerge
            | Self::NotRunning => 409,
            Self::AgentNotRunning | Self::StdinClosed | Self::MergeConflict => 409,
            Self::StepTimeout
            | Self::WorkflowTimeout
            | Self::GrimoireResolutionFailed
            | Self::TemplateError
            | Self::WorktreeError
            | Self::StaleClaim
            | Self::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::AlreadyClaimed.http_status(), 409);
        assert_eq!(ErrorKind::AlreadyAnswered.http_status(), 409);
        assert_eq!(ErrorKind::InvalidTransition.http_status(), 409);
        assert_eq!(ErrorKind::InternalError.http_status(), 500);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StepTimeout).unwrap();
        assert_eq!(json, "\"step_timeout\"");
    }
}
