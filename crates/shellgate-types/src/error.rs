use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::command::CommandState;

/// Errors surfaced by the orchestration core.
///
/// Every variant renders a human-readable reason; callers show it to the user
/// as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("session limit reached: at most {limit} concurrent sessions")]
    ResourceLimitExceeded { limit: usize },

    #[error("backend creation failed: {0}")]
    BackendCreateFailed(String),

    #[error("backend did not respond to {operation} within {timeout_ms}ms")]
    BackendUnresponsive { operation: String, timeout_ms: u64 },

    #[error("backend is not accepting input: {0}")]
    BackendClosed(String),

    #[error("command rejected: {reason}")]
    CommandRejected { reason: String },

    #[error("access denied: {} escapes workspace root {}", path.display(), root.display())]
    AccessDenied { path: PathBuf, root: PathBuf },

    #[error("connection rate limited, retry after {retry_after_ms}ms")]
    ConnectionRateLimited { retry_after_ms: u64 },

    #[error("session terminated: {0}")]
    SessionTerminated(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("command not found: {0}")]
    CommandNotFound(Uuid),

    #[error("invalid command transition from {from} to {to}")]
    InvalidTransition { from: CommandState, to: CommandState },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GateError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        GateError::CommandRejected {
            reason: reason.into(),
        }
    }

    pub fn unresponsive(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        GateError::BackendUnresponsive {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Errors that end the owning session rather than a single command
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            GateError::SessionTerminated(_) | GateError::BackendClosed(_)
        )
    }
}
