//! Error types for the dialog control plane

use thiserror::Error;

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced by capability agents and the shared coordination services.
///
/// Race losses (a cancel for an already completed directive, a release that
/// beat a promotion) are not errors; those paths return `false`/`None`.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid {directive} payload: {reason}")]
    InvalidPayload { directive: String, reason: String },

    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("focus channel '{0}' is not configured")]
    UnknownChannel(String),

    #[error("focus on '{0}' was not granted")]
    FocusDenied(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("executor '{0}' is shut down")]
    ExecutorClosed(String),

    #[error("{0} was abandoned before completing")]
    Abandoned(&'static str),

    #[error("synchronous call would wait on its own executor '{0}'")]
    Reentrant(String),

    #[error("audio input unavailable: {0}")]
    AudioInput(String),

    #[error("media player error: {0}")]
    Media(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("directive {0} is unknown or already finished")]
    UnknownDirective(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn invalid_payload(directive: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::InvalidPayload {
            directive: directive.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        AgentError::InvalidState {
            operation,
            state: format!("{:?}", state),
        }
    }
}
