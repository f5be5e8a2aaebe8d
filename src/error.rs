use thiserror::Error;

/// Engine-level error taxonomy surfaced to external collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("audio server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("server command failed: {0}")]
    CommandFailed(String),

    #[error("owned object already gone: {0}")]
    InconsistentTopology(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Errors from a single request/response exchange with the audio server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The target object no longer exists on the server. Callers tearing
    /// down owned objects treat this as success.
    #[error("no such object")]
    NotFound,

    #[error("malformed server output: {0}")]
    Parse(String),
}

impl From<ServerError> for EngineError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Unavailable(msg) => EngineError::ServerUnavailable(msg),
            ServerError::NotFound => EngineError::InconsistentTopology("no such object".into()),
            other => EngineError::CommandFailed(other.to_string()),
        }
    }
}
