//! Container lifecycle error types.

use thiserror::Error;

/// Result type alias for daemon operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while talking to a container daemon.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The daemon did not answer the liveness probe.
    #[error("cannot reach daemon at {target}: {message}")]
    Connection { target: String, message: String },

    /// Image absent both from the registry and the local store.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Daemon-level failure for a specific container.
    #[error("container error: {0}")]
    Container(String),

    /// The container was created but never reached the running state.
    #[error("container failed to start: {0}")]
    Start(String),

    /// Non-success response from the Engine API.
    #[error("daemon API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("image build failed: {0}")]
    Build(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn api(status: http::StatusCode, message: impl Into<String>) -> Self {
        EngineError::Api {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// True for a 404 from the daemon.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Api { status: 404, .. })
    }
}
