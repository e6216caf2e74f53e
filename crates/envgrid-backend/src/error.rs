//! Backend error types.

use std::error::Error as StdError;

use thiserror::Error;

use envgrid_engine::EngineError;

use crate::transport::TransportError;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by a [`Backend`](crate::Backend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// Catch-all for transport failures and pool-level invariant
    /// violations. Keeps the original cause.
    #[error("{message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// Daemon-level failure while constructing or tearing down a container.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        BackendError::Backend {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The wrapped transport error, if this came from a remote call.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            BackendError::Backend {
                source: Some(src), ..
            } => src.downcast_ref::<TransportError>(),
            _ => None,
        }
    }
}
