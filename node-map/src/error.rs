//! Error types for node-map operations.

use thiserror::Error;

use crate::coordinator::CoordError;

/// Boxed error type returned by change listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Coordinator(#[from] CoordError),

    #[error("node payload is not a JSON object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("write conflict after {0} retries")]
    Conflict(usize),

    #[error("change listener failed: {0}")]
    Listener(BoxError),
}

impl Error {
    /// Timeouts and lost connections. These are reported, never retried.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Coordinator(e) => e.is_connectivity(),
            _ => false,
        }
    }
}
