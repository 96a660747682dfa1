//! Error types for nodemap commands.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("node-map error: {0}")]
    NodeMap(#[from] node_map::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(String),
}
