//! The coordination service seam.
//!
//! A [`Coordinator`] is one session against a hierarchical store of
//! versioned byte nodes. The hashtable only ever talks to this trait, so the
//! in-process ensemble and the gRPC client are interchangeable.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by a coordination session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("version mismatch at {0}")]
    BadVersion(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("operation timed out")]
    OperationTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("coordination service error: {0}")]
    Other(String),
}

impl CoordError {
    /// Whether the failure comes from the session rather than the data.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, CoordError::OperationTimeout | CoordError::NotConnected)
    }
}

/// Node metadata returned alongside its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Starts at 0 on create and increments on every successful write.
    pub version: i32,
    pub data_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Changed,
    Deleted,
}

/// Notifications delivered to every subscriber of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// An armed watch on `path` fired. The watch is now disarmed.
    Node { path: String, kind: EventKind },
    /// The session (re)gained its connection. Watches armed before a
    /// disconnect are gone.
    Connected,
    Disconnected,
}

/// One session against a coordination service.
///
/// Watches are one-shot: `get` or `exists` with `watch` set arms a watch on
/// the path for this session, and the next create, change or delete of that
/// path delivers a single [`WatchEvent::Node`] through [`Coordinator::events`].
/// `get` on a missing node arms nothing; use `exists` to wait for creation.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Fetches a node's payload and stat. Fails with `NoNode` if absent.
    async fn get(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), CoordError>;

    /// Writes `data` if the node is at `version` (`-1` matches any version).
    /// Fails with `BadVersion` on mismatch and `NoNode` if the node is gone.
    async fn set(&self, path: &str, data: Vec<u8>, version: i32) -> Result<Stat, CoordError>;

    /// Creates a node. Fails with `NodeExists` if present and `NoNode` if the
    /// parent is missing.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<Stat, CoordError>;

    async fn exists(&self, path: &str, watch: bool) -> Result<bool, CoordError>;

    /// Subscribes to node and connection events for this session.
    fn events(&self) -> broadcast::Receiver<WatchEvent>;

    /// Creates `path` and every missing ancestor with empty payloads.
    /// Nodes that already exist are left untouched.
    async fn mkdir_p(&self, path: &str) -> Result<(), CoordError> {
        for prefix in prefixes(path)? {
            match self.create(prefix, Vec::new()).await {
                Ok(_) | Err(CoordError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Checks that `path` is absolute, has no empty segments and no trailing
/// slash (except the root itself).
pub fn validate_path(path: &str) -> Result<(), CoordError> {
    if path == "/" {
        return Ok(());
    }
    let invalid = !path.starts_with('/') || path[1..].split('/').any(str::is_empty);
    if invalid {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Parent of a node path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Every non-root prefix of `path`, shortest first: `/a/b` yields `/a`, `/a/b`.
pub fn prefixes(path: &str) -> Result<Vec<&str>, CoordError> {
    validate_path(path)?;
    if path == "/" {
        return Ok(Vec::new());
    }
    let mut out: Vec<&str> = path
        .match_indices('/')
        .skip(1)
        .map(|(idx, _)| &path[..idx])
        .collect();
    out.push(path);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_paths() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a").is_ok());
        assert!(validate_path("/a/b/c").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
    }

    #[test]
    fn prefixes_shortest_first() {
        assert_eq!(prefixes("/a/b/c").unwrap(), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(prefixes("/a").unwrap(), vec!["/a"]);
        assert!(prefixes("/").unwrap().is_empty());
        assert_eq!(
            prefixes("nope"),
            Err(CoordError::InvalidPath("nope".to_string()))
        );
    }

    #[test]
    fn connectivity_classification() {
        assert!(CoordError::OperationTimeout.is_connectivity());
        assert!(CoordError::NotConnected.is_connectivity());
        assert!(!CoordError::BadVersion("/a".into()).is_connectivity());
    }
}
