use crate::models::{Node, NodeEvent, NodeEventKind};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Versioned node tree. Mutations are published to [`Storage::subscribe`].
pub struct Storage {
    pool: SqlitePool,
    events: broadcast::Sender<NodeEvent>,
}

impl Storage {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { pool, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, path: &str) -> Result<Node, StorageError> {
        validate_path(path)?;
        let row = sqlx::query("SELECT path, data, version, mtime FROM nodes WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NoNode(path.to_string()))?;

        Ok(Node {
            path: row.get("path"),
            data: row.get("data"),
            version: row.get("version"),
            mtime: row.get("mtime"),
        })
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_path(path)?;
        let row = sqlx::query("SELECT 1 FROM nodes WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn create(&self, path: &str, data: Vec<u8>) -> Result<Node, StorageError> {
        validate_path(path)?;
        let parent = parent(path).ok_or_else(|| StorageError::NodeExists(path.to_string()))?;
        if !self.exists(parent).await? {
            return Err(StorageError::NoNode(parent.to_string()));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let inserted = sqlx::query(
            "INSERT INTO nodes (path, data, version, mtime) VALUES (?, ?, 0, ?)
             ON CONFLICT(path) DO NOTHING
             RETURNING version",
        )
        .bind(path)
        .bind(&data)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            return Err(StorageError::NodeExists(path.to_string()));
        }

        let node = Node {
            path: path.to_string(),
            data,
            version: 0,
            mtime: now,
        };
        let _ = self.events.send(NodeEvent::new(&node, NodeEventKind::Created));
        Ok(node)
    }

    /// Overwrites a node if its version equals `expected_version`, or
    /// unconditionally when `expected_version` is -1.
    pub async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: i32,
    ) -> Result<Node, StorageError> {
        validate_path(path)?;
        let now = chrono::Utc::now().timestamp_millis();

        let updated = sqlx::query(
            "UPDATE nodes SET data = ?, version = version + 1, mtime = ?
             WHERE path = ? AND (? = -1 OR version = ?)
             RETURNING version",
        )
        .bind(&data)
        .bind(now)
        .bind(path)
        .bind(expected_version)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = updated else {
            return Err(if self.exists(path).await? {
                StorageError::BadVersion(path.to_string(), expected_version)
            } else {
                StorageError::NoNode(path.to_string())
            });
        };

        let node = Node {
            path: path.to_string(),
            data,
            version: row.get("version"),
            mtime: now,
        };
        let _ = self.events.send(NodeEvent::new(&node, NodeEventKind::Changed));
        Ok(node)
    }
}

fn validate_path(path: &str) -> Result<(), StorageError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

#[derive(Debug)]
pub enum StorageError {
    NoNode(String),
    NodeExists(String),
    BadVersion(String, i32),
    InvalidPath(String),
    Sql(sqlx::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Sql(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NoNode(path) => write!(f, "No node: {}", path),
            StorageError::NodeExists(path) => write!(f, "Node exists: {}", path),
            StorageError::BadVersion(path, expected) => {
                write!(f, "Bad version: {} is not at version {}", path, expected)
            }
            StorageError::InvalidPath(path) => write!(f, "Invalid path: {:?}", path),
            StorageError::Sql(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}
