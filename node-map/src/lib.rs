//! A key-value map stored as one JSON object in a coordination service node.
//!
//! `node-map` turns a single node of a ZooKeeper-like service into a map
//! that every process can read from a local cache and mutate concurrently.
//! Writes use optimistic concurrency control against the node's version,
//! and watches keep every cache current.
//!
//! # Features
//!
//! - Compare-and-swap writes with jittered retry on version conflicts
//! - Lazy creation of the node and its parents on first write
//! - Watch and reconnect driven cache refresh in a background task
//! - Change listeners with per-listener error isolation
//! - In-process ([`MemoryEnsemble`]) and gRPC ([`GrpcCoordinator`]) sessions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use node_map::{GrpcCoordinator, Options, Storage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let zk = GrpcCoordinator::connect("localhost:50051").await?;
//!     let storage = Storage::new(Arc::new(zk), "/rollout/features", Options::default()).await?;
//!
//!     storage.set("feature:chat:percentage", 25).await;
//!     assert_eq!(storage.get("feature:chat:percentage"), Some("25".to_string()));
//!     Ok(())
//! }
//! ```

mod cache;
mod error;
mod hashtable;
mod listeners;
mod storage;
mod sync;

pub mod coordinator;
pub mod memory;
pub mod remote;

pub use coordinator::{CoordError, Coordinator, EventKind, Stat, WatchEvent};
pub use error::{BoxError, Error};
pub use hashtable::{DistributedHashtable, Options};
pub use listeners::{ErrorHandler, Listener};
pub use memory::{MemoryCoordinator, MemoryEnsemble};
pub use remote::{GrpcCoordinator, RemoteOptions, ServerAddr};
pub use storage::Storage;
