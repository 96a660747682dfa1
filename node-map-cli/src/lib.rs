//! Commands behind the `nodemap` binary.
//!
//! Each command binds a [`DistributedHashtable`](node_map::DistributedHashtable)
//! to one node, refreshes it, and either reports the cached state or commits
//! a single update. Values given on the command line are stored as strings,
//! the same way [`Storage`](node_map::Storage) stores them; `merge` takes a
//! JSON object and keeps its value types.
//!
//! ```no_run
//! use std::sync::Arc;
//! use node_map::{DistributedHashtable, GrpcCoordinator, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let zk = GrpcCoordinator::connect("localhost:50051").await?;
//!     let map = DistributedHashtable::new(Arc::new(zk), "/node-map", Options::default()).await?;
//!
//!     node_map_cli::set(&map, "owner", "ops").await?;
//!     println!("{}", node_map_cli::dump(&map).await?);
//!     Ok(())
//! }
//! ```

mod commands;
mod error;

pub use commands::{delete, dump, get, merge, set};
pub use error::Error;
