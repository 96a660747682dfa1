//! A single-node coordination service.
//!
//! Stores a tree of versioned byte nodes in SQLite and serves them over the
//! `coord.Coordinator` gRPC service. Every create and write is broadcast to
//! watch subscribers. There is no replication and no session tracking: one
//! process, one database.

pub mod db;
pub mod grpc;
pub mod models;
pub mod storage;
