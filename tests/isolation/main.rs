//! Isolation Integration Tests
//!
//! End-to-end tests over a SQLite backend in a temp directory:
//! - Isolation: savepoint and flush cycles, sequences, serialized rollback
//! - Access: default-deny, thread confinement, alias gate
//! - Lifecycle: creation, reuse, worker suffixes
//! - Live server and test clients
//! - Query counting and on-commit capture

#[path = "../common/mod.rs"]
mod common;

mod access;
mod clients;
mod isolation;
mod lifecycle;
mod live_server;
mod query_count;
