//! Database backends for isodb
//!
//! This crate defines the engine seam and ships one implementation:
//! - Backend / RawConnection: traits the isolation engine drives
//! - Features: capability flags (transactions, savepoints)
//! - SqliteBackend: file-backed SQLite via rusqlite

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod sqlite;
pub mod traits;

pub use sqlite::{SqliteBackend, SqliteConnection};
pub use traits::{Backend, Features, RawConnection, IN_MEMORY_NAME};
