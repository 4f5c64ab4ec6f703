//! isodb - database test isolation for database-backed applications
//!
//! isodb sits between a test runner and the application's database layer.
//! Tests declare what they need through fixtures and marks; isodb creates
//! the test databases, isolates every test in a rolled-back transaction or
//! a flush cycle, blocks database access for tests that did not ask for it,
//! and serves the application from a live server thread on request.
//!
//! # Quick Start
//!
//! ```no_run
//! use isodb::{Session, SessionConfig, SqliteBackend, TestItem};
//! use std::sync::Arc;
//!
//! # fn main() -> isodb::IsoResult<()> {
//! let backend = Arc::new(SqliteBackend::new("/tmp/isodb"));
//! let mut session = Session::builder(SessionConfig::new(), backend).build()?;
//!
//! let items = vec![TestItem::new("tests::creates_order").fixture("db")];
//! session.prepare(&items)?;
//! for item in &items {
//!     let report = session.run_item(item, |ctx| {
//!         ctx.connection("default")?.query("SELECT 1", &[])?;
//!         Ok(())
//!     });
//!     assert!(report.passed());
//! }
//! session.finish();
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - `isodb-core`: errors, values, the access blocker, settings, marks,
//!   fixture names and isolation requests
//! - `isodb-backend`: the backend traits and the SQLite backend
//! - `isodb-engine`: lifecycle, isolation, connections, HTTP and sessions

pub use isodb_backend::{Backend, Features, RawConnection, SqliteBackend, IN_MEMORY_NAME};
pub use isodb_core::{
    params, AccessBlocker, BlockerGuard, DatabaseSelection, DjangoDbMark, FixtureName, FixtureSet,
    IsoError, IsoResult, IsolationRequest, Mark, MarkValue, Row, Settings, SettingsOverride,
    SettingsWrapper, Value, ACCESS_BLOCKED_MESSAGE, ALL_DATABASES, DEFAULT_DB_ALIAS,
};
pub use isodb_engine::*;
