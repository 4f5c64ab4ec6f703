//! Test isolation engine for isodb
//!
//! This crate orchestrates the lower layers around a test run:
//! - Session: prepare databases, run items, tear everything down
//! - Lifecycle: create, reuse and destroy physical test databases
//! - Isolation: savepoint or flush isolation per test
//! - Connection: gated connections with atomic blocks and on-commit hooks
//! - HTTP: test clients, request factories and the live server
//!
//! The engine is the only component that knows about:
//! - Test database naming and worker suffixes
//! - Serialized-rollback snapshots
//! - Fixture resolution for test bodies

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod fixtures;
pub mod http;
pub mod isolation;
pub mod item;
pub mod lifecycle;
pub mod naming;
pub mod schema;
pub mod session;
pub mod snapshot;

pub use config::{DatabaseConfig, SessionConfig, TestDatabaseConfig, WorkerEnv};
pub use connection::{AliasGate, AtomicToken, CapturedQuery, Connection, ConnectionHandler};
pub use fixtures::{AssertNumQueries, CaptureOnCommitCallbacks, CapturedCallbacks};
pub use http::client::{AsyncClient, AsyncRequestFactory, Client, RequestFactory};
pub use http::live_server::{parse_address, LiveServer, LiveServerAddress};
pub use http::{AppContext, HttpApp, Request, Response, User, UserModel};
pub use isolation::{IsolationGuard, IsolationMode, IsolationPlan};
pub use item::{databases_for_setup, order_items, DatabasePlan, NativeCaseKind, TestItem};
pub use lifecycle::{DatabaseSetup, LifecycleManager, SetupOptions, SetupState};
pub use naming::{test_database_name, TestDatabaseHandle};
pub use schema::{AppConfig, AppRegistry, DisableMigrations, Migration, MigrationExecutor, Model, SchemaStrategy};
pub use session::{Outcome, Session, SessionBuilder, SessionReport, TestContext, TestReport};
pub use snapshot::SerializedSnapshot;
