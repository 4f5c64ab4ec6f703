//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::{Arc, Once};

pub use isodb::{
    params, AccessBlocker, AppConfig, AppContext, AppRegistry, Backend, ConnectionHandler,
    DjangoDbMark, IsoError, IsoResult, Migration, Model, Outcome, Request, Response, Session,
    SessionBuilder, SessionConfig, Settings, SqliteBackend, TestContext, TestItem, User,
    UserModel, WorkerEnv,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Apps
// ============================================================================

/// `shop` (migrated, seeded by a data migration) and `auth` (unmigrated).
pub fn apps() -> AppRegistry {
    AppRegistry::new()
        .with_app(
            AppConfig::new("shop")
                .with_model(Model::new(
                    "shop_item",
                    "CREATE TABLE shop_item (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
                ))
                .with_migration(Migration::new(
                    "0001_initial",
                    "CREATE TABLE shop_item (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
                ))
                .with_migration(Migration::new(
                    "0002_seed",
                    "INSERT INTO shop_item (name) VALUES ('seed')",
                )),
        )
        .with_app(AppConfig::new("auth").with_model(Model::new(
            "auth_user",
            "CREATE TABLE auth_user (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             username TEXT NOT NULL UNIQUE, \
             email TEXT NOT NULL, \
             password TEXT NOT NULL, \
             is_superuser INTEGER NOT NULL DEFAULT 0, \
             is_staff INTEGER NOT NULL DEFAULT 0)",
        )))
}

/// Count rows of `table` through the default connection.
pub fn count(connections: &ConnectionHandler, table: &str) -> IsoResult<i64> {
    let row = connections
        .default_connection()?
        .query_row(&format!("SELECT COUNT(*) AS n FROM {}", table), params![])?;
    Ok(row.and_then(|r| r.get_int("n")).unwrap_or(0))
}

// ============================================================================
// User model
// ============================================================================

/// User model over the `auth_user` table.
#[derive(Debug, Default)]
pub struct TableUserModel;

impl UserModel for TableUserModel {
    fn get_by_natural_key(
        &self,
        connections: &ConnectionHandler,
        username: &str,
    ) -> IsoResult<Option<User>> {
        let row = connections.default_connection()?.query_row(
            "SELECT id, username, is_superuser, is_staff FROM auth_user WHERE username = ?1",
            params![username],
        )?;
        Ok(row.map(|r| User {
            id: r.get_int("id").unwrap_or_default(),
            username: r.get_str("username").unwrap_or_default().to_string(),
            is_superuser: r.get_int("is_superuser") == Some(1),
            is_staff: r.get_int("is_staff") == Some(1),
        }))
    }

    fn create_superuser(
        &self,
        connections: &ConnectionHandler,
        username: &str,
        email: &str,
        password: &str,
    ) -> IsoResult<User> {
        let conn = connections.default_connection()?;
        conn.execute(
            "INSERT INTO auth_user (username, email, password, is_superuser, is_staff) \
             VALUES (?1, ?2, ?3, 1, 1)",
            params![username, email, password],
        )?;
        Ok(User {
            id: conn.last_insert_id()?,
            username: username.to_string(),
            is_superuser: true,
            is_staff: true,
        })
    }
}

// ============================================================================
// Application
// ============================================================================

/// Small application over `shop_item`.
pub fn shop_app(request: &Request, ctx: &AppContext) -> IsoResult<Response> {
    match (request.method(), request.path()) {
        ("GET", "/items") => Ok(Response::ok(count(&ctx.connections, "shop_item")?.to_string())),
        ("POST", "/items") => {
            let name = String::from_utf8_lossy(request.body()).to_string();
            ctx.connections
                .default_connection()?
                .execute("INSERT INTO shop_item (name) VALUES (?1)", params![name])?;
            Ok(Response::text(201, "created"))
        }
        ("GET", "/urlconf") => Ok(Response::ok(
            ctx.settings.get_str("ROOT_URLCONF").unwrap_or_default(),
        )),
        ("GET", "/whoami") => Ok(Response::ok(
            request
                .user()
                .map_or_else(|| "anonymous".to_string(), |u| u.username.clone()),
        )),
        _ => Ok(Response::text(404, "not found")),
    }
}

// ============================================================================
// TestEnv - temp directory, backend and blocker
// ============================================================================

/// Temp directory with a SQLite backend and a private blocker.
pub struct TestEnv {
    pub dir: TempDir,
    pub backend: Arc<SqliteBackend>,
    pub blocker: Arc<AccessBlocker>,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("tempdir");
        let backend = Arc::new(SqliteBackend::new(dir.path()));
        Self {
            dir,
            backend,
            blocker: AccessBlocker::new_shared(),
        }
    }

    /// Env whose backend has no transaction support.
    pub fn without_transactions() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("tempdir");
        let backend = Arc::new(SqliteBackend::new(dir.path()).without_transactions());
        Self {
            dir,
            backend,
            blocker: AccessBlocker::new_shared(),
        }
    }

    /// Builder wired to this env, the shop apps and the shop application.
    pub fn builder(&self, config: SessionConfig) -> SessionBuilder {
        Session::builder(config, self.backend.clone())
            .with_apps(apps())
            .with_blocker(Arc::clone(&self.blocker))
            .with_settings(Arc::new(Settings::new()))
            .with_app(Arc::new(shop_app))
            .with_user_model(Arc::new(TableUserModel))
            .with_worker_env(WorkerEnv::new())
    }

    /// Built and prepared session for `items`.
    pub fn session(&self, config: SessionConfig, items: &[TestItem]) -> Session {
        let mut session = self.builder(config).build().expect("build session");
        session.prepare(items).expect("prepare session");
        session
    }
}
