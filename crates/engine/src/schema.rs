//! Application registry and schema strategies
//!
//! The registry lists installed apps with their models (current DDL) and
//! ordered migrations. A [`SchemaStrategy`] builds the schema of a freshly
//! created test database:
//! - [`MigrationExecutor`]: runs every unapplied migration and records it in
//!   the `isodb_migrations` table; apps without migrations get their DDL
//! - [`DisableMigrations`]: applies each model's current DDL directly
//!
//! Flushing and snapshotting only ever touch model tables, never the
//! migration recorder.

use crate::connection::Connection;
use chrono::Utc;
use isodb_core::{params, IsoError, IsoResult};
use std::collections::BTreeSet;
use std::fmt::Debug;
use tracing::debug;

/// Table recording applied migrations
pub const MIGRATIONS_TABLE: &str = "isodb_migrations";

/// One model and the DDL creating its table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    /// Table name
    pub table: String,
    /// `CREATE TABLE` statement(s) for the current schema
    pub create_sql: String,
}

impl Model {
    /// Model backed by `table`
    pub fn new(table: impl Into<String>, create_sql: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            create_sql: create_sql.into(),
        }
    }
}

/// One migration step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Migration name, unique within its app
    pub name: String,
    /// Statements to execute
    pub sql: String,
}

impl Migration {
    /// Migration executing `sql`
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// One installed app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// App label
    pub label: String,
    /// Models, in dependency order
    pub models: Vec<Model>,
    /// Migrations, in application order
    pub migrations: Vec<Migration>,
}

impl AppConfig {
    /// Empty app
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            models: Vec::new(),
            migrations: Vec::new(),
        }
    }

    /// Add a model
    pub fn with_model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    /// Add a migration
    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }
}

/// Installed apps, in installation order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRegistry {
    apps: Vec<AppConfig>,
}

impl AppRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an app
    pub fn with_app(mut self, app: AppConfig) -> Self {
        self.apps.push(app);
        self
    }

    /// Installed apps
    pub fn apps(&self) -> &[AppConfig] {
        &self.apps
    }

    /// Look up an app by label
    pub fn get(&self, label: &str) -> Option<&AppConfig> {
        self.apps.iter().find(|a| a.label == label)
    }

    /// Model tables of every app
    pub fn all_tables(&self) -> Vec<String> {
        self.tables_for(None)
    }

    /// Model tables of the given apps (all apps when `None`)
    ///
    /// Unknown labels contribute nothing.
    pub fn tables_for(&self, available_apps: Option<&[String]>) -> Vec<String> {
        let allowed: Option<BTreeSet<&str>> =
            available_apps.map(|apps| apps.iter().map(String::as_str).collect());
        self.apps
            .iter()
            .filter(|app| {
                allowed
                    .as_ref()
                    .map_or(true, |set| set.contains(app.label.as_str()))
            })
            .flat_map(|app| app.models.iter().map(|m| m.table.clone()))
            .collect()
    }
}

/// How a fresh test database gets its schema
pub trait SchemaStrategy: Send + Sync + Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Build the schema on `conn`
    ///
    /// # Errors
    ///
    /// Any statement failure; the caller reports it as a provisioning error.
    fn apply(&self, conn: &Connection, apps: &AppRegistry) -> IsoResult<()>;
}

/// Runs migrations and records them
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationExecutor;

impl MigrationExecutor {
    fn ensure_recorder(conn: &Connection) -> IsoResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             app TEXT NOT NULL, \
             name TEXT NOT NULL, \
             applied TEXT NOT NULL)",
            MIGRATIONS_TABLE
        ))
    }

    /// `(app, name)` pairs already applied on `conn`
    pub fn applied(conn: &Connection) -> IsoResult<BTreeSet<(String, String)>> {
        Self::ensure_recorder(conn)?;
        let rows = conn.query(
            &format!("SELECT app, name FROM {}", MIGRATIONS_TABLE),
            &[],
        )?;
        Ok(rows
            .iter()
            .filter_map(|r| Some((r.get_str("app")?.to_string(), r.get_str("name")?.to_string())))
            .collect())
    }
}

impl SchemaStrategy for MigrationExecutor {
    fn name(&self) -> &'static str {
        "migrate"
    }

    fn apply(&self, conn: &Connection, apps: &AppRegistry) -> IsoResult<()> {
        let applied = Self::applied(conn)?;
        let existing = conn.table_names()?;
        for app in apps.apps() {
            if app.migrations.is_empty() {
                // unmigrated apps get their current DDL
                for model in app.models.iter().filter(|m| !existing.contains(&m.table)) {
                    conn.execute_batch(&model.create_sql)?;
                    debug!(target: "isodb::schema", app = %app.label, table = %model.table, "synced unmigrated table");
                }
                continue;
            }
            for migration in &app.migrations {
                if applied.contains(&(app.label.clone(), migration.name.clone())) {
                    continue;
                }
                conn.atomic(|c| -> IsoResult<()> {
                    c.execute_batch(&migration.sql)?;
                    c.execute(
                        &format!(
                            "INSERT INTO {} (app, name, applied) VALUES (?1, ?2, ?3)",
                            MIGRATIONS_TABLE
                        ),
                        params![
                            app.label.as_str(),
                            migration.name.as_str(),
                            Utc::now().to_rfc3339()
                        ],
                    )?;
                    Ok(())
                })
                .map_err(|e| {
                    IsoError::database(
                        conn.vendor(),
                        format!("migration {}.{} failed: {}", app.label, migration.name, e),
                    )
                })?;
                debug!(target: "isodb::schema", app = %app.label, migration = %migration.name, "applied migration");
            }
        }
        Ok(())
    }
}

/// Applies current model DDL without running migrations
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableMigrations;

impl SchemaStrategy for DisableMigrations {
    fn name(&self) -> &'static str {
        "syncdb"
    }

    fn apply(&self, conn: &Connection, apps: &AppRegistry) -> IsoResult<()> {
        for app in apps.apps() {
            for model in &app.models {
                conn.execute_batch(&model.create_sql)?;
                debug!(target: "isodb::schema", app = %app.label, table = %model.table, "created table");
            }
        }
        Ok(())
    }
}
