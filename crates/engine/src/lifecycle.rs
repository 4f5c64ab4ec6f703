//! Test database lifecycle
//!
//! Session-scoped creation, reuse and destruction of the physical test
//! databases. [`LifecycleManager::ensure_databases`] must run with the access
//! blocker unblocked; the session wraps it in a scoped unblock.
//!
//! Reuse: with `keep_existing` and without `force_create`, an existing test
//! database is probed and reused as-is, skipping schema creation entirely.
//! Otherwise any leftover database is destroyed and a fresh one created.
//! `keep_existing` also keeps databases at teardown, even when
//! `force_create` rebuilt them.
//!
//! Teardown never raises: failures come back as warning strings.

use crate::connection::ConnectionHandler;
use crate::naming::TestDatabaseHandle;
use crate::schema::{AppRegistry, DisableMigrations, MigrationExecutor, SchemaStrategy};
use crate::snapshot::SerializedSnapshot;
use isodb_backend::Backend;
use isodb_core::{IsoError, IsoResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

macro_rules! lifecycle_log {
    ($verbosity:expr, $($arg:tt)+) => {
        if $verbosity >= 1 {
            info!(target: "isodb::lifecycle", $($arg)+);
        } else {
            debug!(target: "isodb::lifecycle", $($arg)+);
        }
    };
}

/// Options of one setup run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupOptions {
    /// Run migrations (otherwise apply model DDL directly)
    pub use_migrations: bool,
    /// Reuse existing test databases and keep them afterwards
    pub keep_existing: bool,
    /// Re-create even when `keep_existing` is set
    pub force_create: bool,
    /// Aliases to set up; mirrors resolve to their target
    pub aliases: Vec<String>,
    /// Aliases whose initial data is snapshotted
    pub serialized_aliases: BTreeSet<String>,
    /// Output verbosity
    pub verbosity: u8,
}

/// What happened to one database during setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    /// Freshly created with a new schema
    Created,
    /// Existing database reused without schema work
    Reused,
}

#[derive(Debug, Clone)]
struct SetupEntry {
    alias: String,
    test_name: String,
    state: SetupState,
}

/// Result of [`LifecycleManager::ensure_databases`], consumed by teardown
#[derive(Debug, Clone)]
pub struct DatabaseSetup {
    entries: Vec<SetupEntry>,
    keep: bool,
    snapshots: BTreeMap<String, SerializedSnapshot>,
}

impl DatabaseSetup {
    /// Setup that provisioned nothing
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            keep: false,
            snapshots: BTreeMap::new(),
        }
    }

    /// State of a primary alias, if it was set up
    pub fn state(&self, alias: &str) -> Option<SetupState> {
        self.entries
            .iter()
            .find(|e| e.alias == alias)
            .map(|e| e.state)
    }

    /// Aliases set up, in order
    pub fn aliases(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.alias.as_str()).collect()
    }

    /// Snapshot of a primary alias
    pub fn snapshot(&self, alias: &str) -> Option<&SerializedSnapshot> {
        self.snapshots.get(alias)
    }

    /// All snapshots by alias
    pub fn snapshots(&self) -> &BTreeMap<String, SerializedSnapshot> {
        &self.snapshots
    }

    /// True when databases survive teardown
    pub fn keep(&self) -> bool {
        self.keep
    }
}

/// Creates, reuses and destroys test databases
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    backend: Arc<dyn Backend>,
    apps: Arc<AppRegistry>,
    migrate: Arc<dyn SchemaStrategy>,
    syncdb: Arc<dyn SchemaStrategy>,
}

impl LifecycleManager {
    /// Manager with the default schema strategies
    pub fn new(backend: Arc<dyn Backend>, apps: Arc<AppRegistry>) -> Self {
        Self {
            backend,
            apps,
            migrate: Arc::new(MigrationExecutor),
            syncdb: Arc::new(DisableMigrations),
        }
    }

    /// Replace the strategy used when migrations are enabled
    pub fn with_migration_strategy(mut self, strategy: Arc<dyn SchemaStrategy>) -> Self {
        self.migrate = strategy;
        self
    }

    /// Replace the strategy used when migrations are disabled
    pub fn with_syncdb_strategy(mut self, strategy: Arc<dyn SchemaStrategy>) -> Self {
        self.syncdb = strategy;
        self
    }

    /// Append a worker suffix to every handle, at most once
    pub fn apply_suffixes(
        &self,
        handles: &mut [TestDatabaseHandle],
        connections: &ConnectionHandler,
        suffix: Option<&str>,
    ) {
        if let Some(suffix) = suffix {
            for handle in handles.iter_mut() {
                handle.add_suffix(suffix);
            }
            connections.sync_names(handles);
        }
    }

    fn probe(&self, name: &str) -> bool {
        match self.backend.database_exists(name) {
            Ok(exists) => exists,
            Err(e) => {
                warn!(target: "isodb::lifecycle", db = %name, error = %e, "probe failed, assuming absent");
                false
            }
        }
    }

    /// Primary aliases needed for `aliases`, in configuration order
    fn primaries_for(handles: &[TestDatabaseHandle], aliases: &[String]) -> IsoResult<Vec<String>> {
        let mut needed = BTreeSet::new();
        for alias in aliases {
            let handle = handles
                .iter()
                .find(|h| h.alias() == alias)
                .ok_or_else(|| {
                    IsoError::configuration(format!("The connection '{}' doesn't exist.", alias))
                })?;
            needed.insert(handle.mirror().unwrap_or(handle.alias()).to_string());
        }
        Ok(handles
            .iter()
            .filter(|h| !h.is_mirror() && needed.contains(h.alias()))
            .map(|h| h.alias().to_string())
            .collect())
    }

    /// Create or reuse the test databases of `opts.aliases`
    ///
    /// # Errors
    ///
    /// `Provisioning` when creation, schema application or snapshot capture
    /// fails; the session must not run any test after that.
    pub fn ensure_databases(
        &self,
        handles: &mut [TestDatabaseHandle],
        connections: &ConnectionHandler,
        opts: &SetupOptions,
    ) -> IsoResult<DatabaseSetup> {
        let primaries = Self::primaries_for(handles, &opts.aliases)?;
        let reuse = opts.keep_existing && !opts.force_create;
        let schema = if opts.use_migrations {
            &self.migrate
        } else {
            &self.syncdb
        };
        let mut setup = DatabaseSetup {
            entries: Vec::new(),
            keep: opts.keep_existing,
            snapshots: BTreeMap::new(),
        };

        for alias in &primaries {
            let Some(handle) = handles.iter_mut().find(|h| h.alias() == alias) else {
                continue;
            };
            let name = handle.test_name().to_string();
            let conn = connections.get(alias)?;

            if reuse && self.probe(&name) {
                handle.set_exists_from_prior_run(true);
                lifecycle_log!(opts.verbosity, alias = %alias, db = %name, "Using existing test database");
                setup.entries.push(SetupEntry {
                    alias: alias.clone(),
                    test_name: name,
                    state: SetupState::Reused,
                });
                continue;
            }

            conn.close();
            if self.probe(&name) {
                lifecycle_log!(opts.verbosity, alias = %alias, db = %name, "Destroying old test database");
                self.backend
                    .destroy_database(&name)
                    .map_err(|e| IsoError::provisioning(alias.as_str(), e.to_string()))?;
            }
            lifecycle_log!(opts.verbosity, alias = %alias, db = %name, strategy = schema.name(), "Creating test database");
            self.backend
                .create_database(&name)
                .map_err(|e| IsoError::provisioning(alias.as_str(), e.to_string()))?;
            handle.set_exists_from_prior_run(false);
            if let Err(e) = schema.apply(&conn, &self.apps) {
                conn.close();
                if let Err(cleanup) = self.backend.destroy_database(&name) {
                    warn!(target: "isodb::lifecycle", db = %name, error = %cleanup, "could not remove half-built test database");
                }
                return Err(IsoError::provisioning(alias.as_str(), e.to_string()));
            }
            setup.entries.push(SetupEntry {
                alias: alias.clone(),
                test_name: name,
                state: SetupState::Created,
            });
        }

        let tables = self.apps.all_tables();
        for alias in &primaries {
            let wants_snapshot = opts.serialized_aliases.contains(alias)
                || handles.iter().any(|h| {
                    h.mirror() == Some(alias.as_str()) && opts.serialized_aliases.contains(h.alias())
                });
            let serialize = handles
                .iter()
                .find(|h| h.alias() == alias)
                .map_or(false, TestDatabaseHandle::serialize);
            if !(wants_snapshot && serialize) {
                continue;
            }
            let conn = connections.get(alias)?;
            let snapshot = SerializedSnapshot::capture(&conn, &tables)
                .map_err(|e| IsoError::provisioning(alias.as_str(), e.to_string()))?;
            setup.snapshots.insert(alias.clone(), snapshot);
        }
        Ok(setup)
    }

    /// Destroy every database the setup created, unless it keeps them
    ///
    /// Connections are closed first. Failures are returned as warnings.
    pub fn teardown_databases(
        &self,
        setup: DatabaseSetup,
        connections: &ConnectionHandler,
        verbosity: u8,
    ) -> Vec<String> {
        connections.close_all();
        let mut warnings = Vec::new();
        if setup.keep {
            for entry in &setup.entries {
                lifecycle_log!(verbosity, alias = %entry.alias, db = %entry.test_name, "Preserving test database");
            }
            return warnings;
        }
        for entry in &setup.entries {
            lifecycle_log!(verbosity, alias = %entry.alias, db = %entry.test_name, "Destroying test database");
            if let Err(e) = self.backend.destroy_database(&entry.test_name) {
                let warning = IsoError::Teardown(format!("{}: {}", entry.alias, e)).to_string();
                warn!(target: "isodb::lifecycle", "{}", warning);
                warnings.push(warning);
            }
        }
        warnings
    }
}
