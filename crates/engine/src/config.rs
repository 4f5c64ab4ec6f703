//! Session configuration via `isodb.toml`
//!
//! Command-line parsing is not part of isodb; whatever front end drives the
//! session produces a [`SessionConfig`], usually by loading `isodb.toml` and
//! then applying environment overrides.
//!
//! Environment variables consulted:
//! - `PYTEST_XDIST_WORKER`: worker id, appended to test database names
//! - `TOX_PARALLEL_ENV`: tox environment, appended as is
//! - `DJANGO_LIVE_TEST_SERVER_ADDRESS`: live server address when none is configured

use isodb_core::{IsoError, IsoResult, DEFAULT_DB_ALIAS};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name looked up by front ends
pub const CONFIG_FILE_NAME: &str = "isodb.toml";

/// Environment variable carrying the parallel worker id
pub const XDIST_WORKER_ENV: &str = "PYTEST_XDIST_WORKER";

/// Environment variable carrying the tox parallel environment name
pub const TOX_PARALLEL_ENV: &str = "TOX_PARALLEL_ENV";

/// Environment variable carrying the live server address
pub const LIVE_SERVER_ADDRESS_ENV: &str = "DJANGO_LIVE_TEST_SERVER_ADDRESS";

/// Live server address used when nothing is configured
pub const DEFAULT_LIVE_SERVER_ADDRESS: &str = "localhost";

// ============================================================================
// Database entries
// ============================================================================

/// Test-specific options of one database (`[databases.test]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestDatabaseConfig {
    /// Explicit test database name (default: `test_<name>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Alias whose test database this alias reuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
    /// Capture a serialized snapshot after setup
    #[serde(default = "default_true")]
    pub serialize: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TestDatabaseConfig {
    fn default() -> Self {
        Self {
            name: None,
            mirror: None,
            serialize: true,
        }
    }
}

/// One configured database (`[[databases]]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Alias used by tests and marks
    pub alias: String,
    /// Logical (production) database name
    pub name: String,
    /// Test-specific options
    #[serde(default)]
    pub test: TestDatabaseConfig,
}

impl DatabaseConfig {
    /// Database entry with default test options
    pub fn new(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            test: TestDatabaseConfig::default(),
        }
    }

    /// Set an explicit test database name
    pub fn with_test_name(mut self, name: impl Into<String>) -> Self {
        self.test.name = Some(name.into());
        self
    }

    /// Make this alias mirror another alias
    pub fn with_mirror(mut self, target: impl Into<String>) -> Self {
        self.test.mirror = Some(target.into());
        self
    }

    /// Set whether a serialized snapshot is captured
    pub fn with_serialize(mut self, serialize: bool) -> Self {
        self.test.serialize = serialize;
        self
    }
}

// ============================================================================
// Session configuration
// ============================================================================

/// Session configuration loaded from `isodb.toml`
///
/// # Example
///
/// ```toml
/// reuse_db = false
/// create_db = false
/// nomigrations = false
/// verbosity = 0
///
/// [[databases]]
/// alias = "default"
/// name = "app"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Keep test databases between sessions and reuse them when present
    #[serde(default)]
    pub reuse_db: bool,
    /// Force re-creation of test databases even with `reuse_db`
    #[serde(default)]
    pub create_db: bool,
    /// Apply current model DDL directly instead of running migrations
    #[serde(default)]
    pub nomigrations: bool,
    /// Output verbosity; above 0 database lifecycle logs at info level and
    /// query-count failures list the queries
    #[serde(default)]
    pub verbosity: u8,
    /// Live server address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveserver: Option<String>,
    /// Value of `DEBUG` while tests run
    #[serde(default)]
    pub debug_mode: bool,
    /// How long to wait for the live server to become ready
    #[serde(default = "default_live_server_timeout_ms")]
    pub live_server_timeout_ms: u64,
    /// Configured databases, in order
    #[serde(default = "default_databases")]
    pub databases: Vec<DatabaseConfig>,
}

fn default_live_server_timeout_ms() -> u64 {
    10_000
}

fn default_databases() -> Vec<DatabaseConfig> {
    vec![DatabaseConfig::new(DEFAULT_DB_ALIAS, "app")]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reuse_db: false,
            create_db: false,
            nomigrations: false,
            verbosity: 0,
            liveserver: None,
            debug_mode: false,
            live_server_timeout_ms: default_live_server_timeout_ms(),
            databases: default_databases(),
        }
    }
}

impl SessionConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `reuse_db`
    pub fn with_reuse_db(mut self, reuse_db: bool) -> Self {
        self.reuse_db = reuse_db;
        self
    }

    /// Set `create_db`
    pub fn with_create_db(mut self, create_db: bool) -> Self {
        self.create_db = create_db;
        self
    }

    /// Set `nomigrations`
    pub fn with_nomigrations(mut self, nomigrations: bool) -> Self {
        self.nomigrations = nomigrations;
        self
    }

    /// Set output verbosity
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set the live server address
    pub fn with_liveserver(mut self, address: impl Into<String>) -> Self {
        self.liveserver = Some(address.into());
        self
    }

    /// Set `DEBUG` for the test run
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Set the live server readiness timeout
    pub fn with_live_server_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.live_server_timeout_ms = timeout_ms;
        self
    }

    /// Replace the configured databases
    pub fn with_databases(mut self, databases: Vec<DatabaseConfig>) -> Self {
        self.databases = databases;
        self
    }

    /// Add a database
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.databases.push(database);
        self
    }

    /// True when test databases survive the session
    pub fn keepdb(&self) -> bool {
        self.reuse_db && !self.create_db
    }

    /// Configured aliases, in order
    pub fn aliases(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.alias.clone()).collect()
    }

    /// Look up a database entry
    pub fn database(&self, alias: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.alias == alias)
    }

    /// Fill unset values from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Fill unset values from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.liveserver.is_none() {
            self.liveserver = lookup(LIVE_SERVER_ADDRESS_ENV).filter(|v| !v.is_empty());
        }
    }

    /// Live server address, falling back to `localhost`
    pub fn live_server_address(&self) -> &str {
        self.liveserver
            .as_deref()
            .unwrap_or(DEFAULT_LIVE_SERVER_ADDRESS)
    }

    /// Check aliases are unique and mirrors point at configured aliases
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> IsoResult<()> {
        if self.databases.is_empty() {
            return Err(IsoError::configuration("no databases configured"));
        }
        for (i, db) in self.databases.iter().enumerate() {
            if self.databases[..i].iter().any(|d| d.alias == db.alias) {
                return Err(IsoError::configuration(format!(
                    "database alias '{}' is configured twice",
                    db.alias
                )));
            }
            if let Some(target) = &db.test.mirror {
                match self.database(target) {
                    None => {
                        return Err(IsoError::configuration(format!(
                            "database '{}' mirrors unknown alias '{}'",
                            db.alias, target
                        )))
                    }
                    Some(t) if t.test.mirror.is_some() => {
                        return Err(IsoError::configuration(format!(
                            "database '{}' mirrors '{}', which is itself a mirror",
                            db.alias, target
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# isodb session configuration
#
# Keep test databases after the run and reuse them next time.
reuse_db = false

# Re-create test databases even when reuse_db is set.
create_db = false

# Build the schema straight from the models instead of running migrations.
nomigrations = false

# 0 = quiet, 1+ = log database setup at info level and list queries
# in failed query-count assertions.
verbosity = 0

# Value of DEBUG while tests run.
debug_mode = false

# Live server address: "host", "host:port" or "host:8000-8010,8080".
# liveserver = "localhost"
live_server_timeout_ms = 10000

[[databases]]
alias = "default"
name = "app"

# [databases.test]
# name = "test_app"      # optional, default test_<name>
# mirror = "default"     # optional, reuse another alias' test database
# serialize = true
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> IsoResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IsoError::configuration(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content).map_err(|e| {
            IsoError::configuration(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse and validate config from TOML text
    pub fn from_toml(content: &str) -> IsoResult<Self> {
        let config: SessionConfig =
            toml::from_str(content).map_err(|e| IsoError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> IsoResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }
}

// ============================================================================
// Worker environment
// ============================================================================

/// Parallel-run identity of this process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Worker id such as `gw0`
    pub xdist_worker: Option<String>,
    /// tox parallel environment name
    pub tox_parallel: Option<String>,
}

impl WorkerEnv {
    /// Standalone (non-parallel) process
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            xdist_worker: lookup(XDIST_WORKER_ENV).filter(|v| !v.is_empty()),
            tox_parallel: lookup(TOX_PARALLEL_ENV).filter(|v| !v.is_empty()),
        }
    }

    /// Set the worker id
    pub fn with_xdist_worker(mut self, worker: impl Into<String>) -> Self {
        self.xdist_worker = Some(worker.into());
        self
    }

    /// Set the tox environment
    pub fn with_tox_parallel(mut self, env: impl Into<String>) -> Self {
        self.tox_parallel = Some(env.into());
        self
    }

    /// Combined suffix for test database names, if any
    ///
    /// The tox environment comes first, then the worker id, joined with `_`.
    pub fn suffix(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(env) = &self.tox_parallel {
            parts.push(env.clone());
        }
        if let Some(worker) = &self.xdist_worker {
            parts.push(worker.clone());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("_"))
        }
    }
}
