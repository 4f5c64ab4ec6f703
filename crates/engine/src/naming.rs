//! Test database naming
//!
//! The physical test database name is a pure function of the logical name,
//! the optional explicit `test.name`, and the ordered suffix list. Suffixes
//! are idempotent: applying a suffix the name already ends with is a no-op,
//! so re-entering setup never produces `test_app_gw0_gw0`. In-memory
//! databases are never suffixed.

use crate::config::{DatabaseConfig, SessionConfig};
use isodb_backend::{Backend, IN_MEMORY_NAME};
use isodb_core::IsoResult;

/// Prefix of derived test database names
pub const TEST_DATABASE_PREFIX: &str = "test_";

/// Append `_<suffix>` unless the name already ends with it
pub fn apply_suffix(name: &str, suffix: &str) -> String {
    if suffix.is_empty() || name == IN_MEMORY_NAME || name.ends_with(&format!("_{}", suffix)) {
        name.to_string()
    } else {
        format!("{}_{}", name, suffix)
    }
}

/// Compute the physical test database name
pub fn test_database_name(logical: &str, explicit: Option<&str>, suffixes: &[String]) -> String {
    let base = match explicit {
        Some(name) => name.to_string(),
        None if logical == IN_MEMORY_NAME => IN_MEMORY_NAME.to_string(),
        None => format!("{}{}", TEST_DATABASE_PREFIX, logical),
    };
    suffixes
        .iter()
        .fold(base, |name, suffix| apply_suffix(&name, suffix))
}

/// Resolved test database of one alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDatabaseHandle {
    alias: String,
    logical_name: String,
    explicit_test_name: Option<String>,
    suffixes: Vec<String>,
    test_name: String,
    supports_transactions: bool,
    exists_from_prior_run: bool,
    mirror: Option<String>,
    serialize: bool,
}

impl TestDatabaseHandle {
    /// Resolve one configured database
    pub fn from_config(config: &DatabaseConfig, supports_transactions: bool) -> Self {
        let explicit = config.test.name.clone();
        Self {
            alias: config.alias.clone(),
            logical_name: config.name.clone(),
            test_name: test_database_name(&config.name, explicit.as_deref(), &[]),
            explicit_test_name: explicit,
            suffixes: Vec::new(),
            supports_transactions,
            exists_from_prior_run: false,
            mirror: config.test.mirror.clone(),
            serialize: config.test.serialize,
        }
    }

    /// Alias of this database
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Logical (production) name
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Physical test database name
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Suffixes applied so far, in order
    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    /// Whether the backend supports transactions
    pub fn supports_transactions(&self) -> bool {
        self.supports_transactions
    }

    /// True when the database was found and reused
    pub fn exists_from_prior_run(&self) -> bool {
        self.exists_from_prior_run
    }

    pub(crate) fn set_exists_from_prior_run(&mut self, exists: bool) {
        self.exists_from_prior_run = exists;
    }

    /// Target alias when this alias mirrors another
    pub fn mirror(&self) -> Option<&str> {
        self.mirror.as_deref()
    }

    /// True for mirror aliases
    pub fn is_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    /// Whether a serialized snapshot is captured for this alias
    pub fn serialize(&self) -> bool {
        self.serialize
    }

    /// True for in-memory test databases
    pub fn is_in_memory(&self) -> bool {
        self.test_name == IN_MEMORY_NAME
    }

    /// Add a suffix; adding one already present is a no-op
    pub fn add_suffix(&mut self, suffix: &str) {
        if suffix.is_empty() || self.suffixes.iter().any(|s| s == suffix) {
            return;
        }
        self.suffixes.push(suffix.to_string());
        self.test_name = test_database_name(
            &self.logical_name,
            self.explicit_test_name.as_deref(),
            &self.suffixes,
        );
    }
}

/// Resolve handles for every configured alias
///
/// Mirror handles take their target's physical name.
///
/// # Errors
///
/// Returns a configuration error if the database configuration is invalid.
pub fn resolve_handles(
    config: &SessionConfig,
    backend: &dyn Backend,
) -> IsoResult<Vec<TestDatabaseHandle>> {
    config.validate()?;
    let supports_transactions = backend.features().supports_transactions;
    Ok(config
        .databases
        .iter()
        .map(|db| TestDatabaseHandle::from_config(db, supports_transactions))
        .collect())
}

/// Physical name an alias resolves to, following mirrors
pub fn physical_name<'a>(handles: &'a [TestDatabaseHandle], alias: &str) -> Option<&'a str> {
    let handle = handles.iter().find(|h| h.alias() == alias)?;
    match handle.mirror() {
        Some(target) => handles
            .iter()
            .find(|h| h.alias() == target)
            .map(TestDatabaseHandle::test_name),
        None => Some(handle.test_name()),
    }
}
