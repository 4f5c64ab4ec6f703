//! Per-test isolation request
//!
//! An [`IsolationRequest`] is derived from a test item's `django_db` mark and
//! its requested fixtures. It is computed fresh for every item and never
//! persisted.
//!
//! Normalization: `reset_sequences` or `serialized_rollback` force
//! `transactional`.

use crate::fixture::{FixtureName, FixtureSet};
use crate::mark::DjangoDbMark;
use std::collections::BTreeSet;

/// Alias of the default database
pub const DEFAULT_DB_ALIAS: &str = "default";

/// Literal selecting every configured database
pub const ALL_DATABASES: &str = "__all__";

/// Databases a test may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseSelection {
    /// Every configured alias
    All,
    /// An explicit set of aliases
    Aliases(BTreeSet<String>),
}

impl DatabaseSelection {
    /// `{"default"}`
    pub fn default_only() -> Self {
        DatabaseSelection::Aliases(std::iter::once(DEFAULT_DB_ALIAS.to_string()).collect())
    }

    /// Selection from a list of aliases
    pub fn aliases<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DatabaseSelection::Aliases(aliases.into_iter().map(Into::into).collect())
    }

    /// Resolve against the configured aliases, preserving configuration order
    ///
    /// Aliases that are not configured are dropped; the caller decides
    /// whether that is an error.
    pub fn resolve(&self, configured: &[String]) -> Vec<String> {
        match self {
            DatabaseSelection::All => configured.to_vec(),
            DatabaseSelection::Aliases(set) => configured
                .iter()
                .filter(|alias| set.contains(alias.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Aliases named by the selection that are not configured
    pub fn unknown(&self, configured: &[String]) -> Vec<String> {
        match self {
            DatabaseSelection::All => Vec::new(),
            DatabaseSelection::Aliases(set) => set
                .iter()
                .filter(|alias| !configured.iter().any(|c| c == *alias))
                .cloned()
                .collect(),
        }
    }

    /// True if the alias is selected
    pub fn contains(&self, alias: &str) -> bool {
        match self {
            DatabaseSelection::All => true,
            DatabaseSelection::Aliases(set) => set.contains(alias),
        }
    }
}

impl Default for DatabaseSelection {
    fn default() -> Self {
        Self::default_only()
    }
}

/// What a single test asks of the isolation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationRequest {
    /// Flush-based reset instead of a rolled-back transaction
    pub transactional: bool,
    /// Reset auto-increment counters before the test
    pub reset_sequences: bool,
    /// Replay serialized initial data before the test
    pub serialized_rollback: bool,
    /// Databases the test may touch
    pub databases: DatabaseSelection,
    /// App labels whose tables are flushed (all apps when `None`)
    pub available_apps: Option<Vec<String>>,
}

impl Default for IsolationRequest {
    fn default() -> Self {
        Self {
            transactional: false,
            reset_sequences: false,
            serialized_rollback: false,
            databases: DatabaseSelection::default_only(),
            available_apps: None,
        }
    }
}

impl IsolationRequest {
    /// Derive the request of a test item
    ///
    /// Returns `None` when the item uses no database at all: it carries no
    /// `django_db` mark and requests none of the database fixtures.
    pub fn for_fixtures(mark: Option<&DjangoDbMark>, fixtures: &FixtureSet) -> Option<Self> {
        let uses_db = mark.is_some()
            || fixtures.contains(FixtureName::Db)
            || fixtures.contains(FixtureName::TransactionalDb);
        if !uses_db {
            return None;
        }

        let mark = mark.cloned().unwrap_or_default();
        let request = IsolationRequest {
            transactional: mark.transaction
                || fixtures.contains(FixtureName::TransactionalDb)
                || fixtures.contains(FixtureName::LiveServer),
            reset_sequences: mark.reset_sequences
                || fixtures.contains(FixtureName::DjangoDbResetSequences),
            serialized_rollback: mark.serialized_rollback
                || fixtures.contains(FixtureName::DjangoDbSerializedRollback),
            databases: mark.databases.unwrap_or_default(),
            available_apps: mark.available_apps,
        };
        Some(request.normalized())
    }

    /// Apply the forcing rules
    pub fn normalized(mut self) -> Self {
        if self.reset_sequences || self.serialized_rollback {
            self.transactional = true;
        }
        self
    }
}
