//! Fixture names and the requested-fixture set of a test item
//!
//! Fixture names are part of the public contract and must match exactly what
//! test authors write. Requesting a fixture implicitly requests its
//! dependencies; [`FixtureSet`] stores the closure.

use std::collections::BTreeSet;
use std::fmt;

/// Every fixture isodb provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FixtureName {
    /// Savepoint-isolated database access
    Db,
    /// Flush-isolated database access
    TransactionalDb,
    /// Flush isolation plus sequence reset
    DjangoDbResetSequences,
    /// Flush isolation plus serialized data replay
    DjangoDbSerializedRollback,
    /// Session-scoped test database setup
    DjangoDbSetup,
    /// The access blocker itself
    DjangoDbBlocker,
    /// In-process test client
    Client,
    /// Async in-process test client
    AsyncClient,
    /// Test client logged in as the admin user
    AdminClient,
    /// Superuser created on demand
    AdminUser,
    /// The configured user model
    DjangoUserModel,
    /// Name of the user model's username field
    DjangoUsernameField,
    /// Request factory
    Rf,
    /// Async request factory
    AsyncRf,
    /// Per-test settings overrides
    Settings,
    /// Session-scoped live HTTP server
    LiveServer,
    /// Exact query-count assertion
    DjangoAssertNumQueries,
    /// Upper-bound query-count assertion
    DjangoAssertMaxNumQueries,
    /// On-commit callback capture
    DjangoCaptureOnCommitCallbacks,
}

impl FixtureName {
    /// All fixtures, in declaration order
    pub const ALL: [FixtureName; 19] = [
        FixtureName::Db,
        FixtureName::TransactionalDb,
        FixtureName::DjangoDbResetSequences,
        FixtureName::DjangoDbSerializedRollback,
        FixtureName::DjangoDbSetup,
        FixtureName::DjangoDbBlocker,
        FixtureName::Client,
        FixtureName::AsyncClient,
        FixtureName::AdminClient,
        FixtureName::AdminUser,
        FixtureName::DjangoUserModel,
        FixtureName::DjangoUsernameField,
        FixtureName::Rf,
        FixtureName::AsyncRf,
        FixtureName::Settings,
        FixtureName::LiveServer,
        FixtureName::DjangoAssertNumQueries,
        FixtureName::DjangoAssertMaxNumQueries,
        FixtureName::DjangoCaptureOnCommitCallbacks,
    ];

    /// The name test authors request
    pub fn as_str(self) -> &'static str {
        match self {
            FixtureName::Db => "db",
            FixtureName::TransactionalDb => "transactional_db",
            FixtureName::DjangoDbResetSequences => "django_db_reset_sequences",
            FixtureName::DjangoDbSerializedRollback => "django_db_serialized_rollback",
            FixtureName::DjangoDbSetup => "django_db_setup",
            FixtureName::DjangoDbBlocker => "django_db_blocker",
            FixtureName::Client => "client",
            FixtureName::AsyncClient => "async_client",
            FixtureName::AdminClient => "admin_client",
            FixtureName::AdminUser => "admin_user",
            FixtureName::DjangoUserModel => "django_user_model",
            FixtureName::DjangoUsernameField => "django_username_field",
            FixtureName::Rf => "rf",
            FixtureName::AsyncRf => "async_rf",
            FixtureName::Settings => "settings",
            FixtureName::LiveServer => "live_server",
            FixtureName::DjangoAssertNumQueries => "django_assert_num_queries",
            FixtureName::DjangoAssertMaxNumQueries => "django_assert_max_num_queries",
            FixtureName::DjangoCaptureOnCommitCallbacks => "django_capture_on_commit_callbacks",
        }
    }

    /// Parse a requested name; unknown names belong to other plugins
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == name)
    }

    /// Fixtures implicitly requested by this one
    pub fn dependencies(self) -> &'static [FixtureName] {
        match self {
            FixtureName::Db | FixtureName::TransactionalDb => {
                &[FixtureName::DjangoDbSetup, FixtureName::DjangoDbBlocker]
            }
            FixtureName::DjangoDbResetSequences | FixtureName::DjangoDbSerializedRollback => {
                &[FixtureName::TransactionalDb]
            }
            FixtureName::DjangoDbSetup => &[FixtureName::DjangoDbBlocker],
            FixtureName::LiveServer => &[FixtureName::TransactionalDb],
            FixtureName::AdminUser => &[
                FixtureName::Db,
                FixtureName::DjangoUserModel,
                FixtureName::DjangoUsernameField,
            ],
            FixtureName::AdminClient => &[FixtureName::Client, FixtureName::AdminUser],
            FixtureName::DjangoUsernameField => &[FixtureName::DjangoUserModel],
            _ => &[],
        }
    }
}

impl fmt::Display for FixtureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested fixture names of one test item, closed over dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureSet {
    names: BTreeSet<String>,
}

impl FixtureSet {
    /// Build the closure of the requested names
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = FixtureSet::default();
        for name in names {
            set.insert(name.as_ref());
        }
        set
    }

    /// Request a name (and its dependencies)
    pub fn insert(&mut self, name: &str) {
        if !self.names.insert(name.to_string()) {
            return;
        }
        if let Some(fixture) = FixtureName::parse(name) {
            for dep in fixture.dependencies() {
                self.insert(dep.as_str());
            }
        }
    }

    /// True if the fixture was requested directly or implicitly
    pub fn contains(&self, fixture: FixtureName) -> bool {
        self.names.contains(fixture.as_str())
    }

    /// True if a name (possibly not an isodb fixture) was requested
    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// All requested names, sorted
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}
