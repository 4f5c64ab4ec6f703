//! Collected test items
//!
//! A [`TestItem`] is what the test runner hands over per test: its node id,
//! the fixtures it requests (closed over fixture dependencies), its marks,
//! and whether it is a native test-case class that manages its own
//! transactions.

use crate::naming::TestDatabaseHandle;
use isodb_core::mark::{validate_urls, DJANGO_DB, URLS};
use isodb_core::{DjangoDbMark, FixtureName, FixtureSet, IsoResult, IsolationRequest, Mark};
use std::collections::BTreeSet;

/// Kind of a native test-case class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCaseKind {
    /// Rolls back a transaction around each test
    TestCase,
    /// Flushes the database after each test
    TransactionTestCase,
    /// Never touches the database
    SimpleTestCase,
}

/// One collected test
#[derive(Debug, Clone, PartialEq)]
pub struct TestItem {
    node_id: String,
    fixtures: FixtureSet,
    marks: Vec<Mark>,
    native: Option<NativeCaseKind>,
}

impl TestItem {
    /// Item without fixtures or marks
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            fixtures: FixtureSet::default(),
            marks: Vec::new(),
            native: None,
        }
    }

    /// Request a fixture (and its dependencies)
    pub fn fixture(mut self, name: impl AsRef<str>) -> Self {
        self.fixtures.insert(name.as_ref());
        self
    }

    /// Request several fixtures
    pub fn fixtures<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.fixtures.insert(name.as_ref());
        }
        self
    }

    /// Attach a mark; the first mark of a name is the closest one
    pub fn mark(mut self, mark: impl Into<Mark>) -> Self {
        self.marks.push(mark.into());
        self
    }

    /// Mark the item as a native test case
    pub fn native(mut self, kind: NativeCaseKind) -> Self {
        self.native = Some(kind);
        self
    }

    /// Node id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Requested fixtures
    pub fn requested(&self) -> &FixtureSet {
        &self.fixtures
    }

    /// True if the fixture was requested, directly or implicitly
    pub fn requests(&self, fixture: FixtureName) -> bool {
        self.fixtures.contains(fixture)
    }

    /// Attached marks
    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    /// Native test-case kind, if any
    pub fn native_kind(&self) -> Option<NativeCaseKind> {
        self.native
    }

    /// True for native test-case items
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    fn closest(&self, name: &str) -> Option<&Mark> {
        self.marks.iter().find(|m| m.name() == name)
    }

    /// The validated `django_db` mark, if present
    ///
    /// # Errors
    ///
    /// Configuration error for positional or unknown arguments.
    pub fn django_db_mark(&self) -> IsoResult<Option<DjangoDbMark>> {
        self.closest(DJANGO_DB).map(DjangoDbMark::validate).transpose()
    }

    /// The URL configuration of a `urls` mark, if present
    pub fn urls(&self) -> IsoResult<Option<String>> {
        self.closest(URLS).map(validate_urls).transpose()
    }

    /// What this item asks of the isolation layer
    ///
    /// Native test cases are mapped by kind: they are never wrapped, but
    /// ordering and database planning still need to know about them.
    pub fn isolation_request(&self) -> IsoResult<Option<IsolationRequest>> {
        match self.native {
            Some(NativeCaseKind::TestCase) => Ok(Some(IsolationRequest::default())),
            Some(NativeCaseKind::TransactionTestCase) => Ok(Some(IsolationRequest {
                transactional: true,
                ..Default::default()
            })),
            Some(NativeCaseKind::SimpleTestCase) => Ok(None),
            None => {
                let mark = self.django_db_mark()?;
                Ok(IsolationRequest::for_fixtures(mark.as_ref(), &self.fixtures))
            }
        }
    }
}

fn order_key(item: &TestItem) -> u8 {
    match item.isolation_request() {
        Ok(Some(req)) if !req.transactional => 0,
        Ok(Some(_)) => 1,
        // invalid marks fail when the item runs
        Ok(None) | Err(_) => 2,
    }
}

/// Reorder items: savepoint-isolated first, then flush-isolated, then the rest
///
/// Flush-isolated tests wipe data that savepoint tests may rely on, so they
/// run after them. The sort is stable.
pub fn order_items(items: &mut [TestItem]) {
    items.sort_by_key(order_key);
}

/// Databases the collected items need
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabasePlan {
    /// Aliases to set up, in configuration order
    pub aliases: Vec<String>,
    /// Aliases whose initial data must be snapshotted
    pub serialized: BTreeSet<String>,
}

impl DatabasePlan {
    /// True when no item touches a database
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Collect the aliases needed by `items`
///
/// Mirror aliases pull in their target. Unknown aliases and invalid marks
/// are ignored here; they fail when the item runs.
pub fn databases_for_setup(items: &[TestItem], handles: &[TestDatabaseHandle]) -> DatabasePlan {
    let configured: Vec<String> = handles.iter().map(|h| h.alias().to_string()).collect();
    let mut needed = BTreeSet::new();
    let mut serialized = BTreeSet::new();
    for item in items {
        let Ok(Some(request)) = item.isolation_request() else {
            continue;
        };
        for alias in request.databases.resolve(&configured) {
            if request.serialized_rollback {
                serialized.insert(alias.clone());
            }
            needed.insert(alias);
        }
    }
    for handle in handles {
        if let Some(target) = handle.mirror() {
            if needed.contains(handle.alias()) {
                needed.insert(target.to_string());
            }
        }
    }
    DatabasePlan {
        aliases: configured
            .into_iter()
            .filter(|a| needed.contains(a))
            .collect(),
        serialized,
    }
}
