//! Per-test isolation
//!
//! [`IsolationPlan`] decides how a test is isolated; [`IsolationGuard`]
//! establishes that isolation and reverts it exactly once.
//!
//! Two modes:
//! - Savepoint: an atomic block is opened on every selected database and
//!   rolled back after the test, whatever the body left open
//! - Flush: sequences are reset and the serialized snapshot replayed on
//!   request; afterwards blocks the body left open are rolled back and
//!   every table of the selected apps is emptied
//!
//! Backends without transactions always use flush mode.

use crate::connection::{AtomicToken, Connection, ConnectionHandler};
use crate::item::TestItem;
use crate::schema::AppRegistry;
use crate::snapshot::SerializedSnapshot;
use isodb_backend::Features;
use isodb_core::{IsoError, IsoResult, IsolationRequest};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// How a test's database changes are reverted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Roll back an atomic block
    Savepoint,
    /// Empty the tables afterwards
    Flush,
}

/// Resolved isolation of one test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPlan {
    /// The normalized request
    pub request: IsolationRequest,
    /// Chosen mode
    pub mode: IsolationMode,
    /// Selected aliases, in configuration order
    pub aliases: Vec<String>,
    /// True when savepoint isolation was requested but flush is used
    pub degraded: bool,
}

impl IsolationPlan {
    /// Plan for a test item
    ///
    /// Returns `None` for items that use no database and for native test
    /// cases, which manage their own isolation.
    ///
    /// # Errors
    ///
    /// Configuration errors from the marks, `Unsupported` when the backend
    /// cannot provide the requested mode.
    pub fn for_item(
        item: &TestItem,
        configured: &[String],
        features: Features,
    ) -> IsoResult<Option<Self>> {
        if item.is_native() {
            return Ok(None);
        }
        item.isolation_request()?
            .map(|request| Self::for_request(request, configured, features))
            .transpose()
    }

    /// Plan for a request
    pub fn for_request(
        request: IsolationRequest,
        configured: &[String],
        features: Features,
    ) -> IsoResult<Self> {
        let request = request.normalized();
        let unknown = request.databases.unknown(configured);
        if let Some(alias) = unknown.first() {
            return Err(IsoError::configuration(format!(
                "The connection '{}' doesn't exist.",
                alias
            )));
        }
        let aliases = request.databases.resolve(configured);

        let (mode, degraded) = if request.transactional {
            (IsolationMode::Flush, false)
        } else if !features.supports_transactions {
            (IsolationMode::Flush, true)
        } else if !features.uses_savepoints {
            return Err(IsoError::unsupported(
                "the 'db' fixture requires a backend with savepoint support; \
                 use 'transactional_db' instead",
            ));
        } else {
            (IsolationMode::Savepoint, false)
        };

        Ok(Self {
            request,
            mode,
            aliases,
            degraded,
        })
    }
}

/// Established isolation of a running test
///
/// Dropping the guard tears the isolation down if [`teardown`] was not
/// called.
///
/// [`teardown`]: IsolationGuard::teardown
#[derive(Debug)]
pub struct IsolationGuard {
    plan: IsolationPlan,
    connections: Vec<Connection>,
    /// Atomic depth of each connection before setup
    depths: Vec<usize>,
    tokens: Vec<(Connection, AtomicToken)>,
    tables: Vec<String>,
    done: bool,
}

impl IsolationGuard {
    /// Establish the plan's isolation
    ///
    /// Mirrors are wrapped through their target. On error everything
    /// established so far is reverted.
    pub fn setup(
        plan: IsolationPlan,
        handler: &ConnectionHandler,
        apps: &AppRegistry,
        snapshots: &BTreeMap<String, SerializedSnapshot>,
    ) -> IsoResult<Self> {
        let mut connections: Vec<Connection> = Vec::new();
        for alias in &plan.aliases {
            let target = handler.mirror_target(alias).unwrap_or(alias);
            if connections.iter().any(|c| c.alias() == target) {
                continue;
            }
            connections.push(handler.get(target)?);
        }
        let tables = apps.tables_for(plan.request.available_apps.as_deref());
        let depths = connections.iter().map(Connection::atomic_depth).collect();

        let mut guard = Self {
            plan,
            connections,
            depths,
            tokens: Vec::new(),
            tables,
            done: false,
        };
        if let Err(e) = guard.establish(snapshots) {
            guard.done = true;
            guard.release_tokens();
            return Err(e);
        }
        debug!(
            target: "isodb::isolation",
            mode = ?guard.plan.mode,
            aliases = ?guard.plan.aliases,
            degraded = guard.plan.degraded,
            "isolation established"
        );
        Ok(guard)
    }

    fn establish(&mut self, snapshots: &BTreeMap<String, SerializedSnapshot>) -> IsoResult<()> {
        match self.plan.mode {
            IsolationMode::Savepoint => {
                for conn in &self.connections {
                    let token = conn.enter_atomic()?;
                    self.tokens.push((conn.clone(), token));
                }
            }
            IsolationMode::Flush => {
                for conn in &self.connections {
                    if self.plan.request.reset_sequences {
                        conn.reset_sequences(&self.tables)?;
                    }
                    if self.plan.request.serialized_rollback {
                        if let Some(snapshot) = snapshots.get(conn.alias()) {
                            snapshot.replay(conn)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn release_tokens(&mut self) -> Option<IsoError> {
        let mut first_error = None;
        while let Some((conn, token)) = self.tokens.pop() {
            if let Err(e) = conn.rollback_atomic(token) {
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    /// The plan this guard established
    pub fn plan(&self) -> &IsolationPlan {
        &self.plan
    }

    /// Revert the test's changes
    ///
    /// # Errors
    ///
    /// The first rollback or flush failure; every database is still visited.
    pub fn teardown(mut self) -> IsoResult<()> {
        self.teardown_inner()
    }

    fn teardown_inner(&mut self) -> IsoResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let mut first_error = self.release_tokens();
        if self.plan.mode == IsolationMode::Flush {
            for (conn, depth) in self.connections.iter().zip(&self.depths) {
                if let Err(e) = conn.rollback_to_depth(*depth) {
                    first_error.get_or_insert(e);
                }
                if let Err(e) = conn.flush(&self.tables) {
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!(target: "isodb::isolation", mode = ?self.plan.mode, "isolation torn down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for IsolationGuard {
    fn drop(&mut self) {
        if let Err(e) = self.teardown_inner() {
            error!(target: "isodb::isolation", error = %e, "isolation teardown failed");
        }
    }
}
