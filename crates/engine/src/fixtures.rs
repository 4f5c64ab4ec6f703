//! Helper fixtures: query counting, on-commit capture, admin user

use crate::connection::{Connection, ConnectionHandler, OnCommitCallback};
use crate::http::{User, UserModel};
use isodb_core::{IsoError, IsoResult};
use std::fmt;

// ============================================================================
// Query counting
// ============================================================================

/// Assertion on the number of queries a block performs
///
/// ```no_run
/// # use isodb_engine::fixtures::AssertNumQueries;
/// # fn demo(handler: isodb_engine::connection::ConnectionHandler) -> isodb_core::IsoResult<()> {
/// AssertNumQueries::exact(&handler, 1).info("one lookup").run(|| {
///     // database work
/// })?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct AssertNumQueries {
    connections: ConnectionHandler,
    num: usize,
    exact: bool,
    alias: Option<String>,
    info: Option<String>,
    verbosity: u8,
}

impl AssertNumQueries {
    /// Exactly `num` queries
    pub fn exact(connections: &ConnectionHandler, num: usize) -> Self {
        Self::new(connections, num, true)
    }

    /// At most `num` queries
    pub fn max(connections: &ConnectionHandler, num: usize) -> Self {
        Self::new(connections, num, false)
    }

    fn new(connections: &ConnectionHandler, num: usize, exact: bool) -> Self {
        Self {
            connections: connections.clone(),
            num,
            exact,
            alias: None,
            info: None,
            verbosity: 0,
        }
    }

    /// Count on another alias
    pub fn connection(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Extra text for the failure message
    pub fn info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// List the queries in the failure message when above zero
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Run `f` and check the count
    ///
    /// # Errors
    ///
    /// `QueryCount` with the formatted message when the count is off.
    pub fn run<T, F>(&self, f: F) -> IsoResult<T>
    where
        F: FnOnce() -> T,
    {
        let conn = self.target()?;
        let (value, queries) = conn.capture_queries(f);
        let performed = queries.len();
        let failed = if self.exact {
            performed != self.num
        } else {
            performed > self.num
        };
        if !failed {
            return Ok(value);
        }

        let mut msg = format!(
            "Expected to perform {} queries {}but {} done",
            self.num,
            if self.exact { "" } else { "or less " },
            if performed == 1 {
                "1 was".to_string()
            } else {
                format!("{} were", performed)
            }
        );
        if let Some(info) = &self.info {
            msg.push('\n');
            msg.push_str(info);
        }
        if self.verbosity > 0 {
            let sqls: Vec<&str> = queries.iter().map(|q| q.sql.as_str()).collect();
            msg.push_str("\n\nQueries:\n========\n\n");
            msg.push_str(&sqls.join("\n\n"));
        } else {
            msg.push_str(" (add -v option to show queries)");
        }
        Err(IsoError::QueryCount(msg))
    }

    fn target(&self) -> IsoResult<Connection> {
        match &self.alias {
            Some(alias) => self.connections.get(alias),
            None => self.connections.default_connection(),
        }
    }
}

// ============================================================================
// On-commit capture
// ============================================================================

/// Callbacks queued inside a [`CaptureOnCommitCallbacks`] block
pub struct CapturedCallbacks {
    pending: Vec<OnCommitCallback>,
    executed: usize,
}

impl fmt::Debug for CapturedCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedCallbacks")
            .field("pending", &self.pending.len())
            .field("executed", &self.executed)
            .finish()
    }
}

impl CapturedCallbacks {
    /// Captured callbacks, executed or not
    pub fn len(&self) -> usize {
        self.pending.len() + self.executed
    }

    /// True when nothing was captured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callbacks already run because `execute` was set
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Run the callbacks that were not executed
    pub fn run_all(self) -> usize {
        let count = self.pending.len();
        for callback in self.pending {
            callback();
        }
        count
    }
}

/// Captures on-commit callbacks registered inside a block
#[derive(Debug, Clone)]
pub struct CaptureOnCommitCallbacks {
    connections: ConnectionHandler,
    alias: Option<String>,
    execute: bool,
}

impl CaptureOnCommitCallbacks {
    /// Capture on the default alias, without executing
    pub fn new(connections: &ConnectionHandler) -> Self {
        Self {
            connections: connections.clone(),
            alias: None,
            execute: false,
        }
    }

    /// Capture on another alias
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Run the captured callbacks when the block ends
    pub fn execute(mut self, execute: bool) -> Self {
        self.execute = execute;
        self
    }

    /// Run `f`, removing the callbacks it queued from the connection
    ///
    /// With `execute`, callbacks run in order, including ones queued by
    /// earlier callbacks.
    pub fn run<T, F>(&self, f: F) -> IsoResult<(T, CapturedCallbacks)>
    where
        F: FnOnce() -> T,
    {
        let conn = match &self.alias {
            Some(alias) => self.connections.get(alias)?,
            None => self.connections.default_connection()?,
        };
        let start = conn.pending_on_commit();
        let value = f();
        let mut captured = CapturedCallbacks {
            pending: conn.take_on_commit_from(start),
            executed: 0,
        };
        if self.execute {
            while !captured.pending.is_empty() {
                let batch = std::mem::take(&mut captured.pending);
                captured.executed += batch.len();
                for callback in batch {
                    callback();
                }
                captured.pending = conn.take_on_commit_from(start);
            }
        }
        Ok((value, captured))
    }
}

// ============================================================================
// Admin user
// ============================================================================

/// Username of the admin user for a user model
pub fn admin_username(model: &dyn UserModel) -> &'static str {
    if model.username_field() == "email" {
        "admin@example.com"
    } else {
        "admin"
    }
}

/// Fetch the admin user, creating it as a superuser when missing
pub fn admin_user(model: &dyn UserModel, connections: &ConnectionHandler) -> IsoResult<User> {
    let username = admin_username(model);
    match model.get_by_natural_key(connections, username)? {
        Some(user) => Ok(user),
        None => model.create_superuser(connections, username, "admin@example.com", "password"),
    }
}
