//! Gated database connections
//!
//! A [`Connection`] wraps one lazily opened [`RawConnection`] and consults
//! the [`AccessBlocker`] and the per-test alias gate before every operation
//! that reaches the database. On top of the raw connection it provides:
//! - atomic blocks: the outermost block is BEGIN/COMMIT, nested blocks are
//!   savepoints; an error or panic inside a block rolls it back
//! - on-commit callbacks: run immediately in autocommit, otherwise queued
//!   until the outermost block commits and discarded on rollback
//! - query capture for query-count assertions
//!
//! Transaction control statements are never captured.
//!
//! A mirror alias gets its own `Connection` value sharing the target's
//! underlying connection, so the alias gate still sees the mirror's name.

use isodb_backend::{Backend, Features, RawConnection};
use isodb_core::{AccessBlocker, IsoError, IsoResult, Row, Value, DEFAULT_DB_ALIAS};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::naming::TestDatabaseHandle;

/// Callback queued with [`Connection::on_commit`]
pub type OnCommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// One statement seen while capturing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedQuery {
    /// Statement text
    pub sql: String,
}

// ============================================================================
// Alias gate
// ============================================================================

/// Per-test restriction of the aliases a test may touch
#[derive(Debug, Default)]
pub struct AliasGate {
    allowed: RwLock<Option<BTreeSet<String>>>,
}

impl AliasGate {
    /// Unrestricted gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow only the given aliases until [`unrestrict`](Self::unrestrict)
    pub fn restrict<I, S>(&self, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.allowed.write() = Some(aliases.into_iter().map(Into::into).collect());
    }

    /// Lift the restriction
    pub fn unrestrict(&self) {
        *self.allowed.write() = None;
    }

    /// True while a restriction is active
    pub fn is_restricted(&self) -> bool {
        self.allowed.read().is_some()
    }

    /// Check one alias
    ///
    /// # Errors
    ///
    /// Returns `AliasNotAllowed` when a restriction is active and does not
    /// include the alias.
    pub fn check(&self, alias: &str) -> IsoResult<()> {
        match &*self.allowed.read() {
            Some(allowed) if !allowed.contains(alias) => Err(IsoError::AliasNotAllowed {
                alias: alias.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Token returned by [`Connection::enter_atomic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicToken {
    depth: usize,
}

impl AtomicToken {
    /// Number of blocks that were open when this one was entered
    pub fn depth(&self) -> usize {
        self.depth
    }
}

enum Frame {
    Transaction,
    Savepoint(String),
    Noop,
}

#[derive(Default)]
struct ConnState {
    raw: Option<Box<dyn RawConnection>>,
    frames: Vec<Frame>,
    savepoint_seq: u64,
    on_commit: Vec<(usize, OnCommitCallback)>,
    captures: Vec<Vec<CapturedQuery>>,
}

struct ConnectionInner {
    primary_alias: String,
    db_name: RwLock<String>,
    backend: Arc<dyn Backend>,
    blocker: Arc<AccessBlocker>,
    gate: Arc<AliasGate>,
    state: Mutex<ConnState>,
}

fn ensure_raw<'s>(
    state: &'s mut ConnState,
    inner: &ConnectionInner,
) -> IsoResult<&'s mut dyn RawConnection> {
    if state.raw.is_none() {
        let name = inner.db_name.read().clone();
        debug!(target: "isodb::connection", alias = %inner.primary_alias, db = %name, "opening connection");
        state.raw = Some(inner.backend.connect(&name)?);
    }
    match state.raw.as_mut() {
        Some(raw) => Ok(raw.as_mut()),
        None => Err(IsoError::invalid_operation("connection is not open")),
    }
}

/// Shared handle to one database connection
#[derive(Clone)]
pub struct Connection {
    alias: Arc<str>,
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("alias", &self.alias)
            .field("primary_alias", &self.inner.primary_alias)
            .field("db_name", &*self.inner.db_name.read())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        alias: &str,
        db_name: &str,
        backend: Arc<dyn Backend>,
        blocker: Arc<AccessBlocker>,
        gate: Arc<AliasGate>,
    ) -> Self {
        Self {
            alias: Arc::from(alias),
            inner: Arc::new(ConnectionInner {
                primary_alias: alias.to_string(),
                db_name: RwLock::new(db_name.to_string()),
                backend,
                blocker,
                gate,
                state: Mutex::new(ConnState::default()),
            }),
        }
    }

    /// A view of this connection under a mirror alias
    pub(crate) fn mirror(&self, alias: &str) -> Self {
        Self {
            alias: Arc::from(alias),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Alias this handle was requested under
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Alias owning the underlying connection
    pub fn primary_alias(&self) -> &str {
        &self.inner.primary_alias
    }

    /// True for mirror views
    pub fn is_mirror(&self) -> bool {
        *self.alias != *self.inner.primary_alias
    }

    /// Physical database name
    pub fn db_name(&self) -> String {
        self.inner.db_name.read().clone()
    }

    /// Point the connection at another database, closing the current one
    pub(crate) fn set_db_name(&self, name: &str) {
        let changed = *self.inner.db_name.read() != name;
        if changed {
            self.close();
            *self.inner.db_name.write() = name.to_string();
        }
    }

    /// Backend vendor
    pub fn vendor(&self) -> &'static str {
        self.inner.backend.vendor()
    }

    /// Backend capabilities
    pub fn features(&self) -> Features {
        self.inner.backend.features()
    }

    /// True if the raw connection is open
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().raw.is_some()
    }

    fn check_access(&self) -> IsoResult<()> {
        self.inner.blocker.check_access()?;
        self.inner.gate.check(&self.alias)
    }

    fn with_raw<T, F>(&self, record: Option<&str>, f: F) -> IsoResult<T>
    where
        F: FnOnce(&mut dyn RawConnection) -> IsoResult<T>,
    {
        self.check_access()?;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if let Some(sql) = record {
            for capture in state.captures.iter_mut() {
                capture.push(CapturedQuery {
                    sql: sql.to_string(),
                });
            }
        }
        let raw = ensure_raw(state, &self.inner)?;
        f(raw)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Execute a statement, returning the number of affected rows
    pub fn execute(&self, sql: &str, params: &[Value]) -> IsoResult<usize> {
        self.with_raw(Some(sql), |raw| raw.execute(sql, params))
    }

    /// Execute several statements without parameters
    pub fn execute_batch(&self, sql: &str) -> IsoResult<()> {
        self.with_raw(Some(sql), |raw| raw.execute_batch(sql))
    }

    /// Run a query and collect every row
    pub fn query(&self, sql: &str, params: &[Value]) -> IsoResult<Vec<Row>> {
        self.with_raw(Some(sql), |raw| raw.query(sql, params))
    }

    /// Run a query and return its first row
    pub fn query_row(&self, sql: &str, params: &[Value]) -> IsoResult<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Row id of the last insert on this connection
    pub fn last_insert_id(&self) -> IsoResult<i64> {
        self.with_raw(None, |raw| Ok(raw.last_insert_id()))
    }

    /// User tables, sorted by name
    pub fn table_names(&self) -> IsoResult<Vec<String>> {
        self.with_raw(None, |raw| raw.table_names())
    }

    /// Delete every row of the given tables
    pub fn flush(&self, tables: &[String]) -> IsoResult<()> {
        self.with_raw(None, |raw| raw.flush(tables))
    }

    /// Reset auto-increment counters of the given tables
    pub fn reset_sequences(&self, tables: &[String]) -> IsoResult<()> {
        self.with_raw(None, |raw| raw.reset_sequences(tables))
    }

    /// Upsert rows into a table
    pub fn load_rows(&self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> IsoResult<()> {
        self.with_raw(None, |raw| raw.load_rows(table, columns, rows))
    }

    /// Every row of a table with its column names
    pub fn dump_table(&self, table: &str) -> IsoResult<(Vec<String>, Vec<Vec<Value>>)> {
        self.with_raw(None, |raw| raw.dump_table(table))
    }

    // ========================================================================
    // Atomic blocks
    // ========================================================================

    /// Number of open atomic blocks
    pub fn atomic_depth(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    /// True inside an atomic block
    pub fn in_atomic_block(&self) -> bool {
        self.atomic_depth() > 0
    }

    /// Open an atomic block
    ///
    /// The outermost block begins a transaction; nested blocks create
    /// savepoints. Backends without transactions get a bookkeeping-only
    /// block.
    ///
    /// # Errors
    ///
    /// Access errors, backend errors, or `Unsupported` when nesting on a
    /// backend without savepoints.
    pub fn enter_atomic(&self) -> IsoResult<AtomicToken> {
        self.check_access()?;
        let features = self.features();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let depth = state.frames.len();

        let frame = if !features.supports_transactions {
            Frame::Noop
        } else if depth == 0 {
            ensure_raw(state, &self.inner)?.begin()?;
            Frame::Transaction
        } else if features.uses_savepoints {
            state.savepoint_seq += 1;
            let name = format!("isodb_sp_{}", state.savepoint_seq);
            ensure_raw(state, &self.inner)?.savepoint(&name)?;
            Frame::Savepoint(name)
        } else {
            return Err(IsoError::unsupported(format!(
                "nested atomic blocks on '{}' require savepoint support",
                self.alias
            )));
        };
        state.frames.push(frame);
        Ok(AtomicToken { depth })
    }

    /// Close the innermost atomic block, committing or rolling it back
    ///
    /// Committing the outermost block runs the queued on-commit callbacks.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when `token` is not the innermost block, or the
    /// backend error of the commit/rollback.
    pub fn exit_atomic(&self, token: AtomicToken, commit: bool) -> IsoResult<()> {
        let mut callbacks = Vec::new();
        let result = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.frames.len() != token.depth + 1 {
                return Err(IsoError::invalid_operation(format!(
                    "atomic block exited out of order on '{}' (depth {}, open {})",
                    self.alias,
                    token.depth,
                    state.frames.len()
                )));
            }
            let frame = state.frames.pop();
            let result = match (frame, state.raw.as_mut()) {
                (Some(Frame::Transaction), Some(raw)) if commit => raw.commit().map_err(|e| {
                    let _ = raw.rollback();
                    e
                }),
                (Some(Frame::Transaction), Some(raw)) => raw.rollback(),
                (Some(Frame::Savepoint(name)), Some(raw)) if commit => raw.release_savepoint(&name),
                (Some(Frame::Savepoint(name)), Some(raw)) => raw
                    .rollback_to_savepoint(&name)
                    .and_then(|_| raw.release_savepoint(&name)),
                (Some(Frame::Noop), _) => Ok(()),
                _ => Err(IsoError::invalid_operation("atomic block lost its connection")),
            };

            let depth_after = state.frames.len();
            if commit && result.is_ok() {
                if depth_after == 0 {
                    callbacks = state.on_commit.drain(..).map(|(_, cb)| cb).collect();
                } else {
                    for (depth, _) in state.on_commit.iter_mut() {
                        if *depth > depth_after {
                            *depth = depth_after;
                        }
                    }
                }
            } else {
                state.on_commit.retain(|(depth, _)| *depth <= depth_after);
            }
            result
        };
        result?;
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    /// Roll back every block opened at or after `token`
    ///
    /// Nested blocks the caller left open are unwound first. Rollback is not
    /// subject to access checks so isolation teardown always completes.
    ///
    /// # Errors
    ///
    /// Returns the first backend error; unwinding continues past it.
    pub fn rollback_atomic(&self, token: AtomicToken) -> IsoResult<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let mut first_error = None;
        while state.frames.len() > token.depth {
            let frame = state.frames.pop();
            let result = match (frame, state.raw.as_mut()) {
                (Some(Frame::Transaction), Some(raw)) => raw.rollback(),
                (Some(Frame::Savepoint(name)), Some(raw)) => raw
                    .rollback_to_savepoint(&name)
                    .and_then(|_| raw.release_savepoint(&name)),
                _ => Ok(()),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        state.on_commit.retain(|(depth, _)| *depth <= token.depth);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back every block above `depth`
    ///
    /// Token-less form of [`rollback_atomic`](Self::rollback_atomic), for
    /// callers that recorded the depth before handing the connection out.
    pub fn rollback_to_depth(&self, depth: usize) -> IsoResult<()> {
        self.rollback_atomic(AtomicToken { depth })
    }

    /// Run `f` inside an atomic block
    ///
    /// `Ok` commits (or releases the savepoint); `Err` or a panic rolls back.
    pub fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<IsoError>,
    {
        let token = self.enter_atomic()?;
        let mut guard = AtomicGuard {
            conn: self,
            token,
            armed: true,
        };
        let outcome = f(self);
        guard.armed = false;
        match outcome {
            Ok(value) => {
                if let Err(e) = self.exit_atomic(token, true) {
                    // blocks left open by `f` keep the frame from closing
                    if let Err(rollback_err) = self.rollback_atomic(token) {
                        warn!(target: "isodb::connection", alias = %self.alias, error = %rollback_err, "rollback failed");
                    }
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_atomic(token) {
                    warn!(target: "isodb::connection", alias = %self.alias, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // On-commit callbacks
    // ========================================================================

    /// Run `callback` once the current transaction commits
    ///
    /// Outside an atomic block the callback runs immediately.
    pub fn on_commit<F>(&self, callback: F) -> IsoResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_access()?;
        let mut state = self.inner.state.lock();
        if state.frames.is_empty() {
            drop(state);
            callback();
        } else {
            let depth = state.frames.len();
            state.on_commit.push((depth, Box::new(callback)));
        }
        Ok(())
    }

    /// Number of queued on-commit callbacks
    pub fn pending_on_commit(&self) -> usize {
        self.inner.state.lock().on_commit.len()
    }

    /// Remove queued callbacks from index `start` on
    pub(crate) fn take_on_commit_from(&self, start: usize) -> Vec<OnCommitCallback> {
        let mut state = self.inner.state.lock();
        if start >= state.on_commit.len() {
            return Vec::new();
        }
        state
            .on_commit
            .split_off(start)
            .into_iter()
            .map(|(_, cb)| cb)
            .collect()
    }

    // ========================================================================
    // Query capture
    // ========================================================================

    /// Run `f`, returning the statements it sent through this connection
    pub fn capture_queries<T, F>(&self, f: F) -> (T, Vec<CapturedQuery>)
    where
        F: FnOnce() -> T,
    {
        self.inner.state.lock().captures.push(Vec::new());
        let guard = CaptureGuard {
            conn: self,
            active: true,
        };
        let value = f();
        (value, guard.finish())
    }

    /// Roll back open blocks and drop the raw connection
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.frames.is_empty() {
            if let Some(raw) = state.raw.as_mut() {
                if let Err(e) = raw.rollback() {
                    warn!(target: "isodb::connection", alias = %self.alias, error = %e, "rollback on close failed");
                }
            }
            state.frames.clear();
            state.on_commit.clear();
        }
        if state.raw.take().is_some() {
            debug!(target: "isodb::connection", alias = %self.alias, "connection closed");
        }
    }
}

struct AtomicGuard<'a> {
    conn: &'a Connection,
    token: AtomicToken,
    armed: bool,
}

impl Drop for AtomicGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.conn.rollback_atomic(self.token) {
                warn!(target: "isodb::connection", alias = %self.conn.alias, error = %e, "rollback after panic failed");
            }
        }
    }
}

struct CaptureGuard<'a> {
    conn: &'a Connection,
    active: bool,
}

impl CaptureGuard<'_> {
    fn finish(mut self) -> Vec<CapturedQuery> {
        self.active = false;
        self.conn
            .inner
            .state
            .lock()
            .captures
            .pop()
            .unwrap_or_default()
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.conn.inner.state.lock().captures.pop();
        }
    }
}

// ============================================================================
// Connection handler
// ============================================================================

struct HandlerInner {
    order: Vec<String>,
    connections: BTreeMap<String, Connection>,
    mirrors: BTreeMap<String, String>,
    gate: Arc<AliasGate>,
    backend: Arc<dyn Backend>,
    blocker: Arc<AccessBlocker>,
}

/// All connections of one thread of execution, keyed by alias
#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Arc<HandlerInner>,
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("aliases", &self.inner.order)
            .field("mirrors", &self.inner.mirrors)
            .finish()
    }
}

impl ConnectionHandler {
    /// Lazily connecting handler for the resolved databases
    pub fn new(
        handles: &[TestDatabaseHandle],
        backend: Arc<dyn Backend>,
        blocker: Arc<AccessBlocker>,
    ) -> Self {
        let entries: Vec<(String, String, Option<String>)> = handles
            .iter()
            .map(|h| {
                (
                    h.alias().to_string(),
                    h.test_name().to_string(),
                    h.mirror().map(str::to_string),
                )
            })
            .collect();
        Self::from_entries(&entries, backend, blocker)
    }

    fn from_entries(
        entries: &[(String, String, Option<String>)],
        backend: Arc<dyn Backend>,
        blocker: Arc<AccessBlocker>,
    ) -> Self {
        let gate = Arc::new(AliasGate::new());
        let mut connections = BTreeMap::new();
        let mut mirrors = BTreeMap::new();
        for (alias, name, mirror) in entries {
            match mirror {
                Some(target) => {
                    mirrors.insert(alias.clone(), target.clone());
                }
                None => {
                    connections.insert(
                        alias.clone(),
                        Connection::new(
                            alias,
                            name,
                            Arc::clone(&backend),
                            Arc::clone(&blocker),
                            Arc::clone(&gate),
                        ),
                    );
                }
            }
        }
        for (alias, target) in &mirrors {
            if let Some(primary) = connections.get(target) {
                let view = primary.mirror(alias);
                connections.insert(alias.clone(), view);
            }
        }
        Self {
            inner: Arc::new(HandlerInner {
                order: entries.iter().map(|(alias, _, _)| alias.clone()).collect(),
                connections,
                mirrors,
                gate,
                backend,
                blocker,
            }),
        }
    }

    /// Fresh connections to the same databases, with their own alias gate
    ///
    /// Used by threads that must not share connections with the test, such
    /// as the live server.
    pub fn fork(&self) -> Self {
        let entries: Vec<(String, String, Option<String>)> = self
            .inner
            .order
            .iter()
            .filter_map(|alias| {
                let conn = self.inner.connections.get(alias)?;
                Some((
                    alias.clone(),
                    conn.db_name(),
                    self.inner.mirrors.get(alias).cloned(),
                ))
            })
            .collect();
        Self::from_entries(
            &entries,
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.blocker),
        )
    }

    /// Connection for an alias
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown aliases.
    pub fn get(&self, alias: &str) -> IsoResult<Connection> {
        self.inner.connections.get(alias).cloned().ok_or_else(|| {
            IsoError::configuration(format!("The connection '{}' doesn't exist.", alias))
        })
    }

    /// Connection for the `default` alias
    pub fn default_connection(&self) -> IsoResult<Connection> {
        self.get(DEFAULT_DB_ALIAS)
    }

    /// Configured aliases, in order
    pub fn aliases(&self) -> &[String] {
        &self.inner.order
    }

    /// Target of a mirror alias
    pub fn mirror_target(&self, alias: &str) -> Option<&str> {
        self.inner.mirrors.get(alias).map(String::as_str)
    }

    /// Connections owning a physical connection, in configuration order
    pub fn primaries(&self) -> Vec<Connection> {
        self.inner
            .order
            .iter()
            .filter(|alias| !self.inner.mirrors.contains_key(*alias))
            .filter_map(|alias| self.inner.connections.get(alias).cloned())
            .collect()
    }

    /// Backend behind every connection
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Blocker consulted by every connection
    pub fn blocker(&self) -> &Arc<AccessBlocker> {
        &self.inner.blocker
    }

    /// Alias gate shared by this handler's connections
    pub fn gate(&self) -> &Arc<AliasGate> {
        &self.inner.gate
    }

    /// Allow only the given aliases
    pub fn restrict<I, S>(&self, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.gate.restrict(aliases);
    }

    /// Lift the alias restriction
    pub fn unrestrict(&self) {
        self.inner.gate.unrestrict();
    }

    /// Re-point primaries at the handles' current test names
    pub(crate) fn sync_names(&self, handles: &[TestDatabaseHandle]) {
        for handle in handles.iter().filter(|h| !h.is_mirror()) {
            if let Some(conn) = self.inner.connections.get(handle.alias()) {
                conn.set_db_name(handle.test_name());
            }
        }
    }

    /// Close every connection
    pub fn close_all(&self) {
        for conn in self.primaries() {
            conn.close();
        }
    }
}
