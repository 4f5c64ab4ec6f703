//! Backend trait definitions
//!
//! These traits are the seam between the isolation engine and a concrete
//! database engine:
//! - Backend: create, destroy, probe and connect to named databases
//! - RawConnection: SQL execution, transaction control and bulk helpers
//!
//! Transaction control statements are separate methods so the engine can
//! keep them out of captured query lists.

use isodb_core::{IsoResult, Row, Value};
use std::fmt::Debug;

/// Capabilities reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// BEGIN/COMMIT/ROLLBACK are available
    pub supports_transactions: bool,
    /// SAVEPOINT/RELEASE/ROLLBACK TO are available
    pub uses_savepoints: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            supports_transactions: true,
            uses_savepoints: true,
        }
    }
}

/// Name used for private, in-process databases
pub const IN_MEMORY_NAME: &str = ":memory:";

/// Database engine abstraction
///
/// Implementations must be thread-safe: the live server opens its own
/// connections from a background thread.
pub trait Backend: Send + Sync + Debug {
    /// Short vendor name used in logs and errors
    fn vendor(&self) -> &'static str;

    /// Capabilities of connections produced by this backend
    fn features(&self) -> Features;

    /// True if the name denotes an in-memory database
    fn is_in_memory(&self, name: &str) -> bool {
        name == IN_MEMORY_NAME
    }

    /// Probe for a database without creating it
    ///
    /// # Errors
    ///
    /// Returns an error only for probe faults; absence is `Ok(false)`.
    fn database_exists(&self, name: &str) -> IsoResult<bool>;

    /// Create an empty database
    ///
    /// # Errors
    ///
    /// Returns an error if the database already exists or cannot be created.
    fn create_database(&self, name: &str) -> IsoResult<()>;

    /// Destroy a database; destroying an absent database is not an error
    fn destroy_database(&self, name: &str) -> IsoResult<()>;

    /// Open a new connection to an existing database
    fn connect(&self, name: &str) -> IsoResult<Box<dyn RawConnection>>;
}

/// One open connection
pub trait RawConnection: Send {
    /// Execute a statement, returning the number of affected rows
    fn execute(&mut self, sql: &str, params: &[Value]) -> IsoResult<usize>;

    /// Execute several `;`-separated statements without parameters
    fn execute_batch(&mut self, sql: &str) -> IsoResult<()>;

    /// Run a query and collect every row
    fn query(&mut self, sql: &str, params: &[Value]) -> IsoResult<Vec<Row>>;

    /// Row id of the last successful insert
    fn last_insert_id(&self) -> i64;

    /// User tables, sorted by name
    fn table_names(&mut self) -> IsoResult<Vec<String>>;

    /// Open a transaction
    fn begin(&mut self) -> IsoResult<()> {
        self.execute_batch("BEGIN")
    }

    /// Commit the open transaction
    fn commit(&mut self) -> IsoResult<()> {
        self.execute_batch("COMMIT")
    }

    /// Roll back the open transaction
    fn rollback(&mut self) -> IsoResult<()> {
        self.execute_batch("ROLLBACK")
    }

    /// Create a savepoint
    fn savepoint(&mut self, name: &str) -> IsoResult<()> {
        self.execute_batch(&format!("SAVEPOINT \"{}\"", name))
    }

    /// Release a savepoint
    fn release_savepoint(&mut self, name: &str) -> IsoResult<()> {
        self.execute_batch(&format!("RELEASE SAVEPOINT \"{}\"", name))
    }

    /// Roll back to a savepoint, leaving it in place
    fn rollback_to_savepoint(&mut self, name: &str) -> IsoResult<()> {
        self.execute_batch(&format!("ROLLBACK TO SAVEPOINT \"{}\"", name))
    }

    /// Delete every row of the given tables
    fn flush(&mut self, tables: &[String]) -> IsoResult<()> {
        for table in tables {
            self.execute(&format!("DELETE FROM \"{}\"", table), &[])?;
        }
        Ok(())
    }

    /// Reset auto-increment counters of the given tables
    fn reset_sequences(&mut self, tables: &[String]) -> IsoResult<()>;

    /// Insert rows, replacing existing rows with the same key
    fn load_rows(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> IsoResult<()>;

    /// Every row of a table with its column names, in key order
    fn dump_table(&mut self, table: &str) -> IsoResult<(Vec<String>, Vec<Vec<Value>>)>;
}
