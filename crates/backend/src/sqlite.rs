//! SQLite backend built on rusqlite
//!
//! Each named database is a file `{root}/{name}.sqlite3`. The special name
//! `:memory:` maps to a shared-cache in-memory database that lives as long as
//! at least one connection to it is open.
//!
//! Capabilities can be narrowed with [`SqliteBackend::without_transactions`]
//! and [`SqliteBackend::without_savepoints`] to exercise the degraded
//! isolation paths of engines that lack them.

use crate::traits::{Backend, Features, RawConnection, IN_MEMORY_NAME};
use isodb_core::{IsoError, IsoResult, Row, Value};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const VENDOR: &str = "sqlite";

/// Default time a connection waits on a locked database
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn sql_err(e: rusqlite::Error) -> IsoError {
    IsoError::database(VENDOR, e.to_string())
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(b),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

// ============================================================================
// Backend
// ============================================================================

/// File-backed SQLite engine
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    root: PathBuf,
    features: Features,
    busy_timeout: Duration,
}

impl SqliteBackend {
    /// Backend storing databases under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            features: Features::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Report no transaction support
    pub fn without_transactions(mut self) -> Self {
        self.features = Features {
            supports_transactions: false,
            uses_savepoints: false,
        };
        self
    }

    /// Report transactions without savepoints
    pub fn without_savepoints(mut self) -> Self {
        self.features.uses_savepoints = false;
        self
    }

    /// Set how long connections wait on a locked database
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Directory holding the database files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path of a named database
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.sqlite3", name))
    }

    fn open(&self, name: &str) -> IsoResult<Connection> {
        let opened = if self.is_in_memory(name) {
            Connection::open_with_flags(
                "file:isodb_memory?mode=memory&cache=shared",
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            Connection::open_with_flags(self.path_for(name), OpenFlags::SQLITE_OPEN_READ_WRITE)
        };
        let conn = opened.map_err(sql_err)?;
        conn.busy_timeout(self.busy_timeout).map_err(sql_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(sql_err)?;
        Ok(conn)
    }
}

impl Backend for SqliteBackend {
    fn vendor(&self) -> &'static str {
        VENDOR
    }

    fn features(&self) -> Features {
        self.features
    }

    fn database_exists(&self, name: &str) -> IsoResult<bool> {
        if self.is_in_memory(name) {
            return Ok(false);
        }
        Ok(self.path_for(name).is_file())
    }

    fn create_database(&self, name: &str) -> IsoResult<()> {
        if self.is_in_memory(name) {
            return Ok(());
        }
        let path = self.path_for(name);
        if path.exists() {
            return Err(IsoError::database(
                VENDOR,
                format!("database '{}' already exists", path.display()),
            ));
        }
        fs::create_dir_all(&self.root)?;
        Connection::open(&path).map_err(sql_err)?;
        debug!(target: "isodb::backend", path = %path.display(), "created sqlite database");
        Ok(())
    }

    fn destroy_database(&self, name: &str) -> IsoResult<()> {
        if self.is_in_memory(name) {
            return Ok(());
        }
        let path = self.path_for(name);
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(target: "isodb::backend", path = %path.display(), "destroyed sqlite database");
        Ok(())
    }

    fn connect(&self, name: &str) -> IsoResult<Box<dyn RawConnection>> {
        if !self.is_in_memory(name) && !self.path_for(name).is_file() {
            return Err(IsoError::database(
                VENDOR,
                format!("database '{}' does not exist", name),
            ));
        }
        Ok(Box::new(SqliteConnection { conn: self.open(name)? }))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One rusqlite connection
#[derive(Debug)]
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Borrow the underlying rusqlite connection
    pub fn inner(&self) -> &Connection {
        &self.conn
    }

    fn has_sequence_table(&self) -> IsoResult<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='sqlite_sequence'",
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count > 0)
    }
}

impl RawConnection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> IsoResult<usize> {
        self.conn
            .execute(sql, params_from_iter(params.iter().map(to_sql)))
            .map_err(sql_err)
    }

    fn execute_batch(&mut self, sql: &str) -> IsoResult<()> {
        self.conn.execute_batch(sql).map_err(sql_err)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> IsoResult<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql).map_err(sql_err)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sql)))
            .map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(from_sql(row.get::<_, SqlValue>(i).map_err(sql_err)?));
            }
            out.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(out)
    }

    fn last_insert_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    fn table_names(&mut self) -> IsoResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(sql_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(names)
    }

    fn flush(&mut self, tables: &[String]) -> IsoResult<()> {
        if tables.is_empty() {
            return Ok(());
        }
        // foreign_keys cannot change inside a transaction
        self.conn
            .execute_batch("PRAGMA foreign_keys = OFF;")
            .map_err(sql_err)?;
        let result = tables.iter().try_for_each(|table| {
            self.conn
                .execute(&format!("DELETE FROM {}", quote(table)), [])
                .map(|_| ())
                .map_err(sql_err)
        });
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(sql_err)?;
        result
    }

    fn reset_sequences(&mut self, tables: &[String]) -> IsoResult<()> {
        if tables.is_empty() || !self.has_sequence_table()? {
            return Ok(());
        }
        for table in tables {
            self.conn
                .execute("DELETE FROM sqlite_sequence WHERE name = ?1", [table])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    fn load_rows(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> IsoResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(table),
            column_list,
            placeholders
        );
        let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
        for row in rows {
            stmt.execute(params_from_iter(row.iter().map(to_sql)))
                .map_err(sql_err)?;
        }
        Ok(())
    }

    fn dump_table(&mut self, table: &str) -> IsoResult<(Vec<String>, Vec<Vec<Value>>)> {
        let sql = format!("SELECT * FROM {} ORDER BY rowid", quote(table));
        let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let width = columns.len();
        let mut rows = stmt.query([]).map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get::<_, SqlValue>(i).map_err(sql_err)?));
            }
            out.push(values);
        }
        Ok((columns, out))
    }
}
