//! Serialized-rollback snapshots
//!
//! A snapshot holds every row of the model tables of one database as JSON,
//! captured once right after setup. Flush-isolated tests wipe the tables at
//! teardown; tests that ask for serialized rollback get the captured rows
//! replayed before they run. Replay is an upsert, so replaying twice leaves
//! exactly the captured rows.

use crate::connection::Connection;
use isodb_core::{IsoResult, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TableDump {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Captured contents of one database
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedSnapshot {
    alias: String,
    payload: String,
}

impl SerializedSnapshot {
    /// Dump `tables` through `conn`
    ///
    /// Tables that do not exist in the database are skipped.
    ///
    /// # Errors
    ///
    /// Access or backend errors while reading.
    pub fn capture(conn: &Connection, tables: &[String]) -> IsoResult<Self> {
        let existing = conn.table_names()?;
        let mut dumps = Vec::new();
        for table in tables.iter().filter(|t| existing.contains(t)) {
            let (columns, rows) = conn.dump_table(table)?;
            dumps.push(TableDump {
                table: table.clone(),
                columns,
                rows,
            });
        }
        let payload = serde_json::to_string(&dumps)?;
        debug!(
            target: "isodb::snapshot",
            alias = %conn.alias(),
            tables = dumps.len(),
            bytes = payload.len(),
            "captured serialized snapshot"
        );
        Ok(Self {
            alias: conn.alias().to_string(),
            payload,
        })
    }

    /// Alias the snapshot was taken from
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// JSON payload
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Number of captured rows across all tables
    pub fn row_count(&self) -> IsoResult<usize> {
        let dumps: Vec<TableDump> = serde_json::from_str(&self.payload)?;
        Ok(dumps.iter().map(|d| d.rows.len()).sum())
    }

    /// Upsert the captured rows through `conn`
    ///
    /// Runs inside one atomic block when the backend has transactions.
    pub fn replay(&self, conn: &Connection) -> IsoResult<()> {
        let dumps: Vec<TableDump> = serde_json::from_str(&self.payload)?;
        let load = |c: &Connection| -> IsoResult<()> {
            for dump in &dumps {
                c.load_rows(&dump.table, &dump.columns, &dump.rows)?;
            }
            Ok(())
        };
        if conn.features().supports_transactions {
            conn.atomic(load)?;
        } else {
            load(conn)?;
        }
        debug!(target: "isodb::snapshot", alias = %self.alias, "replayed serialized snapshot");
        Ok(())
    }
}
