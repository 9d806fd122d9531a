//! DuckDB-backed local store shared by the pull and push paths.
//!
//! Besides the user data tables this owns the sync bookkeeping: the audit
//! trail of remote changes, the singleton status row, the local changelog and
//! the sheet/column registries the schema resolver maintains.

mod schema;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::types::{
    AuditEntry, AuditStatus, ColumnMapping, DataType, RemoteChange, SyncMode, SyncStatus,
};
use crate::value::{format_timestamp, parse_datetime, CellValue};

pub use schema::SCHEMA;

/// Primary key of every synced data table; holds the remote row number.
pub const ROW_COLUMN: &str = "_row";
pub const MODIFIED_COLUMN: &str = "_modified_at";
pub const SYNCED_COLUMN: &str = "_synced_at";

/// Columns starting with this prefix are bookkeeping, never synced.
pub const INTERNAL_PREFIX: char = '_';

pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize sync schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Local store lock poisoned"))
    }

    // ========== Data Tables ==========

    /// Create a synced data table with the internal row/timestamp columns.
    pub fn create_data_table(&self, table: &str, columns: &[(&str, DataType)]) -> Result<()> {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} BIGINT PRIMARY KEY, {} VARCHAR, {} VARCHAR",
            quote_ident(table),
            ROW_COLUMN,
            MODIFIED_COLUMN,
            SYNCED_COLUMN
        );
        for (name, data_type) in columns {
            ddl.push_str(&format!(", {} {}", quote_ident(name), data_type.sql_type()));
        }
        ddl.push(')');

        self.conn()?
            .execute_batch(&ddl)
            .with_context(|| format!("Failed to create table {}", table))
    }

    /// Non-internal columns of `table`, in declaration order.
    pub fn data_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        list_data_columns(&conn, table)
    }

    /// Insert a bare row keyed by `row_id` unless it already exists.
    /// Returns whether a row was inserted.
    pub fn ensure_row(&self, table: &str, row_id: i64) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?) ON CONFLICT DO NOTHING",
            quote_ident(table),
            ROW_COLUMN
        );
        let inserted = self
            .conn()?
            .execute(&sql, params![row_id])
            .with_context(|| format!("Failed to ensure row {} in {}", row_id, table))?;
        Ok(inserted > 0)
    }

    /// Local last-modified time of a row, if the row exists and was modified.
    pub fn row_modified_at(&self, table: &str, row_id: i64) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            MODIFIED_COLUMN,
            quote_ident(table),
            ROW_COLUMN
        );
        let conn = self.conn()?;
        let raw: Option<Option<String>> =
            optional(conn.query_row(&sql, params![row_id], |row| row.get(0)))?;
        Ok(raw.flatten().as_deref().and_then(parse_datetime))
    }

    /// Current value of a cell rendered as text.
    pub fn read_cell(&self, table: &str, row_id: i64, column: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        read_cell_text(&conn, table, row_id, column)
    }

    /// Write a value that came from the remote side.
    ///
    /// Both timestamps move together so the write is not mistaken for a local
    /// edit, and nothing is appended to the changelog.
    pub fn write_remote_value(
        &self,
        table: &str,
        row_id: i64,
        column: &str,
        value: &CellValue,
        modified_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} = ?, {} = ?, {} = ? WHERE {} = ?",
            quote_ident(table),
            quote_ident(column),
            MODIFIED_COLUMN,
            SYNCED_COLUMN,
            ROW_COLUMN
        );
        let now = format_timestamp(&Utc::now());
        self.conn()?
            .execute(
                &sql,
                params![value, format_timestamp(&modified_at), now, row_id],
            )
            .with_context(|| format!("Failed to write {}.{} row {}", table, column, row_id))?;
        Ok(())
    }

    // ========== Audit Trail ==========

    /// Append a remote change to the audit trail. Returns `false` when the id
    /// was already recorded.
    pub fn log_remote_change(&self, change: &RemoteChange, status: AuditStatus) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT INTO _sync_remote_changes
                (id, change_timestamp, sheet_name, sheet_row, sheet_col,
                 old_value, new_value, source, status, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
            params![
                change.id,
                format_timestamp(&change.timestamp),
                change.sheet,
                change.row,
                i64::from(change.col),
                serde_json::to_string(&change.old_value)?,
                serde_json::to_string(&change.new_value)?,
                change.source,
                status.as_str(),
                format_timestamp(&Utc::now()),
            ],
        )?;
        if inserted == 0 {
            debug!("Remote change {} already in audit trail", change.id);
        }
        Ok(inserted > 0)
    }

    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, change_timestamp, sheet_name, sheet_row, sheet_col,
                    old_value, new_value, source, status, recorded_at
             FROM _sync_remote_changes
             ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, ts, sheet, sheet_row, col, old, new, source, status, recorded) = row?;
            let change = RemoteChange {
                id,
                timestamp: parse_stored_timestamp(&ts)?,
                sheet,
                row: sheet_row,
                col: u32::try_from(col).context("Column index out of range")?,
                old_value: decode_json(old.as_deref())?,
                new_value: decode_json(new.as_deref())?,
                source,
            };
            let status = match status.as_str() {
                "conflict" => AuditStatus::Conflict,
                _ => AuditStatus::Applied,
            };
            entries.push(AuditEntry {
                change,
                status,
                recorded_at: parse_stored_timestamp(&recorded)?,
            });
        }
        Ok(entries)
    }

    // ========== Sync Status ==========

    pub fn sync_status(&self) -> Result<SyncStatus> {
        let conn = self.conn()?;
        let (target, document, mode, last_pull, last_push, pulls, pushes, conflicts) = conn
            .query_row(
                "SELECT remote_target, document_id, sync_mode, last_pull, last_push,
                        total_pulls, total_pushes, total_conflicts
                 FROM _sync_status WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .context("Failed to read sync status")?;

        Ok(SyncStatus {
            remote_target: target,
            document_id: document,
            sync_mode: mode.parse().unwrap_or_default(),
            last_pull: last_pull.as_deref().and_then(parse_datetime),
            last_push: last_push.as_deref().and_then(parse_datetime),
            total_pulls: pulls,
            total_pushes: pushes,
            total_conflicts: conflicts,
        })
    }

    pub fn set_sync_target(&self, remote_target: Option<&str>, document_id: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE _sync_status SET remote_target = ?, document_id = ? WHERE id = 1",
            params![remote_target, document_id],
        )?;
        Ok(())
    }

    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        self.conn()?.execute(
            "UPDATE _sync_status SET sync_mode = ? WHERE id = 1",
            params![mode.as_str()],
        )?;
        Ok(())
    }

    pub fn record_pull(&self, applied: usize, conflicts: usize) -> Result<()> {
        self.conn()?.execute(
            "UPDATE _sync_status
             SET last_pull = ?, total_pulls = total_pulls + ?, total_conflicts = total_conflicts + ?
             WHERE id = 1",
            params![
                format_timestamp(&Utc::now()),
                applied as i64,
                conflicts as i64
            ],
        )?;
        Ok(())
    }

    pub fn record_push(&self, pushed: usize) -> Result<()> {
        self.conn()?.execute(
            "UPDATE _sync_status SET last_push = ?, total_pushes = total_pushes + ? WHERE id = 1",
            params![format_timestamp(&Utc::now()), pushed as i64],
        )?;
        Ok(())
    }

    // ========== Registries ==========

    /// Map a sheet to a local table, replacing any previous mapping of either.
    pub fn register_sheet(&self, sheet: &str, table: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM _sync_sheets WHERE sheet_name = ? OR table_name = ?",
            params![sheet, table],
        )?;
        tx.execute(
            "INSERT INTO _sync_sheets (sheet_name, table_name) VALUES (?, ?)",
            params![sheet, table],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn table_for_sheet(&self, sheet: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            "SELECT table_name FROM _sync_sheets WHERE sheet_name = ? LIMIT 1",
            params![sheet],
            |row| row.get(0),
        ))
    }

    pub fn sheet_for_table(&self, table: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            "SELECT sheet_name FROM _sync_sheets WHERE table_name = ? LIMIT 1",
            params![table],
            |row| row.get(0),
        ))
    }

    /// Record where remote column `col_index` of `sheet` lands locally.
    pub fn register_column(
        &self,
        sheet: &str,
        col_index: u32,
        header: &str,
        mapping: &ColumnMapping,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM _sync_columns WHERE sheet_name = ? AND col_index = ?",
            params![sheet, i64::from(col_index)],
        )?;
        tx.execute(
            "INSERT INTO _sync_columns (sheet_name, col_index, header, local_column, data_type)
             VALUES (?, ?, ?, ?, ?)",
            params![
                sheet,
                i64::from(col_index),
                header,
                mapping.local_column,
                mapping.data_type.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn column_mapping(&self, sheet: &str, col_index: u32) -> Result<Option<ColumnMapping>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = optional(conn.query_row(
            "SELECT local_column, data_type FROM _sync_columns
             WHERE sheet_name = ? AND col_index = ? LIMIT 1",
            params![sheet, i64::from(col_index)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))?;
        row.map(|(local_column, data_type)| {
            Ok(ColumnMapping {
                local_column,
                data_type: data_type.parse()?,
            })
        })
        .transpose()
    }

    /// Kind of value stored in `table.column`, if the column exists.
    pub fn column_type(&self, table: &str, column: &str) -> Result<Option<DataType>> {
        let conn = self.conn()?;
        let sql_type: Option<String> = optional(conn.query_row(
            "SELECT data_type FROM information_schema.columns
             WHERE table_name = ? AND column_name = ?",
            params![table, column],
            |row| row.get(0),
        ))?;
        Ok(sql_type.as_deref().map(DataType::from_sql_type))
    }

    /// Remote column index of a local column, through the table's sheet.
    pub fn column_index(&self, table: &str, column: &str) -> Result<Option<u32>> {
        let conn = self.conn()?;
        let index: Option<i64> = optional(conn.query_row(
            "SELECT c.col_index FROM _sync_columns c
             JOIN _sync_sheets s ON s.sheet_name = c.sheet_name
             WHERE s.table_name = ? AND c.local_column = ?
             LIMIT 1",
            params![table, column],
            |row| row.get(0),
        ))?;
        index
            .map(|i| u32::try_from(i).context("Column index out of range"))
            .transpose()
    }
}

/// Double-quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn list_data_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT column_name FROM information_schema.columns
         WHERE table_name = ?
         ORDER BY ordinal_position",
    )?;
    let names = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<duckdb::Result<Vec<_>>>()?;
    if names.is_empty() {
        anyhow::bail!("Table {} does not exist", table);
    }
    Ok(names
        .into_iter()
        .filter(|name| !name.starts_with(INTERNAL_PREFIX))
        .collect())
}

pub(crate) fn read_cell_text(
    conn: &Connection,
    table: &str,
    row_id: i64,
    column: &str,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT CAST({} AS VARCHAR) FROM {} WHERE {} = ?",
        quote_ident(column),
        quote_ident(table),
        ROW_COLUMN
    );
    let value: Option<Option<String>> =
        optional(conn.query_row(&sql, params![row_id], |row| row.get(0)))?;
    Ok(value.flatten())
}

pub(crate) fn optional<T>(result: duckdb::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn parse_stored_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    parse_datetime(raw).ok_or_else(|| anyhow!("Invalid stored timestamp: {}", raw))
}

fn decode_json(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(serde_json::Value::Null),
    }
}
