//! Local change capture.
//!
//! DuckDB has no triggers, so capture happens in the write path: every local
//! write goes through [`ChangeTracker::update_cell`] or
//! [`ChangeTracker::insert_row`], which append a changelog row for each
//! tracked column whose value actually changed. The changelog write shares a
//! transaction with the data write, so no tracked edit can be lost.

use anyhow::{Context, Result};
use chrono::Utc;
use duckdb::{params, params_from_iter, Connection};
use std::sync::Arc;
use tracing::{debug, info};

use crate::persistence::{
    list_data_columns, parse_stored_timestamp, quote_ident, read_cell_text, LocalStore,
    MODIFIED_COLUMN, ROW_COLUMN,
};
use crate::types::ChangelogEntry;
use crate::value::{format_timestamp, CellValue};

const ENTRY_COLUMNS: &str = "id, table_name, row_id, column_name, old_value, new_value, \
     changed_at, pushed_to_sheet, push_attempts, last_push_error";

#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<LocalStore>,
}

impl ChangeTracker {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Install capture hooks for every non-internal column of `table`.
    ///
    /// Reinstalling drops the previous hooks first, so columns added since the
    /// last install are picked up and removed ones are forgotten.
    pub fn install_tracking(&self, table: &str) -> Result<usize> {
        let mut conn = self.store.conn()?;
        let columns = list_data_columns(&conn, table)?;
        let installed_at = format_timestamp(&Utc::now());

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM _sync_tracked_columns WHERE table_name = ?",
            params![table],
        )?;
        for column in &columns {
            tx.execute(
                "INSERT INTO _sync_tracked_columns (table_name, column_name, installed_at)
                 VALUES (?, ?, ?)",
                params![table, column, installed_at],
            )?;
        }
        tx.commit()
            .with_context(|| format!("Failed to install change tracking on {}", table))?;

        info!("Tracking {} columns of {}", columns.len(), table);
        Ok(columns.len())
    }

    pub fn tracked_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT column_name FROM _sync_tracked_columns WHERE table_name = ? ORDER BY column_name",
        )?;
        let columns = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(columns)
    }

    /// Write a cell locally. Returns the changelog id when the write was
    /// captured.
    pub fn update_cell(
        &self,
        table: &str,
        row_id: i64,
        column: &str,
        value: &CellValue,
    ) -> Result<Option<i64>> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        let old_value = read_cell_text(&tx, table, row_id, column)?;
        let sql = format!(
            "UPDATE {} SET {} = ?, {} = ? WHERE {} = ?",
            quote_ident(table),
            quote_ident(column),
            MODIFIED_COLUMN,
            ROW_COLUMN
        );
        let updated = tx
            .execute(&sql, params![value, format_timestamp(&Utc::now()), row_id])
            .with_context(|| format!("Failed to update {}.{} row {}", table, column, row_id))?;
        if updated == 0 {
            anyhow::bail!("Row {} does not exist in {}", row_id, table);
        }

        let new_value = read_cell_text(&tx, table, row_id, column)?;
        let captured = if old_value != new_value && is_tracked(&tx, table, column)? {
            Some(append_change(
                &tx,
                table,
                row_id,
                column,
                old_value.as_deref(),
                new_value.as_deref(),
            )?)
        } else {
            None
        };
        tx.commit()?;

        if let Some(id) = captured {
            debug!("Captured change {} on {}.{} row {}", id, table, column, row_id);
        }
        Ok(captured)
    }

    /// Insert a new row locally. Each non-null tracked value is captured as a
    /// change from null. Returns the number of captured changes.
    pub fn insert_row(&self, table: &str, row_id: i64, values: &[(&str, CellValue)]) -> Result<usize> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        let mut columns = vec![ROW_COLUMN.to_string(), MODIFIED_COLUMN.to_string()];
        columns.extend(values.iter().map(|(name, _)| quote_ident(name)));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders
        );

        let mut bound = vec![
            CellValue::Int(row_id),
            CellValue::Text(format_timestamp(&Utc::now())),
        ];
        bound.extend(values.iter().map(|(_, value)| value.clone()));
        tx.execute(&sql, params_from_iter(bound.iter()))
            .with_context(|| format!("Failed to insert row {} into {}", row_id, table))?;

        let mut captured = 0;
        for (column, value) in values {
            if value.is_null() || !is_tracked(&tx, table, column)? {
                continue;
            }
            let stored = read_cell_text(&tx, table, row_id, column)?;
            append_change(&tx, table, row_id, column, None, stored.as_deref())?;
            captured += 1;
        }
        tx.commit()?;

        debug!("Inserted row {} into {} ({} changes captured)", row_id, table, captured);
        Ok(captured)
    }

    /// Oldest unpushed changes, at most `limit`.
    pub fn get_unpushed_changes(&self, limit: usize) -> Result<Vec<ChangelogEntry>> {
        self.get_unpushed_changes_after(None, limit)
    }

    /// Oldest unpushed changes with an id above `after`, at most `limit`.
    pub fn get_unpushed_changes_after(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChangelogEntry>> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT {} FROM _sync_changelog WHERE NOT pushed_to_sheet AND id > ? ORDER BY id LIMIT {}",
            ENTRY_COLUMNS, limit
        );
        query_entries(&conn, &sql, params![after.unwrap_or(i64::MIN)])
    }

    pub fn entry(&self, id: i64) -> Result<Option<ChangelogEntry>> {
        let conn = self.store.conn()?;
        let sql = format!("SELECT {} FROM _sync_changelog WHERE id = ?", ENTRY_COLUMNS);
        Ok(query_entries(&conn, &sql, params![id])?.into_iter().next())
    }

    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.store.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM _sync_changelog WHERE NOT pushed_to_sheet",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Flag the given entries as pushed in one statement.
    pub fn mark_as_pushed(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE _sync_changelog SET pushed_to_sheet = true WHERE id IN ({})",
            placeholders
        );
        let updated = self.store.conn()?.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(updated)
    }

    /// Count a failed push attempt. Entries stay unpushed.
    pub fn record_push_error(&self, id: i64, error: &str) -> Result<()> {
        self.store.conn()?.execute(
            "UPDATE _sync_changelog
             SET push_attempts = push_attempts + 1, last_push_error = ?
             WHERE id = ?",
            params![error, id],
        )?;
        Ok(())
    }
}

fn is_tracked(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM _sync_tracked_columns WHERE table_name = ? AND column_name = ?",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn append_change(
    conn: &Connection,
    table: &str,
    row_id: i64,
    column: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
) -> Result<i64> {
    let id = conn.query_row(
        "INSERT INTO _sync_changelog (table_name, row_id, column_name, old_value, new_value, changed_at)
         VALUES (?, ?, ?, ?, ?, ?)
         RETURNING id",
        params![
            table,
            row_id,
            column,
            old_value,
            new_value,
            format_timestamp(&Utc::now())
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn query_entries<P: duckdb::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<ChangelogEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, bool>(7)?,
            row.get::<_, i64>(8)?,
            row.get::<_, Option<String>>(9)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, table_name, row_id, column_name, old_value, new_value, changed_at, pushed, attempts, last_error) =
            row?;
        entries.push(ChangelogEntry {
            id,
            table_name,
            row_id,
            column_name,
            old_value,
            new_value,
            changed_at: parse_stored_timestamp(&changed_at)?,
            pushed_to_sheet: pushed,
            push_attempts: attempts,
            last_push_error: last_error,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn tracked_store() -> (Arc<LocalStore>, ChangeTracker) {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        store
            .create_data_table("items", &[("name", DataType::Text), ("amount", DataType::Integer)])
            .unwrap();
        let tracker = ChangeTracker::new(store.clone());
        tracker.install_tracking("items").unwrap();
        (store, tracker)
    }

    #[test]
    fn install_skips_internal_columns_and_is_idempotent() {
        let (_store, tracker) = tracked_store();
        assert_eq!(tracker.install_tracking("items").unwrap(), 2);
        assert_eq!(
            tracker.tracked_columns("items").unwrap(),
            vec!["amount".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn install_on_missing_table_fails() {
        let (_store, tracker) = tracked_store();
        assert!(tracker.install_tracking("nope").is_err());
    }

    #[test]
    fn updates_are_captured_only_when_value_changes() {
        let (store, tracker) = tracked_store();
        store.ensure_row("items", 2).unwrap();

        let first = tracker
            .update_cell("items", 2, "amount", &CellValue::Int(10))
            .unwrap();
        let same = tracker
            .update_cell("items", 2, "amount", &CellValue::Int(10))
            .unwrap();

        assert!(first.is_some());
        assert!(same.is_none());
        let changes = tracker.get_unpushed_changes(10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_value, None);
        assert_eq!(changes[0].new_value.as_deref(), Some("10"));
        assert!(!changes[0].pushed_to_sheet);
        assert!(store.row_modified_at("items", 2).unwrap().is_some());
    }

    #[test]
    fn untracked_tables_write_without_capture() {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        store
            .create_data_table("scratch", &[("note", DataType::Text)])
            .unwrap();
        store.ensure_row("scratch", 1).unwrap();
        let tracker = ChangeTracker::new(store.clone());

        let captured = tracker
            .update_cell("scratch", 1, "note", &CellValue::from("hi"))
            .unwrap();

        assert!(captured.is_none());
        assert_eq!(store.read_cell("scratch", 1, "note").unwrap().as_deref(), Some("hi"));
    }

    #[test]
    fn updating_a_missing_row_fails_without_capture() {
        let (_store, tracker) = tracked_store();
        assert!(tracker
            .update_cell("items", 99, "amount", &CellValue::Int(1))
            .is_err());
        assert_eq!(tracker.pending_count().unwrap(), 0);
    }

    #[test]
    fn inserts_capture_non_null_values() {
        let (_store, tracker) = tracked_store();

        let captured = tracker
            .insert_row(
                "items",
                3,
                &[("name", CellValue::from("Widget")), ("amount", CellValue::Null)],
            )
            .unwrap();

        assert_eq!(captured, 1);
        let changes = tracker.get_unpushed_changes(10).unwrap();
        assert_eq!(changes[0].column_name, "name");
        assert_eq!(changes[0].row_id, 3);
    }

    #[test]
    fn unpushed_changes_are_oldest_first_and_bounded() {
        let (store, tracker) = tracked_store();
        store.ensure_row("items", 2).unwrap();
        for amount in 1..=5 {
            tracker
                .update_cell("items", 2, "amount", &CellValue::Int(amount))
                .unwrap();
        }

        let changes = tracker.get_unpushed_changes(3).unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].new_value.as_deref(), Some("1"));
        assert!(changes.windows(2).all(|w| w[0].id < w[1].id));

        let rest = tracker
            .get_unpushed_changes_after(Some(changes[2].id), 10)
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].new_value.as_deref(), Some("4"));
    }

    #[test]
    fn marking_pushed_removes_from_unpushed() {
        let (store, tracker) = tracked_store();
        store.ensure_row("items", 2).unwrap();
        let id = tracker
            .update_cell("items", 2, "name", &CellValue::from("a"))
            .unwrap()
            .unwrap();

        assert_eq!(tracker.mark_as_pushed(&[]).unwrap(), 0);
        assert_eq!(tracker.mark_as_pushed(&[id]).unwrap(), 1);

        assert!(tracker.get_unpushed_changes(10).unwrap().is_empty());
        assert!(tracker.entry(id).unwrap().unwrap().pushed_to_sheet);
    }

    #[test]
    fn push_errors_accumulate_attempts() {
        let (store, tracker) = tracked_store();
        store.ensure_row("items", 2).unwrap();
        let id = tracker
            .update_cell("items", 2, "name", &CellValue::from("a"))
            .unwrap()
            .unwrap();

        tracker.record_push_error(id, "timeout").unwrap();
        tracker.record_push_error(id, "status 500").unwrap();

        let entry = tracker.entry(id).unwrap().unwrap();
        assert_eq!(entry.push_attempts, 2);
        assert_eq!(entry.last_push_error.as_deref(), Some("status 500"));
        assert!(!entry.pushed_to_sheet);
    }
}
