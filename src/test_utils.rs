//! In-memory collaborators for exercising the sync engine without a remote
//! document.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::persistence::LocalStore;
use crate::rpc::RemoteRpc;
use crate::schema::SchemaResolver;
use crate::types::{
    CellUpdate, ColumnHeader, ColumnMapping, ColumnResolution, DataType, RemoteChange,
    ResolveAction, SyncMode,
};

/// Remote document double that records every call.
#[derive(Default)]
pub struct MockRpc {
    pending: Mutex<Vec<RemoteChange>>,
    headers: Mutex<HashMap<String, Vec<ColumnHeader>>>,
    calls: Mutex<Vec<String>>,
    batches: Mutex<Vec<Vec<CellUpdate>>>,
    acknowledged: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    failing_sheets: Mutex<HashSet<String>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue remote edits returned by `get_unsynced` until acknowledged.
    pub fn queue(&self, changes: Vec<RemoteChange>) {
        self.pending.lock().unwrap().extend(changes);
    }

    pub fn set_headers(&self, sheet: &str, headers: &[(u32, &str)]) {
        let headers = headers
            .iter()
            .map(|(index, header)| ColumnHeader {
                index: *index,
                header: header.to_string(),
            })
            .collect();
        self.headers.lock().unwrap().insert(sheet.to_string(), headers);
    }

    /// Make every call to `function` fail.
    pub fn fail(&self, function: &str) {
        self.failing.lock().unwrap().insert(function.to_string());
    }

    pub fn recover(&self, function: &str) {
        self.failing.lock().unwrap().remove(function);
    }

    /// Make batch updates touching `sheet` fail.
    pub fn fail_batches_for(&self, sheet: &str) {
        self.failing_sheets.lock().unwrap().insert(sheet.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, function: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == function).count()
    }

    pub fn batches(&self) -> Vec<Vec<CellUpdate>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    fn enter(&self, function: &str) -> Result<()> {
        self.calls.lock().unwrap().push(function.to_string());
        if self.failing.lock().unwrap().contains(function) {
            return Err(anyhow!("RPC {} failed with status 500: simulated failure", function));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRpc for MockRpc {
    async fn set_sync_mode(&self, _mode: SyncMode) -> Result<()> {
        self.enter("setSyncMode")
    }

    async fn set_tunnel_url(&self, _url: &str) -> Result<()> {
        self.enter("setTunnelUrl")
    }

    async fn get_unsynced(&self) -> Result<Vec<RemoteChange>> {
        self.enter("getUnsynced")?;
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn mark_synced(&self, ids: &[String]) -> Result<()> {
        self.enter("markSynced")?;
        self.pending
            .lock()
            .unwrap()
            .retain(|change| !ids.contains(&change.id));
        self.acknowledged.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }

    async fn get_column_headers(&self, sheet: &str) -> Result<Vec<ColumnHeader>> {
        self.enter("getColumnHeaders")?;
        Ok(self
            .headers
            .lock()
            .unwrap()
            .get(sheet)
            .cloned()
            .unwrap_or_default())
    }

    async fn batch_update_cells(&self, updates: &[CellUpdate]) -> Result<()> {
        self.enter("batchUpdateCells")?;
        let failing = self.failing_sheets.lock().unwrap();
        if let Some(update) = updates.iter().find(|u| failing.contains(&u.sheet)) {
            return Err(anyhow!("RPC batchUpdateCells failed with status 403: {} is protected", update.sheet));
        }
        self.batches.lock().unwrap().push(updates.to_vec());
        Ok(())
    }
}

/// Schema resolver with a fixed set of mappings.
#[derive(Default)]
pub struct StaticResolver {
    sheets: HashMap<String, String>,
    columns: HashMap<(String, u32), ColumnResolution>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sheet(mut self, sheet: &str, table: &str) -> Self {
        self.sheets.insert(sheet.to_string(), table.to_string());
        self
    }

    pub fn column(self, sheet: &str, col: u32, local_column: &str, data_type: DataType) -> Self {
        self.column_with(sheet, col, local_column, data_type, ResolveAction::Matched)
    }

    /// Register a column whose resolution reports `action`.
    pub fn column_with(
        mut self,
        sheet: &str,
        col: u32,
        local_column: &str,
        data_type: DataType,
        action: ResolveAction,
    ) -> Self {
        self.columns.insert(
            (sheet.to_string(), col),
            ColumnResolution {
                action,
                mapping: ColumnMapping {
                    local_column: local_column.to_string(),
                    data_type,
                },
            },
        );
        self
    }
}

#[async_trait]
impl SchemaResolver for StaticResolver {
    async fn resolve_column(
        &self,
        sheet: &str,
        col_index: u32,
        header: &str,
        _sample_value: &serde_json::Value,
    ) -> Result<ColumnResolution> {
        self.columns
            .get(&(sheet.to_string(), col_index))
            .cloned()
            .ok_or_else(|| anyhow!("Cannot resolve {} column {} ('{}')", sheet, col_index, header))
    }

    fn table_for_sheet(&self, sheet: &str) -> Result<Option<String>> {
        Ok(self.sheets.get(sheet).cloned())
    }

    fn sheet_for_table(&self, table: &str) -> Result<Option<String>> {
        Ok(self
            .sheets
            .iter()
            .find(|(_, t)| t.as_str() == table)
            .map(|(sheet, _)| sheet.clone()))
    }

    fn column_index(&self, table: &str, column: &str) -> Result<Option<u32>> {
        let Some(sheet) = self.sheet_for_table(table)? else {
            return Ok(None);
        };
        Ok(self
            .columns
            .iter()
            .find(|((s, _), resolution)| *s == sheet && resolution.mapping.local_column == column)
            .map(|((_, col), _)| *col))
    }
}

/// In-memory store with an `items` table mapped to `Sheet1`:
/// column 1 → `name` (text), column 2 → `amount` (integer).
pub fn items_fixture() -> (Arc<LocalStore>, Arc<MockRpc>, Arc<StaticResolver>) {
    let store = Arc::new(LocalStore::open_in_memory().expect("in-memory store"));
    store
        .create_data_table("items", &[("name", DataType::Text), ("amount", DataType::Integer)])
        .expect("items table");

    let rpc = Arc::new(MockRpc::new());
    rpc.set_headers("Sheet1", &[(1, "Name"), (2, "Amount")]);

    let resolver = Arc::new(
        StaticResolver::new()
            .sheet("Sheet1", "items")
            .column("Sheet1", 1, "name", DataType::Text)
            .column("Sheet1", 2, "amount", DataType::Integer),
    );

    (store, rpc, resolver)
}

/// Build a remote change; `timestamp` is RFC 3339.
pub fn remote_change(
    id: &str,
    sheet: &str,
    row: i64,
    col: u32,
    new_value: serde_json::Value,
    timestamp: &str,
) -> RemoteChange {
    RemoteChange {
        id: id.to_string(),
        timestamp: chrono::DateTime::parse_from_rfc3339(timestamp)
            .expect("valid RFC 3339 timestamp")
            .with_timezone(&chrono::Utc),
        sheet: sheet.to_string(),
        row,
        col,
        old_value: serde_json::Value::Null,
        new_value,
        source: Some("test".to_string()),
    }
}
