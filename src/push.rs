//! Replays captured local changes onto the remote document.
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::persistence::LocalStore;
use crate::rpc::RemoteRpc;
use crate::schema::SchemaResolver;
use crate::tracker::ChangeTracker;
use crate::types::{CellUpdate, ChangelogEntry, DataType, PushResult};
use crate::value::cast_value;

/// Upper bound on changes sent per push.
pub const DEFAULT_PUSH_BATCH_LIMIT: usize = 500;

pub struct SheetPusher {
    store: Arc<LocalStore>,
    tracker: ChangeTracker,
    rpc: Arc<dyn RemoteRpc>,
    resolver: Arc<dyn SchemaResolver>,
    batch_limit: usize,
    in_flight: tokio::sync::Mutex<()>,
}

/// Updates bound for one sheet and the changelog ids behind them.
struct SheetBatch {
    table: String,
    sheet: String,
    updates: Vec<CellUpdate>,
    ids: Vec<i64>,
}

impl SheetPusher {
    pub fn new(
        store: Arc<LocalStore>,
        rpc: Arc<dyn RemoteRpc>,
        resolver: Arc<dyn SchemaResolver>,
    ) -> Self {
        Self {
            tracker: ChangeTracker::new(store.clone()),
            store,
            rpc,
            resolver,
            batch_limit: DEFAULT_PUSH_BATCH_LIMIT,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    /// Push unpushed changes, one batched remote call per table.
    ///
    /// A failed batch leaves its entries unpushed with the error recorded, so
    /// the next push retries them. Counts are per cell change.
    pub async fn push_to_sheet(&self) -> PushResult {
        let _guard = self.in_flight.lock().await;
        let mut result = PushResult::default();

        let batches = match self.collect_batches(&mut result) {
            Ok(batches) => batches,
            Err(e) => {
                error!("Failed to read local changelog: {:#}", e);
                self.finish(&result);
                return result;
            }
        };

        if batches.is_empty() {
            debug!("No local changes to push");
            self.finish(&result);
            return result;
        }

        for batch in batches {
            match self.rpc.batch_update_cells(&batch.updates).await {
                Ok(()) => match self.tracker.mark_as_pushed(&batch.ids) {
                    Ok(_) => {
                        debug!(
                            "Pushed {} changes from {} to {}",
                            batch.ids.len(),
                            batch.table,
                            batch.sheet
                        );
                        result.pushed += batch.ids.len();
                    }
                    Err(e) => {
                        error!(
                            "Pushed {} changes but could not mark them: {:#}",
                            batch.ids.len(),
                            e
                        );
                        result.failed += batch.ids.len();
                    }
                },
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!("Batch update of {} failed: {}", batch.sheet, message);
                    for id in &batch.ids {
                        if let Err(e) = self.tracker.record_push_error(*id, &message) {
                            error!("Failed to record push error on change {}: {:#}", id, e);
                        }
                    }
                    result.failed += batch.ids.len();
                }
            }
        }

        self.finish(&result);
        info!("Push complete: {} pushed, {} failed", result.pushed, result.failed);
        result
    }

    /// Walk the changelog oldest first until `batch_limit` pushable changes
    /// are gathered or the log runs out.
    ///
    /// Changes of tables without a sheet count as failed and changes of
    /// columns without a remote column are left out. Both stay unpushed and
    /// never hold back the changes behind them.
    fn collect_batches(&self, result: &mut PushResult) -> Result<Vec<SheetBatch>> {
        let mut batches: Vec<SheetBatch> = Vec::new();
        let mut sheets: HashMap<String, Option<String>> = HashMap::new();
        let mut targets: HashMap<(String, String), Option<(u32, DataType)>> = HashMap::new();
        let mut selected = 0;
        let mut cursor = None;

        while selected < self.batch_limit {
            let page = self
                .tracker
                .get_unpushed_changes_after(cursor, self.batch_limit)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);

            for entry in page {
                if selected == self.batch_limit {
                    break;
                }

                let sheet = sheets
                    .entry(entry.table_name.clone())
                    .or_insert_with(|| self.sheet_for(&entry.table_name))
                    .clone();
                let Some(sheet) = sheet else {
                    result.failed += 1;
                    continue;
                };

                let target = *targets
                    .entry((entry.table_name.clone(), entry.column_name.clone()))
                    .or_insert_with(|| self.column_target(&entry));
                let Some((col, data_type)) = target else {
                    continue;
                };

                let update = CellUpdate {
                    sheet: sheet.clone(),
                    row: entry.row_id,
                    col,
                    value: typed_value(&entry, data_type),
                };
                match batches.iter_mut().find(|b| b.table == entry.table_name) {
                    Some(batch) => {
                        batch.updates.push(update);
                        batch.ids.push(entry.id);
                    }
                    None => batches.push(SheetBatch {
                        table: entry.table_name.clone(),
                        sheet,
                        updates: vec![update],
                        ids: vec![entry.id],
                    }),
                }
                selected += 1;
            }
        }

        Ok(batches)
    }

    fn sheet_for(&self, table: &str) -> Option<String> {
        match self.resolver.sheet_for_table(table) {
            Ok(Some(sheet)) => Some(sheet),
            Ok(None) => {
                warn!("Table {} is not mapped to a sheet, its changes stay unpushed", table);
                None
            }
            Err(e) => {
                warn!("Failed to look up sheet for {}: {:#}", table, e);
                None
            }
        }
    }

    /// Remote column and local value kind of a changed column.
    fn column_target(&self, entry: &ChangelogEntry) -> Option<(u32, DataType)> {
        let (table, column) = (&entry.table_name, &entry.column_name);
        let col = match self.resolver.column_index(table, column) {
            Ok(Some(col)) => col,
            Ok(None) => {
                debug!("{}.{} has no remote column, leaving its changes unpushed", table, column);
                return None;
            }
            Err(e) => {
                warn!("Failed to resolve {}.{}: {:#}", table, column, e);
                return None;
            }
        };
        let data_type = match self.store.column_type(table, column) {
            Ok(data_type) => data_type.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read type of {}.{}: {:#}", table, column, e);
                DataType::Text
            }
        };
        Some((col, data_type))
    }

    fn finish(&self, result: &PushResult) {
        if let Err(e) = self.store.record_push(result.pushed) {
            error!("Failed to update sync status: {:#}", e);
        }
    }
}

/// New value of a change as a JSON scalar of the column's kind.
fn typed_value(entry: &ChangelogEntry, data_type: DataType) -> Value {
    match &entry.new_value {
        Some(text) => cast_value(&Value::String(text.clone()), data_type).to_json(),
        None => Value::Null,
    }
}
