//! Pulls remote edits into the local store.
//!
//! Each episode fetches pending remote changes, refreshes the header cache of
//! every sheet it touches, resolves columns through the schema resolver and
//! applies values under a last-modified-wins conflict policy. Applied and
//! conflicted changes are recorded in the audit trail and acknowledged to the
//! remote side.

use anyhow::{Context, Result};
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::headers::HeaderCache;
use crate::persistence::LocalStore;
use crate::rpc::RemoteRpc;
use crate::scheduler::ScheduledTask;
use crate::schema::SchemaResolver;
use crate::types::{
    AuditStatus, ChangeOutcome, ColumnHeader, PullResult, RemoteChange, ResolveAction, SyncMode,
};
use crate::value::cast_value;

/// Row of each sheet holding the column headers.
pub const DEFAULT_HEADER_ROW: i64 = 1;

/// Callback invoked for every realtime change before it is applied.
pub type ChangeObserver = Arc<dyn Fn(&RemoteChange) + Send + Sync>;

pub struct PullController {
    store: Arc<LocalStore>,
    rpc: Arc<dyn RemoteRpc>,
    resolver: Arc<dyn SchemaResolver>,
    header_row: i64,
    headers: Mutex<HeaderCache>,
    mode: Mutex<SyncMode>,
    task: Mutex<Option<ScheduledTask>>,
    observer: RwLock<Option<ChangeObserver>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl PullController {
    pub fn new(
        store: Arc<LocalStore>,
        rpc: Arc<dyn RemoteRpc>,
        resolver: Arc<dyn SchemaResolver>,
    ) -> Self {
        let mode = store
            .sync_status()
            .map(|status| status.sync_mode)
            .unwrap_or_default();
        Self {
            store,
            rpc,
            resolver,
            header_row: DEFAULT_HEADER_ROW,
            headers: Mutex::new(HeaderCache::new()),
            mode: Mutex::new(mode),
            task: Mutex::new(None),
            observer: RwLock::new(None),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_header_row(mut self, header_row: i64) -> Self {
        self.header_row = header_row;
        self
    }

    pub fn mode(&self) -> SyncMode {
        *lock(&self.mode)
    }

    pub fn is_scheduled(&self) -> bool {
        lock(&self.task).is_some()
    }

    /// Current cached headers of `sheet`.
    pub fn cached_headers(&self, sheet: &str) -> Vec<ColumnHeader> {
        lock(&self.headers).headers(sheet)
    }

    /// Register the callback fired for each realtime change.
    pub fn on_change<F>(&self, observer: F)
    where
        F: Fn(&RemoteChange) + Send + Sync + 'static,
    {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Switch sync mode.
    ///
    /// Periodic mode installs a task running [`sync`](Self::sync) every
    /// `interval`; any other mode removes a previously installed task. The new
    /// mode is announced to the remote side on a best-effort basis.
    pub async fn set_mode(self: &Arc<Self>, mode: SyncMode, interval: Duration) -> Result<()> {
        if mode == SyncMode::Periodic && interval.is_zero() {
            anyhow::bail!("Periodic sync needs a non-zero interval");
        }

        {
            let mut task = lock(&self.task);
            if let Some(previous) = task.take() {
                previous.cancel();
            }
            if mode == SyncMode::Periodic {
                let weak = Arc::downgrade(self);
                *task = Some(ScheduledTask::spawn("pull sync", interval, move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(controller) = weak.upgrade() {
                            controller.sync().await;
                        }
                    }
                    .boxed()
                }));
            }
            *lock(&self.mode) = mode;
        }

        self.store
            .set_sync_mode(mode)
            .context("Failed to persist sync mode")?;
        info!("Pull sync mode set to {}", mode);

        self.announce_mode(mode).await;
        Ok(())
    }

    async fn announce_mode(&self, mode: SyncMode) {
        if let Err(e) = self.rpc.set_sync_mode(mode).await {
            warn!("Failed to push sync mode {} to remote: {:#}", mode, e);
        }

        let target = match self.store.sync_status() {
            Ok(status) => status.remote_target,
            Err(e) => {
                warn!("Failed to read sync target: {:#}", e);
                None
            }
        };
        if let Some(url) = target {
            if let Err(e) = self.rpc.set_tunnel_url(&url).await {
                warn!("Failed to register sync target {}: {:#}", url, e);
            }
        }
    }

    /// Cancel the periodic task. The stored mode is left unchanged.
    pub fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
            info!("Stopped {}", task.name());
        }
    }

    /// Pull and apply every pending remote change.
    pub async fn sync(&self) -> PullResult {
        let _guard = self.in_flight.lock().await;

        let changes = match self.rpc.get_unsynced().await {
            Ok(changes) => changes,
            Err(e) => {
                error!("Failed to fetch pending remote changes: {:#}", e);
                return PullResult {
                    errors: vec![format!("Failed to fetch pending changes: {:#}", e)],
                    ..Default::default()
                };
            }
        };

        if changes.is_empty() {
            debug!("No pending remote changes");
            let mut result = PullResult::default();
            self.finish(&mut result);
            return result;
        }

        debug!("Fetched {} pending remote changes", changes.len());
        self.process(changes, false).await
    }

    /// Apply changes delivered by the remote side without a fetch.
    pub async fn receive_realtime_changes(&self, changes: Vec<RemoteChange>) -> PullResult {
        let _guard = self.in_flight.lock().await;
        debug!("Received {} realtime changes", changes.len());
        self.process(changes, true).await
    }

    async fn process(&self, changes: Vec<RemoteChange>, notify: bool) -> PullResult {
        let mut result = PullResult::default();
        let mut resolved = Vec::new();

        for (sheet, sheet_changes) in group_by_sheet(changes) {
            let refreshed = self.refresh_headers(&sheet).await;

            for change in sheet_changes {
                if notify {
                    self.notify(&change);
                }

                if let Err(e) = &refreshed {
                    result.errors.push(format!(
                        "Change {} skipped, headers of {} unavailable: {:#}",
                        change.id, sheet, e
                    ));
                    continue;
                }

                match self.apply_single_change(&sheet, &change).await {
                    Ok(outcome) => {
                        result.record(&outcome);
                        if outcome.applied || outcome.conflict {
                            resolved.push(change.id.clone());
                        }
                    }
                    Err(e) => {
                        warn!("Failed to apply change {}: {:#}", change.id, e);
                        result.errors.push(format!(
                            "Change {} ({} row {} col {}): {:#}",
                            change.id, change.sheet, change.row, change.col, e
                        ));
                    }
                }
            }

            if let Err(e) = refreshed {
                warn!("Failed to refresh headers for {}: {:#}", sheet, e);
            }
        }

        if !resolved.is_empty() {
            if let Err(e) = self.rpc.mark_synced(&resolved).await {
                error!("Failed to acknowledge {} changes: {:#}", resolved.len(), e);
                result
                    .errors
                    .push(format!("Failed to acknowledge changes: {:#}", e));
            }
        }

        self.finish(&mut result);
        info!(
            "Pull complete: {} applied, {} conflicts, {} new columns, {} renamed columns, {} errors",
            result.applied,
            result.conflicts,
            result.new_columns,
            result.renamed_columns,
            result.errors.len()
        );
        result
    }

    fn finish(&self, result: &mut PullResult) {
        if let Err(e) = self.store.record_pull(result.applied, result.conflicts) {
            error!("Failed to update sync status: {:#}", e);
            result
                .errors
                .push(format!("Failed to update sync status: {:#}", e));
        }
    }

    async fn refresh_headers(&self, sheet: &str) -> Result<()> {
        let headers = self
            .rpc
            .get_column_headers(sheet)
            .await
            .with_context(|| format!("Failed to fetch headers of {}", sheet))?;
        debug!("Refreshed {} headers for {}", headers.len(), sheet);
        lock(&self.headers).refresh(sheet, headers);
        Ok(())
    }

    fn notify(&self, change: &RemoteChange) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(change);
        }
    }

    /// Apply one remote change to the local store.
    pub async fn apply_single_change(
        &self,
        sheet: &str,
        change: &RemoteChange,
    ) -> Result<ChangeOutcome> {
        let header = lock(&self.headers)
            .get(sheet, change.col)
            .map(str::to_string);
        let Some(header) = header else {
            debug!("{} column {} has no header, skipping {}", sheet, change.col, change.id);
            return Ok(ChangeOutcome::default());
        };

        if change.row == self.header_row {
            let renamed = header_text(&change.new_value);
            debug!("{} column {} header '{}' -> '{}'", sheet, change.col, header, renamed);
            lock(&self.headers).patch(sheet, change.col, &renamed);
            self.store.log_remote_change(change, AuditStatus::Applied)?;
            return Ok(ChangeOutcome {
                applied: true,
                ..Default::default()
            });
        }

        let resolution = self
            .resolver
            .resolve_column(sheet, change.col, &header, &change.new_value)
            .await
            .with_context(|| format!("Failed to resolve column '{}'", header))?;
        let mut outcome = ChangeOutcome {
            new_column: resolution.action == ResolveAction::Created,
            renamed_column: resolution.action == ResolveAction::Renamed,
            ..Default::default()
        };

        let Some(table) = self.resolver.table_for_sheet(sheet)? else {
            debug!("Sheet {} is not mapped to a table, skipping {}", sheet, change.id);
            return Ok(outcome);
        };

        if self.store.ensure_row(&table, change.row)? {
            debug!("Created row {} in {}", change.row, table);
        }

        let local_modified = self.store.row_modified_at(&table, change.row)?;
        if local_modified.is_some_and(|local| local > change.timestamp) {
            warn!(
                "Conflict on {} row {}: local edit is newer than remote change {}",
                table, change.row, change.id
            );
            self.store.log_remote_change(change, AuditStatus::Conflict)?;
            outcome.conflict = true;
            return Ok(outcome);
        }

        let value = cast_value(&change.new_value, resolution.mapping.data_type);
        self.store.write_remote_value(
            &table,
            change.row,
            &resolution.mapping.local_column,
            &value,
            change.timestamp,
        )?;
        self.store.log_remote_change(change, AuditStatus::Applied)?;
        debug!(
            "Applied {} to {}.{} row {}",
            change.id, table, resolution.mapping.local_column, change.row
        );

        outcome.applied = true;
        Ok(outcome)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Group changes by sheet, keeping first-seen sheet order and change order.
fn group_by_sheet(changes: Vec<RemoteChange>) -> Vec<(String, Vec<RemoteChange>)> {
    let mut groups: Vec<(String, Vec<RemoteChange>)> = Vec::new();
    for change in changes {
        match groups.iter_mut().find(|(sheet, _)| *sheet == change.sheet) {
            Some((_, list)) => list.push(change),
            None => groups.push((change.sheet.clone(), vec![change])),
        }
    }
    groups
}

fn header_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
