//! Push-then-pull coordination and sync mode scheduling.
use anyhow::Result;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::config::SyncSettings;
use crate::persistence::LocalStore;
use crate::pull::{lock, PullController};
use crate::push::SheetPusher;
use crate::rpc::RemoteRpc;
use crate::scheduler::ScheduledTask;
use crate::schema::SchemaResolver;
use crate::tracker::ChangeTracker;
use crate::types::{BidirectionalResult, PullResult, RemoteChange, SyncMode, SyncStatus};

/// Entry point of the sync engine.
///
/// Owns a pull controller, a pusher and a change tracker over one local store.
/// Every collaborator is injected, so several engines can share a process.
pub struct BidirectionalSync {
    store: Arc<LocalStore>,
    pull: Arc<PullController>,
    pusher: SheetPusher,
    tracker: ChangeTracker,
    task: Mutex<Option<ScheduledTask>>,
}

impl BidirectionalSync {
    pub fn new(
        store: Arc<LocalStore>,
        rpc: Arc<dyn RemoteRpc>,
        resolver: Arc<dyn SchemaResolver>,
    ) -> Self {
        Self::with_settings(store, rpc, resolver, &SyncSettings::default())
    }

    pub fn with_settings(
        store: Arc<LocalStore>,
        rpc: Arc<dyn RemoteRpc>,
        resolver: Arc<dyn SchemaResolver>,
        settings: &SyncSettings,
    ) -> Self {
        let pull = PullController::new(store.clone(), rpc.clone(), resolver.clone())
            .with_header_row(settings.header_row);
        let pusher = SheetPusher::new(store.clone(), rpc, resolver)
            .with_batch_limit(settings.push_batch_limit);

        Self {
            tracker: ChangeTracker::new(store.clone()),
            store,
            pull: Arc::new(pull),
            pusher,
            task: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn pull(&self) -> &Arc<PullController> {
        &self.pull
    }

    pub fn pusher(&self) -> &SheetPusher {
        &self.pusher
    }

    pub fn mode(&self) -> SyncMode {
        self.pull.mode()
    }

    pub fn is_scheduled(&self) -> bool {
        lock(&self.task).is_some()
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.store.sync_status()
    }

    /// Switch sync mode on the pull side and, in periodic mode, also schedule
    /// a bidirectional cycle every `interval`.
    pub async fn set_mode(self: &Arc<Self>, mode: SyncMode, interval: Duration) -> Result<()> {
        self.pull.set_mode(mode, interval).await?;

        let mut task = lock(&self.task);
        if let Some(previous) = task.take() {
            previous.cancel();
        }
        if mode == SyncMode::Periodic {
            let weak = Arc::downgrade(self);
            *task = Some(ScheduledTask::spawn("bidirectional sync", interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(sync) = weak.upgrade() {
                        sync.sync_bidirectional().await;
                    }
                }
                .boxed()
            }));
        }
        Ok(())
    }

    /// Push local changes, then pull remote ones. Both halves always run.
    pub async fn sync_bidirectional(&self) -> BidirectionalResult {
        let push = self.pusher.push_to_sheet().await;
        let pull = self.pull.sync().await;
        info!(
            "Bidirectional sync complete: {} pushed, {} failed, {} applied, {} conflicts",
            push.pushed, push.failed, pull.applied, pull.conflicts
        );
        BidirectionalResult { push, pull }
    }

    pub async fn receive_realtime_changes(&self, changes: Vec<RemoteChange>) -> PullResult {
        self.pull.receive_realtime_changes(changes).await
    }

    /// Start capturing local edits to `table`. Returns how many columns of
    /// the table are tracked afterwards.
    pub fn setup_change_tracking(&self, table: &str) -> Result<usize> {
        self.tracker.install_tracking(table)
    }

    /// Cancel every scheduled task. The stored mode is kept.
    pub fn stop(&self) {
        self.pull.stop();
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
            info!("Stopped {}", task.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{items_fixture, remote_change, MockRpc};
    use crate::types::{DataType, PushResult};
    use crate::value::CellValue;
    use serde_json::json;

    fn engine() -> (Arc<BidirectionalSync>, Arc<LocalStore>, Arc<MockRpc>) {
        let (store, rpc, resolver) = items_fixture();
        let sync = Arc::new(BidirectionalSync::new(store.clone(), rpc.clone(), resolver));
        (sync, store, rpc)
    }

    #[tokio::test]
    async fn pushes_before_pulling() {
        let (sync, store, rpc) = engine();
        sync.setup_change_tracking("items").unwrap();
        store.ensure_row("items", 2).unwrap();
        sync.tracker()
            .update_cell("items", 2, "name", &CellValue::from("Local"))
            .unwrap();
        rpc.queue(vec![remote_change(
            "r1",
            "Sheet1",
            3,
            2,
            json!("12"),
            "2024-01-01T00:00:00Z",
        )]);

        let result = sync.sync_bidirectional().await;

        assert_eq!(result.push, PushResult { pushed: 1, failed: 0 });
        assert_eq!(result.pull.applied, 1);
        let calls = rpc.calls();
        let pushed_at = calls.iter().position(|c| c == "batchUpdateCells").unwrap();
        let fetched_at = calls.iter().position(|c| c == "getUnsynced").unwrap();
        assert!(pushed_at < fetched_at);
        assert_eq!(store.read_cell("items", 3, "amount").unwrap().as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn newer_local_edit_wins_and_still_goes_out() {
        let (sync, store, rpc) = engine();
        sync.setup_change_tracking("items").unwrap();
        store.ensure_row("items", 2).unwrap();
        sync.tracker()
            .update_cell("items", 2, "amount", &CellValue::Int(7))
            .unwrap();
        rpc.queue(vec![remote_change(
            "r1",
            "Sheet1",
            2,
            2,
            json!("99"),
            "2020-01-01T00:00:00Z",
        )]);

        let result = sync.sync_bidirectional().await;

        assert_eq!(result.push.pushed, 1);
        assert_eq!(result.pull.conflicts, 1);
        assert_eq!(store.read_cell("items", 2, "amount").unwrap().as_deref(), Some("7"));
        assert_eq!(rpc.acknowledged(), vec!["r1".to_string()]);
        assert_eq!(sync.status().unwrap().total_conflicts, 1);
    }

    #[tokio::test]
    async fn pull_runs_even_when_push_fails() {
        let (sync, store, rpc) = engine();
        sync.setup_change_tracking("items").unwrap();
        store.ensure_row("items", 2).unwrap();
        sync.tracker()
            .update_cell("items", 2, "name", &CellValue::from("x"))
            .unwrap();
        rpc.fail("batchUpdateCells");
        rpc.queue(vec![remote_change(
            "r1",
            "Sheet1",
            4,
            1,
            json!("Remote"),
            "2024-01-01T00:00:00Z",
        )]);

        let result = sync.sync_bidirectional().await;

        assert_eq!(result.push.failed, 1);
        assert_eq!(result.pull.applied, 1);
        assert_eq!(sync.tracker().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn tracking_setup_reports_all_tracked_columns() {
        let (sync, store, _rpc) = engine();

        assert_eq!(sync.setup_change_tracking("items").unwrap(), 2);
        assert_eq!(sync.setup_change_tracking("items").unwrap(), 2);

        store
            .create_data_table("notes", &[("body", DataType::Text)])
            .unwrap();
        assert_eq!(sync.setup_change_tracking("notes").unwrap(), 1);
    }

    #[tokio::test]
    async fn realtime_changes_go_to_the_pull_side() {
        let (sync, store, rpc) = engine();

        let result = sync
            .receive_realtime_changes(vec![remote_change(
                "r1",
                "Sheet1",
                2,
                1,
                json!("Pushed"),
                "2024-01-01T00:00:00Z",
            )])
            .await;

        assert_eq!(result.applied, 1);
        assert_eq!(rpc.call_count("getUnsynced"), 0);
        assert_eq!(store.read_cell("items", 2, "name").unwrap().as_deref(), Some("Pushed"));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_mode_runs_both_cycles_until_stopped() {
        let (sync, _store, rpc) = engine();

        sync.set_mode(SyncMode::Periodic, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(sync.is_scheduled());
        assert!(sync.pull().is_scheduled());

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        // One fetch from the pull task, one from the bidirectional task.
        assert_eq!(rpc.call_count("getUnsynced"), 2);

        sync.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rpc.call_count("getUnsynced"), 2);
        assert!(!sync.is_scheduled());
        assert_eq!(sync.mode(), SyncMode::Periodic);
        assert_eq!(sync.status().unwrap().sync_mode, SyncMode::Periodic);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_mode_schedules_nothing() {
        let (sync, _store, rpc) = engine();

        sync.set_mode(SyncMode::Periodic, Duration::from_secs(5))
            .await
            .unwrap();
        sync.set_mode(SyncMode::Realtime, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!sync.is_scheduled());
        assert!(!sync.pull().is_scheduled());
        assert_eq!(rpc.call_count("getUnsynced"), 0);
        assert_eq!(rpc.call_count("setSyncMode"), 2);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (sync, _store, _rpc) = engine();
        assert!(sync.set_mode(SyncMode::Periodic, Duration::ZERO).await.is_err());
        assert!(!sync.is_scheduled());
    }
}
