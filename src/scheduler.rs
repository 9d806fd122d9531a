//! Cancellable recurring tasks.
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// A recurring job on the tokio runtime.
///
/// Cancelling (or dropping) stops future ticks. A run already in progress is
/// allowed to finish.
pub struct ScheduledTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `job` every `period`, starting one period from now.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, job: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_name = name.clone();

        info!("Scheduling {} every {:?}", name, period);
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
                debug!("Running scheduled {}", task_name);
                job().await;
            }
            debug!("Scheduled {} stopped", task_name);
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop future ticks.
    pub fn cancel(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_task(counter: Arc<AtomicUsize>, period: Duration) -> ScheduledTask {
        ScheduledTask::spawn("counter", period, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_waits_one_period() {
        let counter = Arc::new(AtomicUsize::new(0));
        let _task = counting_task(counter.clone(), Duration::from_secs(5));

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(counter.clone(), Duration::from_secs(1));

        time::sleep(Duration::from_millis(2_500)).await;
        task.cancel();
        let seen = counter.load(Ordering::SeqCst);
        assert_eq!(seen, 2);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counting_task(counter.clone(), Duration::from_secs(1)));

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
