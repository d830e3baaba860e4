use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Work run on every scheduler tick. Implementors log their own failures;
/// a failed tick is simply retried on the next one.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self);
}

/// Spawns the periodic loop. Returns the cancellation token that stops it
/// together with the task handle.
pub fn spawn_scheduler<T: PeriodicTask>(
    task: Arc<T>,
    tick_interval: Duration,
    parent: &CancellationToken,
) -> (CancellationToken, JoinHandle<()>) {
    let cancel = parent.child_token();
    let cancel_clone = cancel.clone();

    let handle = tokio::spawn(async move {
        run_scheduler_loop(task, tick_interval, cancel_clone).await;
    });

    (cancel, handle)
}

async fn run_scheduler_loop<T: PeriodicTask>(
    task: Arc<T>,
    tick_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        task = task.name(),
        interval_ms = tick_interval.as_millis() as u64,
        "Scheduler started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = task.name(), "Scheduler shutting down");
                break;
            }
            _ = ticker.tick() => {
                debug!(task = task.name(), "Scheduler tick");
                task.tick().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl PeriodicTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_scheduler_ticks_until_cancelled() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let parent = CancellationToken::new();
        let (_cancel, handle) =
            spawn_scheduler(counter.clone(), Duration::from_millis(10), &parent);

        tokio::time::sleep(Duration::from_millis(60)).await;
        parent.cancel();
        handle.await.unwrap();

        let ticks = counter.0.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected several ticks, got {ticks}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), ticks);
    }
}
