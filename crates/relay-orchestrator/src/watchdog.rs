use crate::tracker::LifecycleTracker;
use relay_core::{RelayError, RelayResult, TaskError, TaskErrorKind, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Forces tasks stuck in Processing past a ceiling to Failed (`timed_out`)
/// and periodically reclaims bookkeeping storage.
///
/// Covers tasks whose driver died without recording an outcome, e.g. after a
/// panic or a restart over a durable backend.
pub struct Watchdog {
    tracker: Arc<LifecycleTracker>,
    interval: Duration,
    stuck_after: Duration,
    reclaim_interval: Duration,
}

impl Watchdog {
    /// Sweep `tracker` every `interval` for tasks processing longer than `stuck_after`.
    pub fn new(tracker: Arc<LifecycleTracker>, interval: Duration, stuck_after: Duration) -> Self {
        Self {
            tracker,
            interval,
            stuck_after,
            reclaim_interval: interval,
        }
    }

    /// Run [`LifecycleTracker::reclaim`] every `every` instead of every sweep.
    pub fn with_reclaim_interval(mut self, every: Duration) -> Self {
        self.reclaim_interval = every;
        self
    }

    /// One pass. Returns the ids that were forced to Failed.
    ///
    /// Queued records whose removal failed earlier are retried first.
    pub async fn sweep(&self) -> RelayResult<Vec<String>> {
        let pending = self.tracker.retry_orphans().await;
        if pending > 0 {
            debug!(pending, "Driverless tasks still awaiting removal");
        }

        let mut forced = Vec::new();
        for record in self.tracker.stuck_tasks(self.stuck_after).await? {
            // attempts are only recorded with the outcome
            let error = TaskError::new(
                TaskErrorKind::TimedOut,
                format!(
                    "no outcome recorded within {}s of starting; attempt count unknown",
                    self.stuck_after.as_secs()
                ),
                0,
            );
            match self
                .tracker
                .record_transition(&record.task_id, Transition::Fail(error))
                .await
            {
                Ok(_) => {
                    warn!(task_id = %record.task_id, agent = %record.agent_name, "Watchdog forced stuck task to failed");
                    forced.push(record.task_id);
                }
                // finished between the scan and the write
                Err(RelayError::InvalidTransition { .. }) | Err(RelayError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(forced)
    }

    /// Sweep every `interval` and reclaim storage every reclaim interval
    /// until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut reclaim = tokio::time::interval(self.reclaim_interval);
            reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Watchdog sweep failed");
                        }
                    }
                    _ = reclaim.tick() => {
                        match self.tracker.reclaim().await {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "Reclaimed bookkeeping storage"),
                            Err(e) => warn!(error = %e, "Storage reclaim failed"),
                        }
                    }
                }
            }
            debug!("Watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::DuplicatePolicy;
    use relay_core::{Task, TaskState};
    use relay_store::{InMemoryBackend, KvBackend};
    use serde_json::json;

    async fn processing(tracker: &LifecycleTracker, id: &str) {
        tracker
            .create(&Task::new(id, "coder", json!(null)), DuplicatePolicy::Reject)
            .await
            .unwrap();
        tracker.record_transition(id, Transition::Start).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_forces_stuck_task() {
        let tracker = Arc::new(LifecycleTracker::new(Arc::new(InMemoryBackend::new())));
        processing(&tracker, "stuck").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let watchdog = Watchdog::new(tracker.clone(), Duration::from_secs(1), Duration::from_millis(10));
        assert_eq!(watchdog.sweep().await.unwrap(), vec!["stuck".to_string()]);

        let record = tracker.get_record("stuck").await.unwrap();
        assert_eq!(record.state, TaskState::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::TimedOut);
        assert!(error.message.contains("attempt count unknown"));
        assert!(watchdog.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_task_left_alone() {
        let tracker = Arc::new(LifecycleTracker::new(Arc::new(InMemoryBackend::new())));
        processing(&tracker, "fresh").await;
        let watchdog = Watchdog::new(tracker.clone(), Duration::from_secs(1), Duration::from_secs(60));
        assert!(watchdog.sweep().await.unwrap().is_empty());
        assert_eq!(
            tracker.get_record("fresh").await.unwrap().state,
            TaskState::Processing
        );
    }

    #[tokio::test]
    async fn test_spawned_loop_reclaims_evicted_history() {
        let backend: Arc<dyn KvBackend> = Arc::new(InMemoryBackend::new());
        let tracker = Arc::new(
            LifecycleTracker::new(backend.clone()).with_record_ttl(Some(Duration::from_millis(10))),
        );
        processing(&tracker, "done").await;
        tracker
            .record_transition(
                "done",
                Transition::Complete {
                    result: json!(1),
                    attempts: 1,
                },
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = Watchdog::new(tracker.clone(), Duration::from_secs(60), Duration::from_secs(60))
            .with_reclaim_interval(Duration::from_millis(10))
            .spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(tracker.history("done").await.unwrap().is_empty());
        assert!(backend.get_list("tasks:index").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let tracker = Arc::new(LifecycleTracker::new(Arc::new(InMemoryBackend::new())));
        processing(&tracker, "orphan").await;

        let shutdown = CancellationToken::new();
        let handle = Watchdog::new(tracker.clone(), Duration::from_millis(10), Duration::from_millis(5))
            .spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            tracker.get_record("orphan").await.unwrap().state,
            TaskState::Failed
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
