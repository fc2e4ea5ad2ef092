use crate::config::RelayConfig;
use crate::monitor::{AgentMonitor, AgentState};
use crate::registry::{AgentDescriptor, WorkerRegistry};
use crate::retry::{RetryExecutor, RetryObserver, TracingObserver};
use crate::slots::{Admission, SlotGuard, SlotPool};
use crate::tracker::LifecycleTracker;
use crate::watchdog::Watchdog;
use relay_core::{
    RelayError, RelayResult, Task, TaskError, TaskErrorKind, TaskRecord, TaskState, Transition,
};
use relay_store::{ContextStore, KvBackend};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A unit of work handed to [`Coordinator::submit`] or [`Coordinator::spawn`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Registered agent that should run the task.
    pub agent_name: String,
    /// Opaque input handed to the agent's handler.
    pub payload: serde_json::Value,
    /// Generated as `{agent}-{counter}-{random}` when absent.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Free-form data copied onto the task.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubmitRequest {
    /// Request for `agent_name` with a generated task id.
    pub fn new(agent_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            agent_name: agent_name.into(),
            payload,
            ..Default::default()
        }
    }

    /// Use an explicit task id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Load of one agent as reported by [`Coordinator::list_agents`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLoad {
    /// Agent name.
    pub name: String,
    /// Tasks holding a slot right now.
    pub current_load: usize,
    /// Slot count.
    pub max_concurrency: usize,
    /// Tasks waiting for a slot.
    pub queued: usize,
}

/// Handle to an admitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    cancel: CancellationToken,
    join: JoinHandle<RelayResult<TaskRecord>>,
}

impl TaskHandle {
    /// Id of the admitted task.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Request cancellation. A queued task is removed; a running one fails
    /// with `cancelled` before its next attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal record.
    pub async fn wait(self) -> RelayResult<TaskRecord> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RelayError::TrackingFailure {
                task_id: self.task_id,
                message: format!("task driver aborted: {e}"),
                result: None,
            }),
        }
    }
}

/// Builds a [`Coordinator`].
pub struct CoordinatorBuilder {
    registry: WorkerRegistry,
    backend: Arc<dyn KvBackend>,
    config: RelayConfig,
    observer: Arc<dyn RetryObserver>,
}

impl CoordinatorBuilder {
    /// Replace the default configuration.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive retry events instead of the default tracing observer.
    pub fn observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Create the slot pools and tracker and assemble the coordinator.
    pub fn build(self) -> Coordinator {
        let names = self.registry.names();
        let slots = self
            .registry
            .descriptors()
            .iter()
            .map(|d| (d.name.clone(), SlotPool::new(d.max_concurrency)))
            .collect();
        let tracker = LifecycleTracker::new(self.backend.clone())
            .with_record_ttl(self.config.coordinator.record_ttl());

        Coordinator {
            inner: Arc::new(Inner {
                registry: self.registry,
                context: ContextStore::new(self.backend),
                tracker: Arc::new(tracker),
                monitor: AgentMonitor::new(names),
                slots,
                config: self.config,
                observer: self.observer,
                seq: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                watchdog: parking_lot::Mutex::new(None),
            }),
        }
    }
}

struct Inner {
    registry: WorkerRegistry,
    context: ContextStore,
    tracker: Arc<LifecycleTracker>,
    monitor: AgentMonitor,
    slots: HashMap<String, Arc<SlotPool>>,
    config: RelayConfig,
    observer: Arc<dyn RetryObserver>,
    seq: AtomicU64,
    shutdown: CancellationToken,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Routes tasks to registered agents under their concurrency limits, drives
/// retries, and records every lifecycle transition.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Builder with default configuration and a tracing observer.
    pub fn builder(registry: WorkerRegistry, backend: Arc<dyn KvBackend>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            registry,
            backend,
            config: RelayConfig::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Shorthand for `builder(..).config(config).build()`.
    pub fn new(registry: WorkerRegistry, backend: Arc<dyn KvBackend>, config: RelayConfig) -> Self {
        Self::builder(registry, backend).config(config).build()
    }

    /// Recover unfinished records and start the watchdog if enabled.
    pub async fn start(&self) -> RelayResult<()> {
        self.inner.tracker.recover().await?;
        let wd = &self.inner.config.watchdog;
        if wd.enabled {
            let stuck_after = wd.stuck_after(self.inner.config.coordinator.task_timeout());
            let handle = Watchdog::new(self.inner.tracker.clone(), wd.interval(), stuck_after)
                .with_reclaim_interval(wd.reclaim_interval())
                .spawn(self.inner.shutdown.child_token());
            if let Some(old) = self.inner.watchdog.lock().replace(handle) {
                old.abort();
            }
            info!(
                interval_ms = wd.interval_ms,
                stuck_after_secs = stuck_after.as_secs(),
                "Watchdog started"
            );
        }
        Ok(())
    }

    /// Submit and wait for the terminal record.
    ///
    /// A Failed record is still `Ok`; use [`TaskRecord::into_result`] to turn
    /// it into an error.
    pub async fn submit(&self, request: SubmitRequest) -> RelayResult<TaskRecord> {
        self.spawn(request).await?.wait().await
    }

    /// Admit a task and return immediately.
    ///
    /// Fails without creating a record when the agent is unknown, the id is
    /// taken, or the agent's waiting line is full. A taken id is reported as
    /// `DuplicateTaskId` even when the line is also full.
    pub async fn spawn(&self, request: SubmitRequest) -> RelayResult<TaskHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RelayError::Cancelled("coordinator is shut down".into()));
        }
        let descriptor = self.inner.registry.resolve(&request.agent_name)?;
        let pool = self
            .inner
            .slots
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| RelayError::AgentNotFound(descriptor.name.clone()))?;

        let task_id = request.task_id.unwrap_or_else(|| {
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
            Task::generate_id(&descriptor.name, seq)
        });

        let policy = self.inner.config.coordinator.duplicate_policy;
        self.inner.tracker.check_available(&task_id, policy).await?;

        let admission = pool
            .admit(self.inner.config.coordinator.queue_limit())
            .map_err(|queued| {
                warn!(task_id = %task_id, agent = %descriptor.name, queued, "Rejected by backpressure");
                RelayError::Backpressure {
                    agent: descriptor.name.clone(),
                    queued,
                }
            })?;

        let task = Task::new(task_id.clone(), descriptor.name.clone(), request.payload)
            .with_metadata(request.metadata);
        self.inner.tracker.create(&task, policy).await?;
        info!(task_id = %task_id, agent = %descriptor.name, "Task submitted");

        let cancel = self.inner.shutdown.child_token();
        let this = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { this.drive(task, descriptor, admission, token).await });

        Ok(TaskHandle {
            task_id,
            cancel,
            join,
        })
    }

    async fn drive(
        self,
        task: Task,
        descriptor: Arc<AgentDescriptor>,
        admission: Admission,
        cancel: CancellationToken,
    ) -> RelayResult<TaskRecord> {
        let slot: SlotGuard = match admission {
            Admission::Ready(guard) => guard,
            Admission::Waiting(rx) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.abandon_queued(&task.id).await,
                    handed = rx => match handed {
                        Ok(guard) => guard,
                        Err(_) => return self.abandon_queued(&task.id).await,
                    },
                }
            }
        };
        if cancel.is_cancelled() {
            drop(slot);
            return self.abandon_queued(&task.id).await;
        }

        if let Err(e) = self.persist(&task.id, Transition::Start).await {
            error!(task_id = %task.id, error = %e, "Could not record task start");
            drop(slot);
            self.inner.tracker.abandon(&task.id).await;
            return Err(RelayError::TrackingFailure {
                task_id: task.id,
                message: e.to_string(),
                result: None,
            });
        }
        self.inner.monitor.start_task(&descriptor.name, &task.id).await;
        let started = Instant::now();

        let policy = descriptor.retry.unwrap_or(self.inner.config.retry);
        let executor = RetryExecutor::new(policy).with_observer(self.inner.observer.clone());
        let attempts = AtomicU32::new(0);
        let context = &self.inner.context;
        let handler = &descriptor.handler;
        let task_ref = &task;
        let attempts_ref = &attempts;
        let run = executor.run(&task.id, &cancel, |attempt| {
            attempts_ref.store(attempt, Ordering::Relaxed);
            handler.execute(task_ref, context)
        });

        let timeout = self.inner.config.coordinator.task_timeout();
        let transition = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(done)) => Transition::Complete {
                result: done.value,
                attempts: done.attempts,
            },
            Ok(Err(terminal)) => Transition::Fail(terminal.to_task_error()),
            Err(_) => Transition::Fail(TaskError::new(
                TaskErrorKind::TimedOut,
                format!("exceeded the {}s processing ceiling", timeout.as_secs()),
                attempts.load(Ordering::Relaxed),
            )),
        };

        let succeeded = matches!(transition, Transition::Complete { .. });
        let attempts_made = match &transition {
            Transition::Complete { attempts, .. } => *attempts,
            Transition::Fail(error) => error.attempts,
            Transition::Start => 0,
        };
        let unrecorded = match &transition {
            Transition::Complete { result, .. } => Some(result.clone()),
            _ => None,
        };

        let outcome = self.persist(&task.id, transition).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.inner
            .monitor
            .finish_task(&descriptor.name, succeeded, attempts_made, elapsed_ms)
            .await;
        drop(slot);

        match outcome {
            Ok(record) => {
                info!(
                    task_id = %task.id,
                    agent = %descriptor.name,
                    state = %record.state,
                    attempts = attempts_made,
                    duration_ms = elapsed_ms,
                    "Task finished"
                );
                Ok(record)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Could not record task outcome");
                Err(RelayError::TrackingFailure {
                    task_id: task.id,
                    message: e.to_string(),
                    result: unrecorded,
                })
            }
        }
    }

    async fn abandon_queued(&self, task_id: &str) -> RelayResult<TaskRecord> {
        self.inner.tracker.abandon(task_id).await;
        Err(RelayError::Cancelled(task_id.to_string()))
    }

    /// Record a transition, retrying while the store is unavailable.
    async fn persist(&self, task_id: &str, transition: Transition) -> RelayResult<TaskRecord> {
        let cfg = &self.inner.config.coordinator;
        let target = transition.target();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .inner
                .tracker
                .record_transition(task_id, transition.clone())
                .await
            {
                Ok(record) => return Ok(record),
                // finalized elsewhere, or an earlier write landed after reporting failure
                Err(RelayError::InvalidTransition { from, .. })
                    if from.is_terminal() || (attempt > 1 && from == target) =>
                {
                    warn!(task_id, state = %from, "Task outcome already recorded");
                    return self.inner.tracker.get_record(task_id).await;
                }
                Err(e) if e.is_transient() && attempt <= cfg.tracking_retries => {
                    let delay = cfg.tracking_retry_delay().saturating_mul(attempt);
                    warn!(
                        task_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Bookkeeping write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current record of `task_id`; `NotFound` for unknown or evicted ids.
    pub async fn get_status(&self, task_id: &str) -> RelayResult<TaskRecord> {
        self.inner.tracker.get_record(task_id).await
    }

    /// States `task_id` has passed through, oldest first.
    pub async fn history(&self, task_id: &str) -> RelayResult<Vec<TaskState>> {
        self.inner.tracker.history(task_id).await
    }

    /// `NotFound` when the key is absent or expired.
    pub async fn get_context(&self, key: &str) -> RelayResult<serde_json::Value> {
        self.inner
            .context
            .get(key)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("context key {key}")))
    }

    /// Write a shared context value, expiring after `ttl` when given.
    pub async fn set_context(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> RelayResult<()> {
        self.inner.context.set(key, value, ttl).await
    }

    /// `NotFound` when the key does not exist.
    pub async fn delete_context(&self, key: &str) -> RelayResult<()> {
        if self.inner.context.delete(key).await? {
            Ok(())
        } else {
            Err(RelayError::NotFound(format!("context key {key}")))
        }
    }

    /// Current load of every agent, sorted by name.
    pub fn list_agents(&self) -> Vec<AgentLoad> {
        self.inner
            .registry
            .descriptors()
            .iter()
            .map(|d| {
                let pool = self.inner.slots.get(&d.name);
                AgentLoad {
                    name: d.name.clone(),
                    current_load: pool.map_or(0, |p| p.in_use()),
                    max_concurrency: d.max_concurrency,
                    queued: pool.map_or(0, |p| p.queued()),
                }
            })
            .collect()
    }

    /// Monitor state and metrics of one agent.
    pub async fn agent_stats(&self, name: &str) -> RelayResult<AgentState> {
        self.inner
            .monitor
            .get_state(name)
            .await
            .ok_or_else(|| RelayError::AgentNotFound(name.to_string()))
    }

    /// Agent states plus aggregate metrics as JSON.
    pub async fn stats_json(&self) -> serde_json::Value {
        self.inner.monitor.to_json().await
    }

    /// Context handle shared with the handlers.
    pub fn context(&self) -> &ContextStore {
        &self.inner.context
    }

    /// Effective configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Tasks not yet terminal.
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.active_count()
    }

    /// Cancel every outstanding task and stop the watchdog.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.watchdog.lock().take() {
            handle.abort();
        }
        info!("Coordinator shut down");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("agents", &self.inner.registry.names())
            .field("active_tasks", &self.active_tasks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::handler_fn;
    use relay_store::InMemoryBackend;
    use serde_json::json;

    fn coordinator() -> Coordinator {
        let mut builder = WorkerRegistry::builder();
        builder
            .register(AgentDescriptor::new(
                "echo",
                2,
                handler_fn(|task: Task, _ctx| async move { Ok(task.payload) }),
            ))
            .unwrap();
        Coordinator::new(
            builder.freeze(),
            Arc::new(InMemoryBackend::new()),
            RelayConfig::default(),
        )
    }

    #[test]
    fn test_submit_request_builder() {
        let req = SubmitRequest::new("echo", json!(1))
            .with_task_id("t")
            .with_metadata("priority", json!("high"));
        assert_eq!(req.task_id.as_deref(), Some("t"));
        assert_eq!(req.metadata["priority"], json!("high"));
    }

    #[tokio::test]
    async fn test_submit_echo() {
        let coord = coordinator();
        let record = coord
            .submit(SubmitRequest::new("echo", json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.result, Some(json!({"n": 1})));
        assert_eq!(record.attempts, 1);
        assert!(record.task_id.starts_with("echo-0-"));
        assert_eq!(coord.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let coord = coordinator();
        let a = coord.submit(SubmitRequest::new("echo", json!(1))).await.unwrap();
        let b = coord.submit(SubmitRequest::new("echo", json!(2))).await.unwrap();
        assert_ne!(a.task_id, b.task_id);
        assert!(b.task_id.starts_with("echo-1-"));
    }

    #[tokio::test]
    async fn test_context_operations() {
        let coord = coordinator();
        coord.set_context("k", json!("v"), None).await.unwrap();
        assert_eq!(coord.get_context("k").await.unwrap(), json!("v"));
        coord.delete_context("k").await.unwrap();
        assert!(matches!(
            coord.get_context("k").await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            coord.delete_context("k").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_agents_and_stats() {
        let coord = coordinator();
        coord.submit(SubmitRequest::new("echo", json!(1))).await.unwrap();
        assert_eq!(
            coord.list_agents(),
            vec![AgentLoad {
                name: "echo".into(),
                current_load: 0,
                max_concurrency: 2,
                queued: 0,
            }]
        );
        assert_eq!(coord.agent_stats("echo").await.unwrap().metrics.completed, 1);
        assert!(coord.agent_stats("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let coord = coordinator();
        coord.start().await.unwrap();
        coord.shutdown();
        assert!(matches!(
            coord.submit(SubmitRequest::new("echo", json!(1))).await,
            Err(RelayError::Cancelled(_))
        ));
    }
}
