use chrono::Utc;
use parking_lot::Mutex;
use relay_core::{RelayError, RelayResult, Task, TaskRecord, TaskState, Transition};
use relay_store::KvBackend;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INDEX_KEY: &str = "tasks:index";

fn record_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

fn history_key(task_id: &str) -> String {
    format!("task:{task_id}:history")
}

/// What happens when a task id is submitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Always reject with `DuplicateTaskId`.
    #[default]
    Reject,
    /// Replace a terminal record; still reject while the old one is live.
    Overwrite,
}

/// Owns every [`TaskRecord`] and enforces the lifecycle state machine.
///
/// Each record is one JSON document on the backend, so a reader sees either
/// the previous or the next version, never a mix. Writers for the same task
/// are serialized by a per-record async lock.
pub struct LifecycleTracker {
    backend: Arc<dyn KvBackend>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Ids of records not yet terminal.
    active: Mutex<HashSet<String>>,
    /// Queued records with no driver whose removal has not succeeded yet.
    orphaned: Mutex<HashSet<String>>,
    /// Serializes rewrites of the task index with appends to it.
    index_lock: tokio::sync::Mutex<()>,
    record_ttl: Option<Duration>,
}

impl LifecycleTracker {
    /// Tracker keeping records on `backend` forever.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            orphaned: Mutex::new(HashSet::new()),
            index_lock: tokio::sync::Mutex::new(()),
            record_ttl: None,
        }
    }

    /// Evict terminal records `ttl` after they finish.
    pub fn with_record_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.record_ttl = ttl;
        self
    }

    fn lock_for(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the map entry unless another caller holds a clone of `lock`.
    fn forget_lock(&self, task_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        if Arc::strong_count(lock) <= 2 {
            locks.remove(task_id);
        }
    }

    fn release(&self, task_id: &str) {
        self.locks.lock().remove(task_id);
        self.active.lock().remove(task_id);
    }

    async fn load(&self, task_id: &str) -> RelayResult<Option<TaskRecord>> {
        match self.backend.get(&record_key(task_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &TaskRecord) -> RelayResult<()> {
        let ttl = if record.is_terminal() {
            self.record_ttl
        } else {
            None
        };
        let value = serde_json::to_value(record)?;
        self.backend
            .set(&record_key(&record.task_id), value, ttl)
            .await
    }

    async fn push_history(&self, task_id: &str, state: TaskState) {
        if let Err(e) = self
            .backend
            .append_to_list(&history_key(task_id), serde_json::json!(state))
            .await
        {
            warn!(task_id, state = %state, error = %e, "Failed to append task history");
        }
    }

    /// Whether `task_id` may be used for a new task under `policy`.
    ///
    /// Returns the record that would be replaced, if any.
    pub async fn check_available(
        &self,
        task_id: &str,
        policy: DuplicatePolicy,
    ) -> RelayResult<Option<TaskRecord>> {
        match self.load(task_id).await? {
            Some(existing) if policy == DuplicatePolicy::Overwrite && existing.is_terminal() => {
                Ok(Some(existing))
            }
            Some(_) => Err(RelayError::DuplicateTaskId(task_id.to_string())),
            None => Ok(None),
        }
    }

    /// Create the Queued record for a newly accepted task.
    pub async fn create(&self, task: &Task, policy: DuplicatePolicy) -> RelayResult<TaskRecord> {
        let lock = self.lock_for(&task.id);
        let _guard = lock.lock().await;

        let replacing = self.check_available(&task.id, policy).await?;
        if let Some(existing) = &replacing {
            info!(task_id = %task.id, previous = %existing.state, "Overwriting finished task record");
        }

        self.backend.delete(&history_key(&task.id)).await?;
        if replacing.is_none() {
            let _index = self.index_lock.lock().await;
            self.backend
                .append_to_list(INDEX_KEY, serde_json::json!(task.id))
                .await?;
        }

        let record = TaskRecord::queued(task);
        self.save(&record).await?;
        self.push_history(&task.id, TaskState::Queued).await;
        self.active.lock().insert(task.id.clone());

        debug!(task_id = %task.id, agent = %task.agent_name, "Task queued");
        Ok(record)
    }

    /// Apply one state transition and persist the resulting record.
    pub async fn record_transition(
        &self,
        task_id: &str,
        transition: Transition,
    ) -> RelayResult<TaskRecord> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let mut record = self
            .load(task_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("task {task_id}")))?;
        record.apply(transition)?;
        self.save(&record).await?;
        self.push_history(task_id, record.state).await;

        if record.is_terminal() {
            self.release(task_id);
        }
        debug!(task_id, state = %record.state, "Task transitioned");
        Ok(record)
    }

    /// Current record; `NotFound` for unknown or evicted ids.
    pub async fn get_record(&self, task_id: &str) -> RelayResult<TaskRecord> {
        self.load(task_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("task {task_id}")))
    }

    /// States the task has passed through, oldest first.
    pub async fn history(&self, task_id: &str) -> RelayResult<Vec<TaskState>> {
        let values = self.backend.get_list(&history_key(task_id)).await?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(RelayError::from))
            .collect()
    }

    /// Remove a task that never left Queued. Returns `false` if it already started.
    pub async fn cancel_queued(&self, task_id: &str) -> RelayResult<bool> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let record = self
            .load(task_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("task {task_id}")))?;
        if record.state != TaskState::Queued {
            return Ok(false);
        }
        self.backend.delete(&record_key(task_id)).await?;
        self.backend.delete(&history_key(task_id)).await?;
        self.release(task_id);
        info!(task_id, "Queued task cancelled");
        Ok(true)
    }

    /// Drop a Queued record that no driver will ever start.
    ///
    /// When the backend refuses, the id is remembered and retried by
    /// [`retry_orphans`](Self::retry_orphans).
    pub async fn abandon(&self, task_id: &str) {
        match self.cancel_queued(task_id).await {
            Ok(_) | Err(RelayError::NotFound(_)) => {
                self.orphaned.lock().remove(task_id);
            }
            Err(e) => {
                warn!(task_id, error = %e, "Could not drop driverless task, will retry");
                self.orphaned.lock().insert(task_id.to_string());
            }
        }
    }

    /// Retry dropping records [`abandon`](Self::abandon) could not remove.
    /// Returns how many are still pending.
    pub async fn retry_orphans(&self) -> usize {
        let ids: Vec<String> = self.orphaned.lock().iter().cloned().collect();
        for id in ids {
            self.abandon(&id).await;
        }
        self.orphaned.lock().len()
    }

    /// Processing records whose `started_at` is older than `ceiling`.
    pub async fn stuck_tasks(&self, ceiling: Duration) -> RelayResult<Vec<TaskRecord>> {
        let ceiling = chrono::Duration::from_std(ceiling)
            .map_err(|e| RelayError::Config(format!("Watchdog ceiling out of range: {e}")))?;
        let now = Utc::now();
        let ids: Vec<String> = self.active.lock().iter().cloned().collect();

        let mut stuck = Vec::new();
        for id in ids {
            match self.load(&id).await? {
                Some(record) if record.state == TaskState::Processing => {
                    if record.started_at.is_some_and(|at| now - at > ceiling) {
                        stuck.push(record);
                    }
                }
                Some(record) if record.is_terminal() => self.release(&id),
                Some(_) => {}
                None => self.release(&id),
            }
        }
        Ok(stuck)
    }

    /// Rebuild the set of unfinished tasks from the backend's task index.
    ///
    /// Queued records left by an earlier process have no driver and are
    /// dropped; Processing ones are tracked so the watchdog can fail them.
    /// Returns how many Processing records were found.
    pub async fn recover(&self) -> RelayResult<usize> {
        let ids = self.backend.get_list(INDEX_KEY).await?;
        let mut found = 0;
        let mut dropped = 0;
        for id in ids.iter().filter_map(|v| v.as_str()) {
            if self.active.lock().contains(id) {
                continue;
            }
            match self.load(id).await? {
                Some(record) if record.state == TaskState::Queued => {
                    self.abandon(id).await;
                    dropped += 1;
                }
                Some(record) if !record.is_terminal() => {
                    self.active.lock().insert(id.to_string());
                    found += 1;
                }
                _ => {}
            }
        }
        if found > 0 || dropped > 0 {
            info!(processing = found, queued_dropped = dropped, "Recovered unfinished tasks");
        }
        Ok(found)
    }

    /// Delete the history and index entries of records that no longer exist,
    /// whether evicted by their TTL or cancelled while queued.
    /// Returns how many ids were pruned.
    pub async fn prune_evicted(&self) -> RelayResult<usize> {
        let _index = self.index_lock.lock().await;
        let ids = self.backend.get_list(INDEX_KEY).await?;

        let mut seen = HashSet::new();
        let mut keep = Vec::new();
        let mut pruned = 0;
        for id in ids.iter().filter_map(|v| v.as_str()) {
            if !seen.insert(id) {
                continue;
            }
            let lock = self.lock_for(id);
            // a writer holds it, so the record is in use
            let Ok(guard) = lock.try_lock() else {
                keep.push(id);
                continue;
            };
            let live = self.active.lock().contains(id);
            if live || self.load(id).await?.is_some() {
                keep.push(id);
            } else {
                self.backend.delete(&history_key(id)).await?;
                pruned += 1;
            }
            drop(guard);
            if !live {
                self.forget_lock(id, &lock);
            }
        }

        if keep.len() == ids.len() {
            return Ok(0);
        }
        self.backend.delete(INDEX_KEY).await?;
        for id in keep {
            self.backend
                .append_to_list(INDEX_KEY, serde_json::json!(id))
                .await?;
        }
        if pruned > 0 {
            debug!(count = pruned, "Pruned evicted task history");
        }
        Ok(pruned)
    }

    /// Reclaim storage: drop expired backend keys, then prune what evicted
    /// records left behind. Returns the number of keys and ids removed.
    pub async fn reclaim(&self) -> RelayResult<usize> {
        let purged = self.backend.reclaim().await?;
        let pruned = self.prune_evicted().await?;
        Ok(purged + pruned)
    }

    /// Number of tasks not yet terminal.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl std::fmt::Debug for LifecycleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleTracker")
            .field("active", &self.active_count())
            .field("record_ttl", &self.record_ttl)
            .finish_non_exhaustive()
    }
}
