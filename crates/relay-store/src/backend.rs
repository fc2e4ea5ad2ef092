use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Storage contract consumed by the context store and the lifecycle tracker.
///
/// Implementations must make every single-key operation atomic and must
/// report an unreachable backend as [`RelayError::StoreUnavailable`], never
/// as an absent key.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a scalar value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> RelayResult<Option<serde_json::Value>>;

    /// Write a scalar value, replacing whatever the key held.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> RelayResult<()>;

    /// Remove a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> RelayResult<bool>;

    /// Whether a live key exists.
    async fn exists(&self, key: &str) -> RelayResult<bool>;

    /// Append to the list at `key`, creating it if absent. Returns the new length.
    async fn append_to_list(&self, key: &str, value: serde_json::Value) -> RelayResult<usize>;

    /// All values of the list at `key`, in insertion order. Absent keys yield an empty list.
    async fn get_list(&self, key: &str) -> RelayResult<Vec<serde_json::Value>>;

    /// Drop every key.
    async fn clear(&self) -> RelayResult<()>;

    /// Release storage held by expired keys. Returns how many were dropped.
    ///
    /// Backends that expire keys eagerly can keep the default.
    async fn reclaim(&self) -> RelayResult<usize> {
        Ok(0)
    }
}

/// What a key holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StoredValue {
    /// A single JSON value.
    Scalar(serde_json::Value),
    /// An append-only list.
    List(Vec<serde_json::Value>),
}

/// A stored value with its optional wall-clock expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Stored data.
    pub value: StoredValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// A scalar entry expiring `ttl` from now.
    pub fn scalar(value: serde_json::Value, ttl: Option<Duration>) -> RelayResult<Self> {
        Ok(Self {
            value: StoredValue::Scalar(value),
            expires_at: expiry_from_ttl(ttl)?,
        })
    }

    /// Whether the entry is dead at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn expiry_from_ttl(ttl: Option<Duration>) -> RelayResult<Option<DateTime<Utc>>> {
    ttl.map(|ttl| {
        chrono::Duration::from_std(ttl)
            .map(|d| Utc::now() + d)
            .map_err(|e| RelayError::Store(format!("TTL out of range: {e}")))
    })
    .transpose()
}

fn wrong_type(key: &str) -> RelayError {
    RelayError::Store(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

/// In-process backend. TTLs are enforced lazily on read and by
/// [`InMemoryBackend::purge_expired`], which [`KvBackend::reclaim`] calls.
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Remove every expired key. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether no live key remains.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub(crate) async fn put_entry(&self, key: &str, entry: Entry) {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
    }

    pub(crate) async fn remove(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    pub(crate) async fn remove_all(&self) {
        self.entries.write().await.clear();
    }

    /// Fails if `key` holds a live scalar.
    pub(crate) async fn check_list(&self, key: &str) -> RelayResult<()> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(Entry {
                value: StoredValue::Scalar(_),
                expires_at,
            }) if !expires_at.is_some_and(|at| at <= now) => Err(wrong_type(key)),
            _ => Ok(()),
        }
    }

    pub(crate) async fn push(&self, key: &str, value: serde_json::Value) -> RelayResult<usize> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: StoredValue::List(Vec::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: StoredValue::List(Vec::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            StoredValue::List(items) => {
                items.push(value);
                Ok(items.len())
            }
            StoredValue::Scalar(_) => Err(wrong_type(key)),
        }
    }

    /// Live entries, for compaction.
    pub(crate) async fn snapshot(&self) -> Vec<(String, Entry)> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> RelayResult<Option<serde_json::Value>> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(None),
            Some(Entry {
                value: StoredValue::Scalar(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> RelayResult<()> {
        let entry = Entry::scalar(value, ttl)?;
        self.put_entry(key, entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RelayResult<bool> {
        Ok(self.remove(key).await)
    }

    async fn exists(&self, key: &str) -> RelayResult<bool> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries.get(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn append_to_list(&self, key: &str, value: serde_json::Value) -> RelayResult<usize> {
        self.push(key, value).await
    }

    async fn get_list(&self, key: &str) -> RelayResult<Vec<serde_json::Value>> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(Vec::new()),
            Some(Entry {
                value: StoredValue::List(items),
                ..
            }) => Ok(items.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn clear(&self) -> RelayResult<()> {
        self.remove_all().await;
        Ok(())
    }

    async fn reclaim(&self) -> RelayResult<usize> {
        Ok(self.purge_expired().await)
    }
}
