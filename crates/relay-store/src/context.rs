use crate::backend::KvBackend;
use relay_core::RelayResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const CONTEXT_PREFIX: &str = "context:";

/// Shared key-value context visible to every agent.
///
/// Keys are namespaced under `context:` on the backend, so context data
/// never collides with task bookkeeping stored on the same backend.
/// Concurrent writers to one key race and the last write wins.
#[derive(Clone)]
pub struct ContextStore {
    backend: Arc<dyn KvBackend>,
}

impl ContextStore {
    /// Context over `backend`.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// The underlying backend, shared with other components.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    fn key(key: &str) -> String {
        format!("{CONTEXT_PREFIX}{key}")
    }

    /// Write `value`, expiring after `ttl` when given.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> RelayResult<()> {
        self.backend.set(&Self::key(key), value, ttl).await
    }

    /// Read a value; `None` when absent or expired.
    pub async fn get(&self, key: &str) -> RelayResult<Option<serde_json::Value>> {
        self.backend.get(&Self::key(key)).await
    }

    /// Returns `true` if the key existed.
    pub async fn delete(&self, key: &str) -> RelayResult<bool> {
        self.backend.delete(&Self::key(key)).await
    }

    /// Whether a live value is stored under `key`.
    pub async fn exists(&self, key: &str) -> RelayResult<bool> {
        self.backend.exists(&Self::key(key)).await
    }

    /// Append to a context list. Returns the new length.
    pub async fn append_to_list(&self, key: &str, value: serde_json::Value) -> RelayResult<usize> {
        self.backend.append_to_list(&Self::key(key), value).await
    }

    /// Read a context list; empty when absent.
    pub async fn get_list(&self, key: &str) -> RelayResult<Vec<serde_json::Value>> {
        self.backend.get_list(&Self::key(key)).await
    }

    /// Store any serializable value.
    pub async fn set_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> RelayResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl).await
    }

    /// Read a value and decode it into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> RelayResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore").finish_non_exhaustive()
    }
}
