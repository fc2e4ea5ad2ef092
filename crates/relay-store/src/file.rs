use crate::backend::{Entry, InMemoryBackend, KvBackend};
use async_trait::async_trait;
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Log lines below which [`FileBackend::reclaim`] leaves the log alone.
const COMPACT_MIN_OPS: usize = 1024;

/// One line of the operation log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Op {
    Put { key: String, entry: Entry },
    Append { key: String, value: serde_json::Value },
    Delete { key: String },
    Clear,
}

/// File-backed backend that persists every mutation as a JSONL operation log.
///
/// The log is replayed into memory on open and then compacted to one `put`
/// per live key. [`KvBackend::reclaim`] compacts again once expired keys are
/// dropped or the log has outgrown the live data. A mutation is written to the log before it becomes visible
/// to readers, so a reader never observes state that a restart would lose.
pub struct FileBackend {
    path: PathBuf,
    inner: InMemoryBackend,
    /// Serializes log appends with their in-memory application.
    log_lock: Mutex<()>,
    /// Lines appended since the last compaction.
    appended: AtomicUsize,
}

impl FileBackend {
    /// Open (or create) the log at `path`.
    pub async fn open(path: PathBuf) -> RelayResult<Self> {
        let inner = InMemoryBackend::new();

        if path.exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| unavailable("read", &path, e))?;
            let mut replayed = 0usize;
            for (lineno, line) in data.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let op: Op = match serde_json::from_str(line) {
                    Ok(op) => op,
                    Err(e) => {
                        // torn trailing line after a crash
                        warn!(path = %path.display(), line = lineno + 1, error = %e, "Skipping unreadable log entry");
                        continue;
                    }
                };
                if let Err(e) = apply(&inner, op).await {
                    debug!(line = lineno + 1, error = %e, "Replayed op failed");
                }
                replayed += 1;
            }
            info!(path = %path.display(), ops = replayed, "Store log replayed");
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable("create dir for", &path, e))?;
        }

        let backend = Self {
            path,
            inner,
            log_lock: Mutex::new(()),
            appended: AtomicUsize::new(0),
        };
        backend.compact().await?;
        Ok(backend)
    }

    /// Rewrite the log as one `put` per live key, dropping expired entries.
    pub async fn compact(&self) -> RelayResult<()> {
        let _guard = self.log_lock.lock().await;
        let mut data = String::new();
        for (key, entry) in self.inner.snapshot().await {
            data.push_str(&serde_json::to_string(&Op::Put { key, entry })?);
            data.push('\n');
        }
        let tmp = self.path.with_extension("compact");
        tokio::fs::write(&tmp, data.as_bytes())
            .await
            .map_err(|e| unavailable("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| unavailable("replace", &self.path, e))?;
        self.appended.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn log(&self, op: &Op) -> RelayResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| unavailable("open", &self.path, e))?;
        let mut line = serde_json::to_string(op)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| unavailable("append to", &self.path, e))?;
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn unavailable(action: &str, path: &std::path::Path, err: std::io::Error) -> RelayError {
    RelayError::StoreUnavailable(format!(
        "Failed to {action} store log '{}': {err}",
        path.display()
    ))
}

async fn apply(inner: &InMemoryBackend, op: Op) -> RelayResult<()> {
    match op {
        Op::Put { key, entry } => inner.put_entry(&key, entry).await,
        Op::Append { key, value } => {
            inner.push(&key, value).await?;
        }
        Op::Delete { key } => {
            inner.remove(&key).await;
        }
        Op::Clear => inner.remove_all().await,
    }
    Ok(())
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn get(&self, key: &str) -> RelayResult<Option<serde_json::Value>> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> RelayResult<()> {
        let entry = Entry::scalar(value, ttl)?;
        let _guard = self.log_lock.lock().await;
        let op = Op::Put {
            key: key.to_string(),
            entry,
        };
        self.log(&op).await?;
        apply(&self.inner, op).await
    }

    async fn delete(&self, key: &str) -> RelayResult<bool> {
        let _guard = self.log_lock.lock().await;
        if !self.inner.exists(key).await? {
            return Ok(false);
        }
        let op = Op::Delete {
            key: key.to_string(),
        };
        self.log(&op).await?;
        Ok(self.inner.remove(key).await)
    }

    async fn exists(&self, key: &str) -> RelayResult<bool> {
        self.inner.exists(key).await
    }

    async fn append_to_list(&self, key: &str, value: serde_json::Value) -> RelayResult<usize> {
        let _guard = self.log_lock.lock().await;
        self.inner.check_list(key).await?;
        self.log(&Op::Append {
            key: key.to_string(),
            value: value.clone(),
        })
        .await?;
        self.inner.push(key, value).await
    }

    async fn get_list(&self, key: &str) -> RelayResult<Vec<serde_json::Value>> {
        self.inner.get_list(key).await
    }

    async fn clear(&self) -> RelayResult<()> {
        let _guard = self.log_lock.lock().await;
        self.log(&Op::Clear).await?;
        self.inner.remove_all().await;
        Ok(())
    }

    async fn reclaim(&self) -> RelayResult<usize> {
        let purged = self.inner.purge_expired().await;
        let appended = self.appended.load(Ordering::Relaxed);
        if purged > 0 || appended > self.inner.len().await.max(COMPACT_MIN_OPS) {
            self.compact().await?;
            debug!(path = %self.path.display(), purged, appended, "Store log compacted");
        }
        Ok(purged)
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.jsonl");

        {
            let store = FileBackend::open(path.clone()).await.unwrap();
            store.set("context:plan", json!({"phases": 4}), None).await.unwrap();
            store.append_to_list("log", json!("one")).await.unwrap();
            store.append_to_list("log", json!("two")).await.unwrap();
            store.set("gone", json!(true), None).await.unwrap();
            assert!(store.delete("gone").await.unwrap());
        }

        let store = FileBackend::open(path).await.unwrap();
        assert_eq!(
            store.get("context:plan").await.unwrap(),
            Some(json!({"phases": 4}))
        );
        assert_eq!(
            store.get_list("log").await.unwrap(),
            vec![json!("one"), json!("two")]
        );
        assert_eq!(store.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compaction_drops_history() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.jsonl");

        {
            let store = FileBackend::open(path.clone()).await.unwrap();
            for i in 0..10 {
                store.set("counter", json!(i), None).await.unwrap();
            }
        }

        let _store = FileBackend::open(path.clone()).await.unwrap();
        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data.lines().count(), 1);
        assert!(data.contains("\"counter\""));
    }

    #[tokio::test]
    async fn test_reclaim_compacts_live_log() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.jsonl");
        let store = FileBackend::open(path.clone()).await.unwrap();

        store
            .set("session", json!("s"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("keep", json!(1), None).await.unwrap();
        assert_eq!(store.reclaim().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.reclaim().await.unwrap(), 1);
        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data.lines().count(), 1);
        assert!(data.contains("\"keep\""));

        for i in 0..=COMPACT_MIN_OPS {
            store.set("keep", json!(i), None).await.unwrap();
        }
        store.reclaim().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
        assert_eq!(store.get("keep").await.unwrap(), Some(json!(COMPACT_MIN_OPS)));
    }

    #[tokio::test]
    async fn test_ttl_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.jsonl");

        {
            let store = FileBackend::open(path.clone()).await.unwrap();
            store
                .set("session", json!("s"), Some(Duration::from_millis(30)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let store = FileBackend::open(path).await.unwrap();
        assert_eq!(store.get("session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_append_not_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.jsonl");

        {
            let store = FileBackend::open(path.clone()).await.unwrap();
            store.set("k", json!(1), None).await.unwrap();
            assert!(store.append_to_list("k", json!(2)).await.is_err());
        }

        let store = FileBackend::open(path).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.jsonl");
        std::fs::write(
            &path,
            "{\"op\":\"put\",\"key\":\"a\",\"entry\":{\"value\":{\"type\":\"scalar\",\"data\":1}}}\n{\"op\":\"pu",
        )
        .unwrap();

        let store = FileBackend::open(path).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
    }
}
