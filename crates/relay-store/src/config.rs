use crate::backend::{InMemoryBackend, KvBackend};
use crate::file::FileBackend;
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Which backend implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
}

/// `[store]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Log file for the file backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            path: None,
        }
    }
}

/// Open the backend described by `config`.
pub async fn open_backend(config: &StoreConfig) -> RelayResult<Arc<dyn KvBackend>> {
    match config.kind {
        BackendKind::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(InMemoryBackend::new()))
        }
        BackendKind::File => {
            let path = config.path.clone().ok_or_else(|| {
                RelayError::Config("store.path is required for the file backend".to_string())
            })?;
            info!(path = %path.display(), "Using file store");
            Ok(Arc::new(FileBackend::open(path).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_backend_requires_path() {
        let config = StoreConfig {
            kind: BackendKind::File,
            path: None,
        };
        assert!(matches!(
            open_backend(&config).await,
            Err(RelayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_file_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            kind: BackendKind::File,
            path: Some(tmp.path().join("data").join("relay.jsonl")),
        };
        let backend = open_backend(&config).await.unwrap();
        backend.set("k", json!(1), None).await.unwrap();
        assert!(tmp.path().join("data").join("relay.jsonl").exists());
    }
}
