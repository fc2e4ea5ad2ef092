//! Pluggable key-value storage and the shared context store.
//!
//! # Main types
//!
//! - [`KvBackend`] — Backend contract: get/set/delete/list-append/list-read with optional TTL.
//! - [`InMemoryBackend`] — In-process backend with lazy TTL expiry.
//! - [`FileBackend`] — Durable backend persisted as a JSONL operation log.
//! - [`ContextStore`] — Namespaced, cloneable handle agents use to share data.
//! - [`StoreConfig`] — `[store]` configuration and [`open_backend`].

/// Backend trait and in-memory implementation.
pub mod backend;
/// Backend selection from configuration.
pub mod config;
/// Shared context store.
pub mod context;
/// File-backed backend.
pub mod file;

pub use backend::{Entry, InMemoryBackend, KvBackend, StoredValue};
pub use config::{open_backend, BackendKind, StoreConfig};
pub use context::ContextStore;
pub use file::FileBackend;
