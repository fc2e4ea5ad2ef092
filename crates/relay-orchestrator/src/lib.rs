//! Dispatch coordination for named agents.
//!
//! Routes submitted tasks to registered agent handlers under per-agent
//! concurrency limits, retries failed attempts with linear backoff, and
//! records every lifecycle transition through the storage backend.
//!
//! # Main types
//!
//! - [`Coordinator`] — Entry point: submit tasks, query status, read and write context.
//! - [`WorkerRegistry`] — Immutable map from agent name to [`AgentDescriptor`].
//! - [`RetryExecutor`] — Bounded retries with cancellation and observable events.
//! - [`LifecycleTracker`] — Persists [`relay_core::TaskRecord`]s and enforces the state machine.
//! - [`AgentMonitor`] — Per-agent activity and cumulative metrics.
//! - [`Watchdog`] — Forces tasks stuck in Processing to Failed.
//! - [`RelayConfig`] — `relay.toml` layout.

/// Configuration file layout and defaults.
pub mod config;
/// Task dispatch, admission, and bookkeeping.
pub mod coordinator;
/// Agent activity and metrics.
pub mod monitor;
/// Agent registration and handler trait.
pub mod registry;
/// Retry policy and executor.
pub mod retry;
/// Per-agent FIFO concurrency slots.
pub mod slots;
/// Task lifecycle persistence.
pub mod tracker;
/// Stuck task detection.
pub mod watchdog;

pub use config::{
    AgentOverride, CoordinatorConfig, LoggingConfig, OverflowMode, RelayConfig, WatchdogConfig,
};
pub use coordinator::{AgentLoad, Coordinator, CoordinatorBuilder, SubmitRequest, TaskHandle};
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, WorkerStatus};
pub use registry::{handler_fn, AgentDescriptor, AgentHandler, RegistryBuilder, WorkerRegistry};
pub use retry::{
    RetryEvent, RetryExecutor, RetryObserver, RetryPolicy, Succeeded, TerminalError,
    TerminalReason, TracingObserver,
};
pub use slots::{Admission, SlotGuard, SlotPool};
pub use tracker::{DuplicatePolicy, LifecycleTracker};
pub use watchdog::Watchdog;
