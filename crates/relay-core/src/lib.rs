//! Core types and error definitions for the Relay orchestration core.
//!
//! This crate provides the foundational types shared across all Relay crates:
//! the task data model, the lifecycle state machine, and the error taxonomy.
//!
//! # Main types
//!
//! - [`RelayError`] — Unified error enum for every Relay subsystem.
//! - [`RelayResult`] — Convenience alias for `Result<T, RelayError>`.
//! - [`HandlerError`] — Tagged failure returned by agent handlers.
//! - [`Task`] — One unit of work for a named agent.
//! - [`TaskRecord`] — Lifecycle record with timestamps, result, and error.
//! - [`Transition`] — A state change plus the fields it sets.

/// Error taxonomy.
pub mod error;
/// Task data model and lifecycle state machine.
pub mod task;

pub use error::{HandlerError, RelayError, RelayResult};
pub use task::{Task, TaskError, TaskErrorKind, TaskRecord, TaskState, Transition};
