use crate::task::TaskState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`RelayError`].
pub type RelayResult<T> = Result<T, RelayError>;

/// Top-level error type for the Relay workspace.
///
/// Variants map one-to-one onto the failure modes a caller of the
/// coordinator, the tracker, or the context store can observe.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The requested agent is not registered. Never retried.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// A task with this id already exists and the duplicate policy rejects it.
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// The agent's concurrency cap is reached and no queue slot is available.
    #[error("Backpressure on agent '{agent}': {queued} task(s) already waiting")]
    Backpressure {
        /// Agent whose slot pool is saturated.
        agent: String,
        /// Number of tasks waiting at rejection time.
        queued: usize,
    },

    /// A handler returned a failure.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Retries are exhausted; the task was recorded as failed.
    #[error("Task {task_id} failed after {attempts} attempt(s): {message}")]
    TerminalFailure {
        /// The failed task.
        task_id: String,
        /// Number of handler invocations made.
        attempts: u32,
        /// Last error reported.
        message: String,
    },

    /// The storage backend could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The storage backend rejected an operation (e.g. wrong value type).
    #[error("Store error: {0}")]
    Store(String),

    /// A task record or context key does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task ran, but its outcome could not be recorded.
    #[error("Tracking failure for task {task_id}: {message}")]
    TrackingFailure {
        /// The task whose bookkeeping write failed.
        task_id: String,
        /// Underlying store error.
        message: String,
        /// The handler result that may exist but be unrecorded.
        result: Option<serde_json::Value>,
    },

    /// A state change that the lifecycle does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose transition was rejected.
        task_id: String,
        /// Current state.
        from: TaskState,
        /// Requested state.
        to: TaskState,
    },

    /// The task was cancelled before it started.
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration or registration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the error comes from an unreachable backend and the
    /// operation may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::StoreUnavailable(_))
    }
}

/// Failure returned by an agent handler: `Err(kind, detail)`.
///
/// `retryable` decides whether the retry executor spends more of its
/// budget on the task or stops at once.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct HandlerError {
    /// Short machine-readable category, e.g. `"timeout"` or `"invalid_input"`.
    pub kind: String,
    /// Human-readable description.
    pub detail: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl HandlerError {
    /// A failure worth retrying.
    pub fn transient(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            retryable: true,
        }
    }

    /// A failure that no retry can fix.
    pub fn permanent(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            retryable: false,
        }
    }
}

impl From<RelayError> for HandlerError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::StoreUnavailable(msg) => HandlerError::transient("store_unavailable", msg),
            RelayError::Handler(inner) => inner,
            RelayError::Json(e) => HandlerError::permanent("json", e.to_string()),
            other => HandlerError::transient("relay", other.to_string()),
        }
    }
}
