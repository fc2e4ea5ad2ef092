use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One unit of work submitted for execution by a named agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id (caller-supplied or generated).
    pub id: String,
    /// Name of the agent that executes the task.
    pub agent_name: String,
    /// Opaque input for the handler.
    pub payload: serde_json::Value,
    /// Free-form caller metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the task was accepted.
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with an explicit id.
    pub fn new(
        id: impl Into<String>,
        agent_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            agent_name: agent_name.into(),
            payload,
            metadata: HashMap::new(),
            submitted_at: Utc::now(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build a collision-resistant id from the agent name, a process-local
    /// sequence number, and a random suffix.
    pub fn generate_id(agent_name: &str, seq: u64) -> String {
        let token = Uuid::new_v4().simple().to_string();
        format!("{agent_name}-{seq}-{}", &token[..8])
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Accepted, waiting for a concurrency slot.
    Queued,
    /// A handler is running (possibly between retries).
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Completed and Failed accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Queued, TaskState::Processing)
                | (TaskState::Processing, TaskState::Completed)
                | (TaskState::Processing, TaskState::Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Processing => write!(f, "processing"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task ended in [`TaskState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Every attempt in the retry budget failed.
    TerminalFailure,
    /// The handler reported an error that must not be retried.
    NonRetryable,
    /// The task exceeded the processing ceiling.
    TimedOut,
    /// Cancellation was observed between attempts.
    Cancelled,
}

/// Structured error stored on a failed [`TaskRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Why the task failed.
    pub kind: TaskErrorKind,
    /// Last handler error, or a description of the timeout or cancellation.
    pub message: String,
    /// Handler invocations made before failing.
    pub attempts: u32,
}

impl TaskError {
    /// Error of `kind` after `attempts` invocations.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }
}

/// A state change together with the fields it sets.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Queued → Processing.
    Start,
    /// Processing → Completed.
    Complete {
        /// Handler output.
        result: serde_json::Value,
        /// Handler invocations made.
        attempts: u32,
    },
    /// Processing → Failed.
    Fail(TaskError),
}

impl Transition {
    /// The state this transition leads to.
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Start => TaskState::Processing,
            Transition::Complete { .. } => TaskState::Completed,
            Transition::Fail(_) => TaskState::Failed,
        }
    }
}

/// Lifecycle record of one task, owned by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task id.
    pub task_id: String,
    /// Agent the task was routed to.
    pub agent_name: String,
    /// Current lifecycle state.
    pub state: TaskState,
    /// When the record was created.
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub attempts: u32,
}

impl TaskRecord {
    /// A fresh record in [`TaskState::Queued`].
    pub fn queued(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_name: task.agent_name.clone(),
            state: TaskState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    /// Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a transition in place. The record is left untouched when the
    /// transition is not allowed from the current state.
    pub fn apply(&mut self, transition: Transition) -> RelayResult<()> {
        let to = transition.target();
        if !self.state.can_transition_to(to) {
            return Err(RelayError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Start => {
                self.started_at = Some(now);
            }
            Transition::Complete { result, attempts } => {
                self.completed_at = Some(now);
                self.result = Some(result);
                self.attempts = attempts;
            }
            Transition::Fail(error) => {
                self.failed_at = Some(now);
                self.attempts = error.attempts;
                self.error = Some(error);
            }
        }
        self.state = to;
        Ok(())
    }

    /// Turn a terminal record into the handler's outcome: the result for a
    /// completed task, [`RelayError::TerminalFailure`] for a failed one.
    pub fn into_result(self) -> RelayResult<serde_json::Value> {
        match self.state {
            TaskState::Completed => Ok(self.result.unwrap_or(serde_json::Value::Null)),
            TaskState::Failed => {
                let (attempts, message) = self
                    .error
                    .map(|e| (e.attempts, e.message))
                    .unwrap_or((self.attempts, "unknown error".to_string()));
                Err(RelayError::TerminalFailure {
                    task_id: self.task_id,
                    attempts,
                    message,
                })
            }
            state => Err(RelayError::InvalidTransition {
                task_id: self.task_id,
                from: state,
                to: TaskState::Completed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> Task {
        Task::new("t-1", "researcher", json!({"task": "survey"}))
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = Task::generate_id("coder", 1);
        let b = Task::generate_id("coder", 1);
        assert!(a.starts_with("coder-1-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Processing));
        assert!(TaskState::Processing.can_transition_to(TaskState::Completed));
        assert!(TaskState::Processing.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Queued.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Processing));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Queued));
    }

    #[test]
    fn test_full_success_lifecycle() {
        let mut record = TaskRecord::queued(&sample_task());
        record.apply(Transition::Start).unwrap();
        assert!(record.started_at.is_some());

        record
            .apply(Transition::Complete {
                result: json!({"ok": true}),
                attempts: 2,
            })
            .unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.attempts, 2);
        assert!(record.completed_at.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_terminal_rejects_further_transitions() {
        let mut record = TaskRecord::queued(&sample_task());
        record.apply(Transition::Start).unwrap();
        record
            .apply(Transition::Fail(TaskError::new(
                TaskErrorKind::TerminalFailure,
                "boom",
                3,
            )))
            .unwrap();

        let before = record.clone();
        let err = record.apply(Transition::Start).unwrap_err();
        assert!(matches!(err, RelayError::InvalidTransition { .. }));
        assert_eq!(record, before);
    }

    #[test]
    fn test_cannot_complete_from_queued() {
        let mut record = TaskRecord::queued(&sample_task());
        let err = record
            .apply(Transition::Complete {
                result: json!(null),
                attempts: 1,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidTransition {
                from: TaskState::Queued,
                to: TaskState::Completed,
                ..
            }
        ));
    }

    #[test]
    fn test_into_result_failed() {
        let mut record = TaskRecord::queued(&sample_task());
        record.apply(Transition::Start).unwrap();
        record
            .apply(Transition::Fail(TaskError::new(
                TaskErrorKind::TerminalFailure,
                "upstream: 503",
                3,
            )))
            .unwrap();
        match record.into_result() {
            Err(RelayError::TerminalFailure { attempts, message, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "upstream: 503");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&TaskState::Processing).unwrap(), "\"processing\"");
        let kind: TaskErrorKind = serde_json::from_str("\"timed_out\"").unwrap();
        assert_eq!(kind, TaskErrorKind::TimedOut);
    }
}
