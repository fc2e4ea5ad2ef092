use relay_core::{HandlerError, TaskError, TaskErrorKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retry budget and backoff for handler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included. Zero is treated as one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds; the wait after attempt `n` is `base * n`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_retries` total attempts and the given base delay.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Attempts actually made, never fewer than one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Linear backoff: the wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Something that happened during a retried execution.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// Attempt `attempt` (1-based) is about to call the handler.
    AttemptStarted {
        attempt: u32,
    },
    /// `retry_in` is `None` when no attempt follows.
    AttemptFailed {
        attempt: u32,
        error: HandlerError,
        retry_in: Option<Duration>,
    },
    /// The handler returned a value on `attempt`.
    Succeeded {
        attempt: u32,
    },
    /// No further attempt will be made.
    GaveUp {
        reason: TerminalReason,
        attempts: u32,
    },
}

/// Receives [`RetryEvent`]s. Called inline, so implementations must not block.
pub trait RetryObserver: Send + Sync {
    /// Called once per event, in order.
    fn on_event(&self, task_id: &str, event: &RetryEvent);
}

/// Logs retry events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl RetryObserver for TracingObserver {
    fn on_event(&self, task_id: &str, event: &RetryEvent) {
        match event {
            RetryEvent::AttemptStarted { attempt } => {
                tracing::debug!(task_id, attempt, "Attempt started");
            }
            RetryEvent::AttemptFailed {
                attempt,
                error,
                retry_in,
            } => {
                warn!(
                    task_id,
                    attempt,
                    error = %error,
                    retry_in_ms = retry_in.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                    "Attempt failed"
                );
            }
            RetryEvent::Succeeded { attempt } => {
                tracing::debug!(task_id, attempt, "Attempt succeeded");
            }
            RetryEvent::GaveUp { reason, attempts } => {
                info!(task_id, attempts, reason = ?reason, "Giving up on task");
            }
        }
    }
}

/// Why the executor stopped without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// Every attempt failed.
    Exhausted,
    /// The handler reported a non-retryable error.
    NonRetryable,
    /// Cancellation was observed before an attempt.
    Cancelled,
}

/// A successful execution and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Succeeded<T> {
    /// Handler output.
    pub value: T,
    /// Invocations made, the successful one included.
    pub attempts: u32,
}

/// Terminal outcome of a retried execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalError {
    /// Why execution stopped.
    pub reason: TerminalReason,
    /// Invocations made.
    pub attempts: u32,
    /// `None` when cancelled before the first attempt.
    pub last_error: Option<HandlerError>,
}

impl TerminalError {
    /// The structured error recorded on the failed task.
    pub fn to_task_error(&self) -> TaskError {
        let kind = match self.reason {
            TerminalReason::Exhausted => TaskErrorKind::TerminalFailure,
            TerminalReason::NonRetryable => TaskErrorKind::NonRetryable,
            TerminalReason::Cancelled => TaskErrorKind::Cancelled,
        };
        let message = match (&self.last_error, self.reason) {
            (Some(err), _) => err.to_string(),
            (None, TerminalReason::Cancelled) => "cancelled before execution".to_string(),
            (None, _) => "no attempt was made".to_string(),
        };
        TaskError::new(kind, message, self.attempts)
    }
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_task_error().message)
    }
}

/// Runs an operation with a bounded number of attempts and linear backoff.
///
/// Backoff waits are per-task async sleeps, so one task waiting never stalls
/// another. Cancellation is cooperative: it is checked before every attempt
/// and interrupts a backoff wait, but never a running attempt.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Arc<dyn RetryObserver>,
}

impl RetryExecutor {
    /// Executor reporting to the tracing observer.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Report events to `observer` instead.
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The policy in effect.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Call `op(attempt)` until it succeeds, fails permanently, the budget is
    /// spent, or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Succeeded<T>, TerminalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let max = self.policy.attempts();
        let mut last_error = None;

        for attempt in 1..=max {
            if cancel.is_cancelled() {
                return Err(self.give_up(task_id, TerminalReason::Cancelled, attempt - 1, last_error));
            }

            self.observer
                .on_event(task_id, &RetryEvent::AttemptStarted { attempt });

            match op(attempt).await {
                Ok(value) => {
                    self.observer
                        .on_event(task_id, &RetryEvent::Succeeded { attempt });
                    return Ok(Succeeded {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let retry_in = (error.retryable && attempt < max)
                        .then(|| self.policy.delay_after(attempt));
                    self.observer.on_event(
                        task_id,
                        &RetryEvent::AttemptFailed {
                            attempt,
                            error: error.clone(),
                            retry_in,
                        },
                    );

                    if !error.retryable {
                        return Err(self.give_up(
                            task_id,
                            TerminalReason::NonRetryable,
                            attempt,
                            Some(error),
                        ));
                    }
                    last_error = Some(error);

                    if let Some(delay) = retry_in {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return Err(self.give_up(task_id, TerminalReason::Cancelled, attempt, last_error));
                            }
                        }
                    }
                }
            }
        }

        Err(self.give_up(task_id, TerminalReason::Exhausted, max, last_error))
    }

    fn give_up(
        &self,
        task_id: &str,
        reason: TerminalReason,
        attempts: u32,
        last_error: Option<HandlerError>,
    ) -> TerminalError {
        self.observer
            .on_event(task_id, &RetryEvent::GaveUp { reason, attempts });
        TerminalError {
            reason,
            attempts,
            last_error,
        }
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
