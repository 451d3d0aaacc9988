//! Termination callback and its bounded retry.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::task::{TaskError, TaskId, TaskResult};

/// Scheduler-side receiver of task results.
#[async_trait]
pub trait TaskTerminateNotification: Send + Sync {
    async fn terminate(&self, task_id: &TaskId, result: &TaskResult) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Delivered { attempts: u32 },
    /// Not sent because the task was killed explicitly
    Skipped,
    /// Every attempt failed; `error` is a `TaskError::Notification`
    Failed { attempts: u32, error: TaskError },
}

impl NotificationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, NotificationOutcome::Failed { .. })
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            NotificationOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Call `callback` up to `attempts` times, sleeping `period` between attempts.
pub async fn notify_with_retry(
    callback: &dyn TaskTerminateNotification,
    result: &TaskResult,
    attempts: u32,
    period: Duration,
) -> NotificationOutcome {
    let attempts = attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match callback.terminate(&result.task_id, result).await {
            Ok(()) => {
                info!(task_id = %result.task_id, attempt, "Task termination notified");
                return NotificationOutcome::Delivered { attempts: attempt };
            }
            Err(e) => {
                last_error = format!("{:#}", e);
                warn!(
                    task_id = %result.task_id,
                    attempt,
                    attempts,
                    "Cannot notify task termination: {}", last_error
                );
                if attempt < attempts {
                    tokio::time::sleep(period).await;
                }
            }
        }
    }
    NotificationOutcome::Failed {
        attempts,
        error: TaskError::notification(format!(
            "scheduler unreachable after {} attempt(s): {}",
            attempts, last_error
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskTerminateNotification for Flaky {
        async fn terminate(&self, _: &TaskId, _: &TaskResult) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("scheduler unreachable (call {})", call);
            }
            Ok(())
        }
    }

    fn result() -> TaskResult {
        TaskResult::success(TaskId("1t0".to_string()), serde_json::Value::Null)
    }

    #[tokio::test]
    async fn retries_until_delivered() {
        let callback = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let outcome = notify_with_retry(&callback, &result(), 3, Duration::from_millis(10)).await;
        assert_eq!(outcome, NotificationOutcome::Delivered { attempts: 3 });
    }

    #[tokio::test]
    async fn gives_up_after_all_attempts() {
        let callback = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let outcome = notify_with_retry(&callback, &result(), 3, Duration::from_millis(10)).await;
        assert!(outcome.is_failure());
        assert_eq!(
            outcome,
            NotificationOutcome::Failed {
                attempts: 3,
                error: TaskError::notification(
                    "scheduler unreachable after 3 attempt(s): scheduler unreachable (call 3)"
                ),
            }
        );
        assert_eq!(callback.calls.load(Ordering::SeqCst), 3);
    }
}
