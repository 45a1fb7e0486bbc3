//! Retry policy shell: wraps a single operation with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::ErrorPayload;
use crate::time_provider::SharedTimeProvider;
use crate::work::{OnFailure, WorkStatus};

/// First backoff delay.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before retrying attempt `attempt + 1`: `base × 2^(attempt-1)`,
/// capped. Attempts are 1-based.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    BACKOFF_BASE
        .saturating_mul(2_u32.saturating_pow(exponent))
        .min(BACKOFF_CAP)
}

/// Result of driving an operation through a retry policy.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final status.
    pub status: WorkStatus,
    /// Attempts made.
    pub attempts: u32,
    /// True when the `escalate` policy exhausted its retry.
    pub escalated: bool,
    /// Failure from the last attempt, when the run did not succeed.
    pub last_error: Option<ErrorPayload>,
}

/// Drives a fallible async operation according to a failure policy.
#[derive(Clone)]
pub struct Runner {
    time: SharedTimeProvider,
}

impl Runner {
    /// Creates a runner over the given clock.
    #[must_use]
    pub fn new(time: SharedTimeProvider) -> Self {
        Self { time }
    }

    /// Runs `attempt` under `policy`. The closure receives the 1-based
    /// attempt number.
    ///
    /// Escalation side effects (emitting the escalated status message) are
    /// the caller's, keyed off [`RunOutcome::escalated`]; the runner only
    /// decides when retries stop.
    pub async fn run<F, Fut>(
        &self,
        policy: OnFailure,
        max_attempts: u32,
        mut attempt: F,
    ) -> RunOutcome
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<(), ErrorPayload>> + Send,
    {
        let allowed = match policy {
            OnFailure::Retry => max_attempts.max(1),
            OnFailure::Escalate => 2,
            OnFailure::Report | OnFailure::Pause => 1,
        };

        let mut last_error = None;
        for n in 1..=allowed {
            match attempt(n).await {
                Ok(()) => {
                    return RunOutcome {
                        status: WorkStatus::Done,
                        attempts: n,
                        escalated: false,
                        last_error: None,
                    };
                }
                Err(error) => {
                    tracing::debug!(
                        attempt_count = n,
                        outcome = "failed",
                        error = %error.message,
                        "runner attempt failed"
                    );
                    last_error = Some(error);
                    if n < allowed {
                        self.time.sleep(backoff_delay(n)).await;
                    }
                }
            }
        }

        let (status, escalated) = match policy {
            OnFailure::Pause => (WorkStatus::Stuck, false),
            OnFailure::Escalate => (WorkStatus::Failed, true),
            OnFailure::Retry | OnFailure::Report => (WorkStatus::Failed, false),
        };

        RunOutcome {
            status,
            attempts: allowed,
            escalated,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::time_provider::mock_time_provider;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn boom() -> ErrorPayload {
        ErrorPayload::new(FailureKind::ToolFailure, "boom", "executor", true)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(31), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retry_stops_at_max_attempts() {
        let runner = Runner::new(mock_time_provider());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = runner
            .run(OnFailure::Retry, 3, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(boom())
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.status, WorkStatus::Failed);
        assert!(!outcome.escalated);
    }

    #[tokio::test]
    async fn retry_succeeds_midway() {
        let runner = Runner::new(mock_time_provider());
        let outcome = runner
            .run(OnFailure::Retry, 5, |n| async move {
                if n < 3 { Err(boom()) } else { Ok(()) }
            })
            .await;
        assert_eq!(outcome.status, WorkStatus::Done);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn report_tries_once() {
        let runner = Runner::new(mock_time_provider());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = runner
            .run(OnFailure::Report, 5, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(boom())
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.status, WorkStatus::Failed);
    }

    #[tokio::test]
    async fn escalate_retries_once_then_flags() {
        let runner = Runner::new(mock_time_provider());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = runner
            .run(OnFailure::Escalate, 5, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(boom())
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(outcome.escalated);
        assert_eq!(outcome.status, WorkStatus::Failed);
    }

    #[tokio::test]
    async fn pause_parks_without_retry() {
        let runner = Runner::new(mock_time_provider());
        let outcome = runner
            .run(OnFailure::Pause, 5, |_| async { Err(boom()) })
            .await;
        assert_eq!(outcome.status, WorkStatus::Stuck);
        assert_eq!(outcome.attempts, 1);
    }
}
