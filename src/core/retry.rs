//! Retry policy and backoff loop shared by the publish and notification
//! stages.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy for an external call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy used for evaluator callbacks: 1, 2, 4, 8, 16 seconds
    pub fn notification() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 16000,
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error was definitive; no further attempts were made
    #[error("permanent failure after {attempts} attempt(s): {error}")]
    Permanent { error: E, attempts: u32 },

    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u32 },

    /// Shutdown interrupted a backoff wait
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Shutdown reached a wait point before the work finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by shutdown")]
pub struct Interrupted;

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `Err(Interrupted)` when cancelled.
pub async fn cancellable_sleep(delay: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(Interrupted),
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is spent.
///
/// `op` receives the 1-based attempt number. On success the value is
/// returned with the number of attempts used. Only the waits between
/// attempts observe `cancel`; an attempt in progress always runs to its end.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                debug!(label, attempt, "Call succeeded");
                return Ok((value, attempt));
            }
            Err(error) if !error.is_retryable() => {
                warn!(label, attempt, error = %error, "Non-retryable failure");
                return Err(RetryError::Permanent {
                    error,
                    attempts: attempt,
                });
            }
            Err(error) => {
                if !policy.should_retry(attempt) {
                    warn!(label, attempt, error = %error, "Retries exhausted");
                    return Err(RetryError::Exhausted {
                        error,
                        attempts: attempt,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after transient failure"
                );

                if cancellable_sleep(delay, cancel).await.is_err() {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_notification_schedule() {
        let policy = RetryPolicy::notification();
        let delays: Vec<u64> = (1..=5)
            .map(|a| policy.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_should_retry() {
        let policy = fast_policy(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry_with_backoff(&fast_policy(3), "test", &cancel, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TestError { retryable: true })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), ("done", 3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<((), u32), _> =
            retry_with_backoff(&fast_policy(5), "test", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { retryable: false }) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_policy() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<((), u32), _> =
            retry_with_backoff(&fast_policy(4), "test", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { retryable: true }) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let policy = RetryPolicy {
            initial_delay_ms: 60_000,
            ..fast_policy(3)
        };
        let result: Result<((), u32), _> = retry_with_backoff(&policy, "test", &cancel, |_| async {
            Err(TestError { retryable: true })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }

    #[tokio::test]
    async fn test_cancellable_sleep() {
        let cancel = CancellationToken::new();
        tokio_test::assert_ok!(cancellable_sleep(Duration::from_millis(1), &cancel).await);

        cancel.cancel();
        tokio_test::assert_err!(cancellable_sleep(Duration::from_secs(60), &cancel).await);
    }
}
