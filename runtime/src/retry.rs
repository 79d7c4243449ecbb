//! Bounded, fixed-interval retry for transient failures.
//!
//! The connect loop waits the same interval between every attempt. That suits
//! a broker that is merely slow to start next to the service (a sibling
//! container, say); it is not meant to ride out long network partitions. When
//! attempts run out the caller gives up and the process supervisor restarts
//! it.
//!
//! # Example
//!
//! ```rust
//! use courier_core::environment::TokioSleeper;
//! use courier_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .backoff_interval(Duration::from_millis(100))
//!     .build();
//!
//! let result = retry_with_predicate(
//!     &policy,
//!     &TokioSleeper,
//!     |_attempt| async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("transient"),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use courier_core::environment::Sleeper;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Retry policy configuration for the connect loop.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `backoff_interval`: 2 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Always at least 1.
    max_attempts: u32,
    /// Wait between a failed attempt and the next one.
    backoff_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_interval: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    ///
    /// `max_attempts` below 1 is raised to 1: the operation always runs once.
    #[must_use]
    pub fn new(max_attempts: u32, backoff_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_interval,
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            backoff_interval: None,
        }
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait between attempts.
    #[must_use]
    pub const fn backoff_interval(&self) -> Duration {
        self.backoff_interval
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// Returns `None` once `attempt` has used up the budget, meaning no
    /// further attempt follows. Otherwise the delay is the fixed interval.
    #[must_use]
    pub const fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            Some(self.backoff_interval)
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    backoff_interval: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of attempts (values below 1 become 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the fixed wait between attempts.
    #[must_use]
    pub const fn backoff_interval(mut self, interval: Duration) -> Self {
        self.backoff_interval = Some(interval);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy::new(
            self.max_attempts.unwrap_or(defaults.max_attempts),
            self.backoff_interval.unwrap_or(defaults.backoff_interval),
        )
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E: fmt::Display> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made (equals the policy's `max_attempts`)
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },

    /// An attempt failed with an error the predicate refused to retry.
    #[error("attempt {attempt} failed permanently: {error}")]
    NotRetryable {
        /// The attempt (1-based) that failed
        attempt: u32,
        /// The error it failed with
        error: E,
    },
}

/// Retry an async operation while `is_retryable` approves the error.
///
/// `operation` receives the 1-based attempt number. Between attempts the
/// policy's fixed interval is awaited on `sleeper`; no wait follows the final
/// attempt.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] after `max_attempts` retryable failures
/// and [`RetryError::NotRetryable`] on the first non-retryable one.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(RetryError::NotRetryable {
                        attempt,
                        error: err,
                    });
                }

                let Some(delay) = policy.delay_after(attempt) else {
                    tracing::error!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                };

                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleeper.sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::environment::TokioSleeper;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_interval_until_budget_spent() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff_interval(Duration::from_millis(250))
            .build();

        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_after(1), None);
    }

    #[test]
    fn test_builder_defaults() {
        assert_eq!(RetryPolicy::builder().build(), RetryPolicy::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_first_try() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            &RetryPolicy::default(),
            &TokioSleeper,
            |_| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(42)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result = retry_with_predicate(
            &policy,
            &TokioSleeper,
            |attempt| async move { Err::<i32, _>(format!("attempt {attempt} failed")) },
            |_| true,
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last_error: "attempt 3 failed".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            &RetryPolicy::default(),
            &TokioSleeper,
            |_| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("permanent error")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::NotRetryable {
                attempt: 1,
                error: "permanent error"
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
