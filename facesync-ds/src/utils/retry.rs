//! Retry Policy
//!
//! Exponential backoff for transient device failures. Business logic never sleeps
//! or loops on its own; every device call goes through `RetryPolicy::run`.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry settings applied uniformly by the device client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff before attempt `attempt + 1` (attempt is 1-based)
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent.
    ///
    /// **Algorithm:**
    /// 1. Attempt operation
    /// 2. If successful, return result
    /// 3. If retryable error and attempts remain: log WARN, backoff, retry
    /// 4. Otherwise return the last error
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let start_time = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = start_time.elapsed().as_millis() as u64,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }

                    if attempt >= max_attempts {
                        tracing::error!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = start_time.elapsed().as_millis() as u64,
                            error = %err,
                            "Operation failed: retry budget exhausted"
                        );
                        return Err(err);
                    }

                    let backoff = self.backoff_for(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
