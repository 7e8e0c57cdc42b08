//! Fixed-interval retry for async operations.
//!
//! Every attempt waits the same delay before the next one; there is no
//! exponential growth and no jitter. The policy holds no state between
//! invocations, so one policy can drive any number of concurrent calls.

use backoff::backoff::{Backoff, Constant};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts per operation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay between attempts in milliseconds
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Retry policy: how many attempts and how long to wait between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy. A `max_attempts` of 0 still makes one attempt.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy that makes a single attempt and never sleeps
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `operation` until it succeeds or the attempts run out.
    ///
    /// Every failure is retried. After the last attempt the most recent
    /// error is returned as-is.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but stops early when `should_retry`
    /// rejects an error.
    pub async fn execute_when<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts();
        let mut backoff = Constant::new(self.delay);
        let mut attempt = 1u32;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= max_attempts || !should_retry(&e) {
                        return Err(e);
                    }

                    let delay = backoff.next_backoff().unwrap_or(self.delay);
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    metrics::counter!("b2.retry.attempts").increment(1);

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
