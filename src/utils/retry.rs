/// Bounded exponential-backoff retry for fallible async operations
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: `attempts` tries total, sleeping
/// `base_delay * factor^(attempt-1)` between consecutive tries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, factor: u32) -> Self {
        Self {
            attempts,
            base_delay,
            factor,
        }
    }

    /// Delay before the next try after the given 1-based attempt number
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * self.factor.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `operation` until it succeeds, the error is not retryable, or the
    /// attempt budget is exhausted. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        description: &str,
        is_retryable: R,
        operation: F,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        description, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!("{} failed on attempt {}/{}", description, attempt, attempts);
                    return Err(e);
                }
            }
        }

        unreachable!("retry loop returns from its last iteration")
    }
}
