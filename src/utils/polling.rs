/// Polling utilities for waiting on conditions with timeout
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of a polling run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    TimedOut,
}

impl PollStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollStatus::Ready)
    }
}

/// Configuration for polling operations
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    /// Create a new polling configuration
    pub fn new(timeout: Duration, interval: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            interval,
            description: description.into(),
        }
    }

    /// Poll at a fixed interval until the condition reports true or the
    /// timeout elapses. The condition is checked once before the first wait,
    /// and the timeout classification is left to the caller: different
    /// callers surface it as different error kinds.
    pub async fn poll_until<F, Fut>(&self, condition: F) -> PollStatus
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        info!("{}...", self.description);

        let start = Instant::now();

        loop {
            if condition().await {
                info!("✓ {}", self.description);
                return PollStatus::Ready;
            }

            if start.elapsed() >= self.timeout {
                debug!(
                    "{}: timed out after {}s",
                    self.description,
                    self.timeout.as_secs()
                );
                return PollStatus::TimedOut;
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
