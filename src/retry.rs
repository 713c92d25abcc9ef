use std::future::Future;
use tokio::time::{sleep, Duration, Instant};
use tracing::error;

use crate::error::Result;

/// Fixed-interval retry bounded by attempt count and total elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: usize,
    pub retry_interval: Duration,
    pub max_wait_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            retry_interval: Duration::from_secs(10),
            max_wait_time: Duration::from_secs(6 * 60),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with a non-retriable error, or the
    /// attempt/time budget runs out. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retriable() => return Err(err),
                Err(err) => err,
            };
            error!(attempt, error = %err, "Attempt {attempt} failed");
            if attempt >= self.max_retries || started.elapsed() >= self.max_wait_time {
                return Err(err);
            }
            sleep(self.retry_interval).await;
        }
    }
}
