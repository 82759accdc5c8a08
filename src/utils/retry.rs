//! Exponential backoff for fallible async operations.

use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;

/// Retry policy: `max_attempts` tries, doubling the delay after each failure.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out of
    /// attempts, or `cancel` fires. Returns `None` when cancelled.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Option<Result<T, IndexerError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                r = op() => r,
            };

            match result {
                Ok(v) => return Some(Ok(v)),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
