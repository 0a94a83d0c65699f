use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::extractor::ExtractionResult;

/// Anything whose outcome may be worth retrying.
pub trait Attempt {
    /// True only for transient failures. "Found nothing" is never transient.
    fn transient_failure(&self) -> bool;
}

impl<T> Attempt for ExtractionResult<T> {
    fn transient_failure(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| f.transient)
    }
}

impl<T> Attempt for Result<T, AppError> {
    fn transient_failure(&self) -> bool {
        self.as_ref().is_err_and(AppError::is_retryable)
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at one minute.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        std::cmp::min(self.base.saturating_mul(factor), MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, misses, fails terminally, or the
    /// retry budget is spent. Returns the last outcome either way.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> T
    where
        T: Attempt,
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = op().await;
            if !outcome.transient_failure() || attempt >= self.max_retries {
                return outcome;
            }
            let delay = self.delay_for_attempt(attempt);
            tracing::warn!(
                step = label,
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
