//! Bounded exponential backoff shared by flushes, partition drops and
//! listener restarts.

use std::time::Duration;

/// Retry schedule: `max_retries` attempts after the first, with a delay that
/// doubles from `initial_delay` and is capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub const fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Delay to wait before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff_delay(attempt, self.initial_delay, self.max_delay)
    }

    /// Run `op` until it succeeds or the retries are exhausted.
    ///
    /// `on_retry` is called with the attempt number, the delay about to be
    /// slept and the error that triggered it. Returns the last error on
    /// exhaustion.
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        mut on_retry: impl FnMut(u32, Duration, &E),
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    on_retry(attempt + 1, delay, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Calculate exponential backoff delay for retry attempts.
///
/// The delay doubles with each attempt (2^attempt * initial_delay), capped at max_delay.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn calculate_backoff_delay(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt).min(u64::from(u32::MAX));
    let delay = initial_delay.saturating_mul(multiplier as u32);
    delay.min(max_delay)
}
