use std::time::Duration;
use rand::Rng;
use futures::Future;

use crate::errors::TransportError;

/// Configuration for retry behavior
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Initial backoff duration before first retry
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Factor to apply random jitter (0-1)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait before the retry following `current`
    fn next_backoff(&self, current: Duration) -> Duration {
        let next_backoff_millis = current.as_millis() as f64 * self.backoff_multiplier;
        Duration::from_millis(next_backoff_millis.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

/// Whether a failed collector call may succeed when attempted again
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::ConnectionError(_)
        | TransportError::HttpError(_)
        | TransportError::ServerStatus(_) => true,
        // an open circuit fails fast, retrying would defeat it
        TransportError::CircuitBreakerOpen => false,
        TransportError::InvalidUri(_) | TransportError::SerializationError(_) => false,
    }
}

/// Executes an async collector call with retry logic
///
/// # Arguments
/// * `operation` - The async operation to execute
/// * `config` - Retry configuration
///
/// # Returns
/// Result of the operation or the last error encountered
pub async fn with_retry<F, Fut, T>(
    mut operation: F,
    config: &RetryConfig,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut current_retry = 0;
    let mut current_backoff = config.initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if current_retry >= config.max_retries || !is_retryable(&error) {
                    return Err(error);
                }

                let jitter_range = (current_backoff.as_millis() as f64 * config.jitter_factor) as u64;
                let jitter = if jitter_range > 0 {
                    rand::thread_rng().gen_range(0..jitter_range)
                } else {
                    0
                };

                let sleep_duration = current_backoff.saturating_add(Duration::from_millis(jitter));
                log::debug!(
                    "Collector call failed ({error}), retry {}/{} in {:?}",
                    current_retry + 1,
                    config.max_retries,
                    sleep_duration
                );

                tokio::time::sleep(sleep_duration).await;

                current_retry += 1;
                current_backoff = config.next_backoff(current_backoff);
            }
        }
    }
}
