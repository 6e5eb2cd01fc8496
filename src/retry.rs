use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the initial attempt (total attempts = 1 + max_retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor the delay is multiplied by after each retry.
    pub backoff_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based): `initial × factor^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.backoff_factor.saturating_pow(retry))
    }
}

/// Retry policy for determining whether an error is retryable.
pub trait RetryPolicy<E> {
    fn is_retryable(&self, error: &E) -> bool;
}

/// Execute an async operation with exponential backoff.
///
/// A non-retryable error or exhausted attempts propagate the error
/// unchanged; nothing is swallowed. Only the calling task sleeps between
/// attempts. Callers must not route non-idempotent operations through
/// this unless the operation carries an idempotency key.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    policy: impl RetryPolicy<E>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retries_used = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retries_used > 0 {
                    debug!(retries = retries_used, "operation succeeded after retrying");
                }
                return Ok(result);
            }
            Err(error) => {
                if retries_used >= config.max_retries || !policy.is_retryable(&error) {
                    return Err(error);
                }

                let delay = config.delay_for(retries_used);
                warn!(
                    attempt = retries_used + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed; retrying"
                );
                sleep(delay).await;
                retries_used += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysRetry;
    impl RetryPolicy<String> for AlwaysRetry {
        fn is_retryable(&self, _error: &String) -> bool {
            true
        }
    }

    struct NeverRetry;
    impl RetryPolicy<String> for NeverRetry {
        fn is_retryable(&self, _error: &String) -> bool {
            false
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(200));
        assert_eq!(config.delay_for(1), Duration::from_millis(400));
        assert_eq!(config.delay_for(2), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_total_attempts_is_one_plus_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&fast_config(3), AlwaysRetry, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&fast_config(3), NeverRetry, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("card_declined".to_string())
        })
        .await;

        assert_eq!(result.unwrap_err(), "card_declined");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(&fast_config(3), AlwaysRetry, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("connection reset".to_string())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
