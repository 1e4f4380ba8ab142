//! Exponential backoff shared by the LLM and validate-engine clients.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RequestConfig;

/// Upper bound on retries, whatever the configuration asks for.
pub const MAX_RETRIES_CAP: u32 = 10;

/// Errors that say whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// The error from the final attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    /// Retries made before giving up.
    pub retries: u32,
}

/// Delay before retry `retry` (1-based): `base_ms * 2^(retry - 1)`, saturating.
pub fn backoff_delay(base_ms: u64, retry: u32) -> Duration {
    let factor = 1_u64
        .checked_shl(retry.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Run `attempt` until it succeeds, fails with a non-retryable error or
/// the retry budget in `config` is spent.
pub async fn with_backoff<T, E, F, Fut>(
    config: &RequestConfig,
    call: &str,
    mut attempt: F,
) -> Result<T, Exhausted<E>>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_retries = config.max_retries.min(MAX_RETRIES_CAP);
    let mut retries = 0;

    loop {
        let start = Instant::now();
        match attempt().await {
            Ok(value) => {
                debug!(
                    call = %call,
                    retry = retries,
                    latency_ms = start.elapsed().as_millis(),
                    "Call succeeded"
                );
                return Ok(value);
            }
            Err(error) => {
                warn!(
                    call = %call,
                    error = %error,
                    retry = retries,
                    latency_ms = start.elapsed().as_millis(),
                    "Call failed"
                );
                if retries >= max_retries || !error.is_retryable() {
                    return Err(Exhausted { error, retries });
                }
                retries += 1;
                tokio::time::sleep(backoff_delay(config.retry_delay_ms, retries)).await;
            }
        }
    }
}

/// Statuses worth another attempt: throttling and server errors.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (retryable: {})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn config(max_retries: u32) -> RequestConfig {
        RequestConfig {
            timeout_ms: 1000,
            max_retries,
            retry_delay_ms: 1,
        }
    }

    #[test]
    fn test_backoff_delay_doubles() {
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_delay_saturates() {
        assert_eq!(backoff_delay(1000, 65), Duration::from_millis(u64::MAX));
        assert_eq!(backoff_delay(1000, 200), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_backoff(&config(3), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Flaky(true))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_at_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&config(3), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(false))
        })
        .await;

        assert_eq!(result.unwrap_err().retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_capped() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_backoff(&config(1000), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(true))
        })
        .await;

        assert_eq!(result.unwrap_err().retries, MAX_RETRIES_CAP);
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES_CAP + 1);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(422));
    }
}
