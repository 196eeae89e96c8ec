//! Retry with Exponential Backoff
//! Handles transient failures with configurable retry policies

use crate::observability::metrics::get_metrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short, tight policy for lost optimistic-write races.
    pub fn for_conflicts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Execute an async function, retrying every error
pub async fn with_retry_async<F, Fut, T, E>(
    operation: &str,
    config: &RetryConfig,
    f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(operation, config, |_| true, f).await
}

/// Execute an async function, retrying only errors accepted by `retryable`
pub async fn with_retry_if<F, Fut, T, E, P>(
    operation: &str,
    config: &RetryConfig,
    retryable: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                    record_attempt(operation, "recovered");
                }
                return Ok(result);
            }
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after all retries"
                    );
                    record_attempt(operation, "exhausted");
                    return Err(e);
                }

                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                record_attempt(operation, "retry");

                let actual_delay = if config.jitter {
                    let jitter = (rand_jitter() * delay.as_millis() as f64 * 0.3) as u64;
                    delay + Duration::from_millis(jitter)
                } else {
                    delay
                };

                sleep(actual_delay).await;

                delay = delay.mul_f64(config.multiplier).min(config.max_delay);
            }
        }
    }
}

fn record_attempt(operation: &str, outcome: &str) {
    if let Some(metrics) = get_metrics() {
        metrics
            .retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

/// Cheap jitter in [0, 1) from the clock's sub-second nanos
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64 % 1000.0) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry_async("flaky", &fast(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {} failed", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry_async("down", &fast(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("unavailable".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry_if(
            "rejected",
            &fast(5),
            |e: &String| e.starts_with("conflict"),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("insufficient balance".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
