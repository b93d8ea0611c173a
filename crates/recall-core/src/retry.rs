//! ============================================================================
//! Retry Logic - Exponential Backoff for Downstream Tiers
//! ============================================================================
//! Shared by the background flush loop and the index workers:
//! - Exponential backoff with jitter between attempts
//! - Error classification (retryable vs permanent)
//! - Bounded async retry helper
//! ============================================================================

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for downstream retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts for a single operation
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    /// Error is likely transient, should retry
    Retryable,
    /// Error is permanent, don't retry
    Permanent,
    /// Backend is shedding load, back off at the maximum delay
    Overloaded,
}

/// Classify an error message to determine if retry is appropriate
pub fn classify_error(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("database is locked")
        || lower.contains("busy")
    {
        return ErrorKind::Overloaded;
    }

    // Schema or data problems will fail the same way every time
    if lower.contains("dimension")
        || lower.contains("constraint failed")
        || lower.contains("no such table")
        || lower.contains("malformed")
        || lower.contains("invalid")
        || lower.contains("not found")
    {
        return ErrorKind::Permanent;
    }

    ErrorKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // Add random jitter (0-50% of delay)
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
/// Returns the last error when giving up.
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", label, attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => {
                let kind = classify_error(&e.to_string());
                attempt += 1;

                if kind == ErrorKind::Permanent || attempt >= attempts {
                    warn!(
                        "{} giving up after {} attempt(s) ({:?}): {}",
                        label, attempt, kind, e
                    );
                    return Err(e);
                }

                let delay = match kind {
                    ErrorKind::Overloaded => Duration::from_millis(config.max_delay_ms),
                    _ => calculate_delay(attempt - 1, config),
                };
                warn!(
                    "{} attempt {} failed ({:?}), retrying in {:?}: {}",
                    label, attempt, kind, delay, e
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection refused"), ErrorKind::Retryable);
        assert_eq!(classify_error("database is locked"), ErrorKind::Overloaded);
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorKind::Overloaded);
        assert_eq!(
            classify_error("vector dimension mismatch: expected 384, got 3"),
            ErrorKind::Permanent
        );
        assert_eq!(classify_error("unknown error xyz"), ErrorKind::Retryable);
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig {
            jitter: false,
            base_delay_ms: 500,
            ..Default::default()
        };

        assert_eq!(calculate_delay(0, &config), Duration::from_millis(500));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(4000));
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(10000));
        assert_eq!(calculate_delay(200, &config), Duration::from_millis(10000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig {
            jitter: true,
            base_delay_ms: 1000,
            max_delay_ms: 10000,
            ..Default::default()
        };

        for _ in 0..10 {
            let delay = calculate_delay(0, &config);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_async(&fast_config(), "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_async(&fast_config(), "bad", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("invalid payload")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_async(&fast_config(), "down", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("connection refused")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
