//! Bounded retry for transient broker failures.
//!
//! Database and queue operations fail transiently: connection loss,
//! deadlock, a pool briefly exhausted. The router's fan-out and the
//! facade's emit wrap those calls here. Errors that another attempt
//! cannot fix (bad configuration, unusable envelopes, serialization)
//! return immediately; see [`BrokerError::is_transient`].

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::BrokerResult;

/// Retry budget for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before the last error is handed back
    pub max_attempts: u32,
    /// First backoff; doubles after every failed attempt
    pub initial_backoff: Duration,
    /// Cap on the doubled backoff
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Run a broker operation, retrying transient failures with exponential
/// backoff.
///
/// Non-transient errors return on the first attempt, untouched. Transient
/// errors are retried up to `max_attempts`; the last one is returned once
/// the budget is spent. Background loops log the result and keep running;
/// facade callers surface it.
pub async fn with_transient_retry<F, Fut, T>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> BrokerResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = BrokerResult<T>>,
{
    let mut attempt = 1u32;
    let mut backoff = config.initial_backoff;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Recovered after transient failure"
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            return Err(error);
        }

        if attempt >= config.max_attempts {
            warn!(
                context = %context,
                attempts = attempt,
                error = %error,
                "Retry budget exhausted"
            );
            return Err(error);
        }

        warn!(
            context = %context,
            attempt = attempt,
            max_attempts = config.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Transient failure, backing off before retry"
        );
        sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, config.max_backoff);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn pool_timeout() -> BrokerError {
        BrokerError::Database(sqlx::Error::PoolTimedOut)
    }

    fn send_failure() -> BrokerError {
        BrokerError::Queue {
            operation: "send",
            queue: "ingress_t1".to_string(),
            source: sqlx::Error::PoolTimedOut,
        }
    }

    #[tokio::test]
    async fn test_recovers_from_transient_database_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = calls.clone();

        let result = with_transient_retry(
            || {
                let calls = probe.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(pool_timeout())
                    } else {
                        Ok(42i64)
                    }
                }
            },
            &quick(),
            "test_emit",
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_configuration_errors_short_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = calls.clone();

        let result: BrokerResult<i64> = with_transient_retry(
            || {
                let calls = probe.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::Configuration(
                        "namespace cannot be empty".to_string(),
                    ))
                }
            },
            &quick(),
            "test_connect",
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Configuration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry can fix bad config");
    }

    #[tokio::test]
    async fn test_invariant_violations_short_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe = calls.clone();

        let result: BrokerResult<()> = with_transient_retry(
            || {
                let calls = probe.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BrokerError::InvariantViolation(
                        "missing or invalid event_type".to_string(),
                    ))
                }
            },
            &quick(),
            "test_fan_out",
        )
        .await;

        assert!(matches!(result, Err(BrokerError::InvariantViolation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_queue_error() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let probe = calls.clone();

        let start = std::time::Instant::now();
        let result: BrokerResult<i64> = with_transient_retry(
            || {
                let calls = probe.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(send_failure())
                }
            },
            &config,
            "test_fan_out",
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Queue { operation: "send", .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps happened between the three attempts: 10ms + 20ms.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
