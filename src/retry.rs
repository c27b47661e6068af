//! Retry envelope for outbound HTTP calls.
//!
//! Every call to the remote API, authentication included, goes through
//! [`retry`] so the whole bridge shares one failure semantics: transient
//! faults (connection resets, timeouts, HTTP 429/5xx) are retried with
//! exponential backoff, permanent failures propagate on the first
//! occurrence, and an exhausted budget surfaces as
//! [`BridgeError::RemoteUnavailable`] carrying the last underlying error.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, the original call included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Ceiling on any computed backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Backoff before retrying after the given 1-based attempt number:
    /// base * 2^(attempt-1), capped at `max_delay`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        // Cap the exponent well before the shift could overflow; the
        // delay cap makes anything larger indistinguishable anyway.
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Run `op` under the retry policy.
///
/// A server-provided Retry-After hint (HTTP 429) overrides the computed
/// backoff for that attempt. `op_name` only labels log lines.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    warn!(op = op_name, attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(BridgeError::RemoteUnavailable {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                let delay = err
                    .retry_after_hint()
                    .unwrap_or_else(|| policy.backoff_delay(attempt));
                warn!(
                    op = op_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn service_unavailable() -> BridgeError {
        BridgeError::RemoteStatus {
            status: 503,
            retry_after: None,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = retry(&policy(), "test", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= 2 {
                Err(service_unavailable())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Backoff 500ms then 1s between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_then_reports_unavailable() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry(&policy(), "test", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(service_unavailable())
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match result {
            Err(BridgeError::RemoteUnavailable { attempts: 4, source }) => {
                assert!(matches!(*source, BridgeError::RemoteStatus { status: 503, .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_makes_exactly_one_attempt() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry(&policy(), "test", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::Rejected {
                status: 404,
                detail: "not found".into(),
            })
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(BridgeError::Rejected { status: 404, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn server_retry_after_overrides_backoff() {
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = retry(&policy(), "test", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                Err(BridgeError::RemoteStatus {
                    status: 429,
                    retry_after: Some(Duration::from_secs(3)),
                })
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(8));
    }
}
