//! In-call retry with adaptive timeouts.
//!
//! One authority call is tried up to `max_attempts` times. Every attempt is
//! bounded by [`adaptive_timeout`]; between attempts the policy sleeps for the
//! next exponential backoff interval (no randomization, so delays are exact).
//! Terminal errors return immediately.
//!
//! This is the short, in-call loop. The long queue-level schedule (2, 4, 8
//! minutes) lives in `titan_core::retry` and kicks in once this gives up.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{adaptive_timeout, is_retryable, ResilienceStats};
use crate::transport::{Endpoint, TransportError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Timeout of the first attempt, before the adaptive growth.
    pub base_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn create_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    /// Runs `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Non-idempotent endpoints get
    /// a single attempt; the caller recovers them at the job level.
    pub async fn run<T, F, Fut>(
        &self,
        endpoint: Endpoint,
        stats: &ResilienceStats,
        mut op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = if endpoint.is_idempotent() {
            self.max_attempts.max(1)
        } else {
            1
        };
        let mut backoff = self.create_backoff();
        let mut attempt = 1;

        loop {
            let timeout = adaptive_timeout(self.base_timeout, attempt);
            stats.record_attempt();

            let result = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => {
                    stats.record_timeout();
                    Err(TransportError::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    })
                }
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) {
                debug!(endpoint = %endpoint, attempt, error = %err, "Terminal transport error");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(endpoint = %endpoint, attempts = attempt, error = %err, "Giving up on call");
                return Err(err);
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
            warn!(
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying authority call"
            );
            stats.record_retry();
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_errors() {
        let stats = ResilienceStats::default();
        let calls = AtomicU32::new(0);

        let result = fast_policy()
            .run(Endpoint::LastVoucher, &stats, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TransportError::Connect("reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let stats = ResilienceStats::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = fast_policy()
            .run(Endpoint::InvoiceSubmit, &stats, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransportError::Http {
                        status: 400,
                        body: "bad request".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(TransportError::Http { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_is_attempted_once() {
        let stats = ResilienceStats::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = fast_policy()
            .run(Endpoint::InvoiceSubmit, &stats, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Connect("reset".into())) }
            })
            .await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_a_longer_timeout() {
        let stats = ResilienceStats::default();
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = fast_policy()
            .run(Endpoint::ServiceStatus, &stats, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(TransportError::Timeout { after_ms: 20_000 })));
        // 10s + 15s + 20s of timeouts, 100ms + 200ms of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45_300));
        assert!(elapsed < Duration::from_millis(45_400));
        assert_eq!(stats.snapshot().timeouts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_are_exact() {
        let stats = ResilienceStats::default();
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = fast_policy()
            .run(Endpoint::LastVoucher, &stats, |_| async {
                Err(TransportError::Http {
                    status: 503,
                    body: String::new(),
                })
            })
            .await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(350));
    }
}
