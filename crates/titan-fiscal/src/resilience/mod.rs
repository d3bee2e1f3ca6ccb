//! # Resilience Layer
//!
//! Everything between the authority client and the raw transport.
//!
//! ## Call Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ResilientTransport::call                           │
//! │                                                                         │
//! │   ┌──────────────┐  hit   ┌──────────────────────────────────────────┐ │
//! │   │ ResponseCache│───────►│ return cached body (lookup/status only)  │ │
//! │   └──────┬───────┘        └──────────────────────────────────────────┘ │
//! │          │ miss                                                         │
//! │          ▼                                                              │
//! │   ┌──────────────┐  attempt n: timeout = adaptive_timeout(base, n)     │
//! │   │ RetryPolicy  │  retryable error → backoff sleep → attempt n+1      │
//! │   └──────┬───────┘  terminal error  → return immediately               │
//! │          │                                                              │
//! │          ▼                                                              │
//! │   ┌──────────────┐  pooled client, or a direct one when the pool      │
//! │   │ HttpTransport│  cannot hand one out in time                        │
//! │   └──────────────┘                                                      │
//! │                                                                         │
//! │   ResilienceStats counts attempts, retries, timeouts, cache hits and   │
//! │   pool fallbacks across all of the above.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod pool;
pub mod retry;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::transport::{AuthorityTransport, Endpoint, TransportError};
use cache::ResponseCache;
use pool::PoolHealth;
use retry::RetryPolicy;

/// Lower bound of any single attempt.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound of any single attempt.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Classification
// =============================================================================

/// True for failures that may succeed if tried again.
///
/// ## Retryable
/// - Timeouts
/// - Connection failures and resets
/// - HTTP 502, 503, 504
/// - Bodies mentioning "temporarily unavailable" or "service unavailable"
///
/// Everything else is terminal.
pub fn is_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::Timeout { .. } | TransportError::Connect(_) => true,
        TransportError::Http { status, body } => {
            matches!(status, 502..=504) || mentions_unavailable(body)
        }
        TransportError::Decode(message) => mentions_unavailable(message),
    }
}

pub(crate) fn mentions_unavailable(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("temporarily unavailable") || text.contains("service unavailable")
}

/// Timeout for the given 1-based attempt: base × (1 + 0.5 × (attempt − 1)),
/// clamped to [5 s, 30 s].
pub fn adaptive_timeout(base: Duration, attempt: u32) -> Duration {
    let factor = 1.0 + 0.5 * f64::from(attempt.saturating_sub(1));
    base.mul_f64(factor).clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

// =============================================================================
// Stats
// =============================================================================

/// Counters shared by the retry policy, cache and transport.
#[derive(Debug, Default)]
pub struct ResilienceStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    pool_fallbacks: AtomicU64,
}

/// Point-in-time copy of [`ResilienceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pool_fallbacks: u64,
}

impl ResilienceStats {
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_fallback(&self) {
        self.pool_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            pool_fallbacks: self.pool_fallbacks.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.saturating_sub(earlier.attempts),
            retries: self.retries.saturating_sub(earlier.retries),
            timeouts: self.timeouts.saturating_sub(earlier.timeouts),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            cache_misses: self.cache_misses.saturating_sub(earlier.cache_misses),
            pool_fallbacks: self.pool_fallbacks.saturating_sub(earlier.pool_fallbacks),
        }
    }
}

// =============================================================================
// Resilient Transport
// =============================================================================

/// Wraps a transport with the response cache and the retry policy.
pub struct ResilientTransport {
    inner: Arc<dyn AuthorityTransport>,
    policy: RetryPolicy,
    cache: ResponseCache,
    stats: Arc<ResilienceStats>,
}

impl ResilientTransport {
    pub fn new(
        inner: Arc<dyn AuthorityTransport>,
        policy: RetryPolicy,
        cache: ResponseCache,
        stats: Arc<ResilienceStats>,
    ) -> Self {
        ResilientTransport {
            inner,
            policy,
            cache,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ResilienceStats> {
        &self.stats
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }
}

#[async_trait]
impl AuthorityTransport for ResilientTransport {
    async fn call(&self, endpoint: Endpoint, body: &Value) -> Result<Value, TransportError> {
        if endpoint.is_cacheable() {
            if let Some(cached) = self.cache.get(endpoint, body) {
                self.stats.record_cache_hit();
                debug!(endpoint = %endpoint, "Served from response cache");
                return Ok(cached);
            }
            self.stats.record_cache_miss();
        }

        let inner = &self.inner;
        let response = self
            .policy
            .run(endpoint, &self.stats, |_| inner.call(endpoint, body))
            .await?;

        self.cache.put(endpoint, body, &response);
        Ok(response)
    }

    fn pool_health(&self) -> Option<PoolHealth> {
        self.inner.pool_health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::CachePolicy;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&TransportError::Timeout { after_ms: 5000 }));
        assert!(is_retryable(&TransportError::Connect("reset by peer".into())));
        for status in [502, 503, 504] {
            assert!(is_retryable(&TransportError::Http {
                status,
                body: String::new()
            }));
        }
        assert!(is_retryable(&TransportError::Http {
            status: 500,
            body: "Service Unavailable, try later".into()
        }));
        assert!(is_retryable(&TransportError::Decode(
            "Temporarily unavailable".into()
        )));

        assert!(!is_retryable(&TransportError::Http {
            status: 500,
            body: "NullPointerException".into()
        }));
        assert!(!is_retryable(&TransportError::Http {
            status: 400,
            body: String::new()
        }));
        assert!(!is_retryable(&TransportError::Decode("expected value".into())));
    }

    #[test]
    fn test_adaptive_timeout() {
        let base = Duration::from_secs(10);
        assert_eq!(adaptive_timeout(base, 1), Duration::from_secs(10));
        assert_eq!(adaptive_timeout(base, 2), Duration::from_secs(15));
        assert_eq!(adaptive_timeout(base, 3), Duration::from_secs(20));
        assert_eq!(adaptive_timeout(base, 6), Duration::from_secs(30));

        // Clamped at both ends
        assert_eq!(adaptive_timeout(Duration::from_secs(1), 1), MIN_TIMEOUT);
        assert_eq!(adaptive_timeout(Duration::from_secs(60), 1), MAX_TIMEOUT);
    }

    #[test]
    fn test_snapshot_delta() {
        let stats = ResilienceStats::default();
        stats.record_cache_hit();
        let before = stats.snapshot();
        stats.record_cache_hit();
        stats.record_attempt();

        let delta = stats.snapshot().since(&before);
        assert_eq!(delta.cache_hits, 1);
        assert_eq!(delta.attempts, 1);
        assert_eq!(delta.retries, 0);
    }

    struct Scripted {
        replies: Mutex<VecDeque<Result<Value, TransportError>>>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl AuthorityTransport for Scripted {
        async fn call(&self, _: Endpoint, _: &Value) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"ok": true})))
        }
    }

    fn resilient(replies: Vec<Result<Value, TransportError>>) -> (ResilientTransport, Arc<Scripted>) {
        let scripted = Arc::new(Scripted {
            replies: Mutex::new(replies.into()),
            calls: AtomicU64::new(0),
        });
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let transport = ResilientTransport::new(
            scripted.clone(),
            policy,
            ResponseCache::new(CachePolicy::default()),
            Arc::new(ResilienceStats::default()),
        );
        (transport, scripted)
    }

    #[tokio::test]
    async fn test_cacheable_read_hits_wire_once() {
        let (transport, scripted) = resilient(vec![]);
        let body = json!({"CbteNro": 7});

        transport.call(Endpoint::VoucherLookup, &body).await.unwrap();
        transport.call(Endpoint::VoucherLookup, &body).await.unwrap();

        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
        let snapshot = transport.stats().snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_last_voucher_is_never_cached() {
        let (transport, scripted) = resilient(vec![]);
        let body = json!({"PtoVta": 3});

        transport.call(Endpoint::LastVoucher, &body).await.unwrap();
        transport.call(Endpoint::LastVoucher, &body).await.unwrap();

        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.stats().snapshot().cache_hits, 0);
    }

    #[tokio::test]
    async fn test_failed_calls_are_not_cached() {
        let (transport, scripted) = resilient(vec![Err(TransportError::Http {
            status: 404,
            body: String::new(),
        })]);
        let body = json!({});

        assert!(transport.call(Endpoint::ServiceStatus, &body).await.is_err());
        assert!(transport.call(Endpoint::ServiceStatus, &body).await.is_ok());
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_through_transient_failures() {
        let (transport, scripted) = resilient(vec![
            Err(TransportError::Http {
                status: 503,
                body: String::new(),
            }),
            Err(TransportError::Connect("reset".into())),
        ]);

        let reply = transport
            .call(Endpoint::LastVoucher, &json!({}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"ok": true}));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.stats().snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_submission_failure_surfaces_immediately() {
        let (transport, scripted) = resilient(vec![Err(TransportError::Http {
            status: 503,
            body: String::new(),
        })]);

        let err = transport
            .call(Endpoint::InvoiceSubmit, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Http { status: 503, .. }));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    }
}
