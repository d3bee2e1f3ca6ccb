//! # Authority Transport
//!
//! The seam between the fiscal pipeline and the tax authority's web service.
//!
//! ## Endpoints
//! ```text
//! ┌──────────────────┬────────────────────────────────┬──────────────────┐
//! │ Endpoint         │ Path                           │ Cacheable        │
//! ├──────────────────┼────────────────────────────────┼──────────────────┤
//! │ ticket-grant     │ /wsaa/login                    │ never            │
//! │ invoice-submit   │ /wsfe/FECAESolicitar           │ never            │
//! │ last-voucher     │ /wsfe/FECompUltimoAutorizado   │ never            │
//! │ voucher-lookup   │ /wsfe/FECompConsultar          │ 10 min (default) │
//! │ service-status   │ /wsfe/FEDummy                  │ 30 s (default)   │
//! └──────────────────┴────────────────────────────────┴──────────────────┘
//! ```
//!
//! Bodies are JSON using the authority's own field names (see `authority::wire`).
//! [`HttpTransport`] posts them with reqwest, borrowing a client from the
//! bounded [`ConnectionPool`] and falling back to a direct client when the
//! pool cannot hand one out in time.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::FiscalResult;
use crate::resilience::pool::{ConnectionPool, PoolError, PoolHealth};
use crate::resilience::ResilienceStats;

// =============================================================================
// Endpoint
// =============================================================================

/// The authority operations the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    TicketGrant,
    InvoiceSubmit,
    LastVoucher,
    VoucherLookup,
    ServiceStatus,
}

impl Endpoint {
    pub const fn path(&self) -> &'static str {
        match self {
            Endpoint::TicketGrant => "/wsaa/login",
            Endpoint::InvoiceSubmit => "/wsfe/FECAESolicitar",
            Endpoint::LastVoucher => "/wsfe/FECompUltimoAutorizado",
            Endpoint::VoucherLookup => "/wsfe/FECompConsultar",
            Endpoint::ServiceStatus => "/wsfe/FEDummy",
        }
    }

    /// Name used in logs and error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Endpoint::TicketGrant => "ticket-grant",
            Endpoint::InvoiceSubmit => "invoice-submit",
            Endpoint::LastVoucher => "last-voucher",
            Endpoint::VoucherLookup => "voucher-lookup",
            Endpoint::ServiceStatus => "service-status",
        }
    }

    /// Only idempotent reads may be answered from the response cache.
    pub const fn is_cacheable(&self) -> bool {
        matches!(self, Endpoint::VoucherLookup | Endpoint::ServiceStatus)
    }

    /// A submission may have been authorized even when its answer was lost,
    /// so it is never repeated within one call.
    pub const fn is_idempotent(&self) -> bool {
        !matches!(self, Endpoint::InvoiceSubmit)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Transport Error
// =============================================================================

/// Raw failure of one call, before it is classified into a `Failure`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No answer within the deadline.
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// Connection refused, reset or unresolvable host.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The body was not the JSON we expected.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout { after_ms: 0 }
        } else if err.is_connect() || err.is_request() {
            TransportError::Connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// One request/response exchange with the authority.
#[async_trait]
pub trait AuthorityTransport: Send + Sync {
    async fn call(&self, endpoint: Endpoint, body: &Value) -> Result<Value, TransportError>;

    /// Pool occupancy, for transports that pool connections.
    fn pool_health(&self) -> Option<PoolHealth> {
        None
    }
}

// =============================================================================
// HTTP Transport
// =============================================================================

/// reqwest-backed transport with a bounded client pool.
pub struct HttpTransport {
    base_url: String,
    pool: ConnectionPool<reqwest::Client>,
    stats: Arc<ResilienceStats>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        pool_size: usize,
        acquire_timeout: Duration,
        stats: Arc<ResilienceStats>,
    ) -> FiscalResult<Self> {
        // Validate once so per-call URL joins cannot fail on the base.
        url::Url::parse(base_url)?;

        let pool = ConnectionPool::new(pool_size, acquire_timeout, || {
            build_client().map_err(|e| PoolError::Create(e.to_string()))
        });

        Ok(HttpTransport {
            base_url: base_url.trim_end_matches('/').to_string(),
            pool,
            stats,
        })
    }

    fn url_for(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    async fn post(
        client: &reqwest::Client,
        url: &str,
        body: &Value,
    ) -> Result<Value, TransportError> {
        let response = client.post(url).json(body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AuthorityTransport for HttpTransport {
    async fn call(&self, endpoint: Endpoint, body: &Value) -> Result<Value, TransportError> {
        let url = self.url_for(endpoint);

        match self.pool.acquire().await {
            Ok(conn) => {
                debug!(endpoint = %endpoint, slot = conn.slot(), "Calling authority");
                let result = Self::post(&conn, &url, body).await;
                conn.release();
                result
            }
            Err(e) => {
                // Pool exhaustion is not fatal: go direct with a fresh client.
                warn!(endpoint = %endpoint, error = %e, "Pool unavailable, using direct client");
                self.stats.record_pool_fallback();
                let client = build_client().map_err(|e| TransportError::Connect(e.to_string()))?;
                Self::post(&client, &url, body).await
            }
        }
    }

    fn pool_health(&self) -> Option<PoolHealth> {
        Some(self.pool.health())
    }
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("titan-fiscal/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_reads_are_cacheable() {
        assert!(Endpoint::VoucherLookup.is_cacheable());
        assert!(Endpoint::ServiceStatus.is_cacheable());
        assert!(!Endpoint::TicketGrant.is_cacheable());
        assert!(!Endpoint::LastVoucher.is_cacheable());
        assert!(!Endpoint::InvoiceSubmit.is_cacheable());
    }

    #[test]
    fn test_only_submission_is_not_idempotent() {
        assert!(!Endpoint::InvoiceSubmit.is_idempotent());
        assert!(Endpoint::LastVoucher.is_idempotent());
        assert!(Endpoint::TicketGrant.is_idempotent());
    }

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new(
            "https://gateway.example.com/",
            2,
            Duration::from_millis(100),
            Arc::new(ResilienceStats::default()),
        )
        .unwrap();

        assert_eq!(
            transport.url_for(Endpoint::LastVoucher),
            "https://gateway.example.com/wsfe/FECompUltimoAutorizado"
        );
        assert_eq!(transport.pool_health().unwrap().max, 2);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let transport = HttpTransport::new(
            "http://127.0.0.1:9",
            1,
            Duration::from_millis(100),
            Arc::new(ResilienceStats::default()),
        )
        .unwrap();

        let err = transport
            .call(Endpoint::ServiceStatus, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(transport.pool_health().unwrap().in_use, 0);
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpTransport::new(
            "not a url",
            1,
            Duration::from_millis(100),
            Arc::new(ResilienceStats::default()),
        );
        assert!(result.is_err());
    }
}
