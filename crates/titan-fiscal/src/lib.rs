//! # titan-fiscal: Fiscal Invoice Issuance Pipeline
//!
//! Turns completed sales into invoices authorized by the tax authority (CAE).
//! The POS enqueues a sale and moves on; a scheduler runs the worker, which
//! drains due jobs in bounded batches.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         FiscalService                                   │
//! │                                                                         │
//! │   enqueue(sale_id) ──► Enqueuer ──► fiscal_queue (pending)             │
//! │                                                                         │
//! │   run_batch(max) ──► Dispatcher                                         │
//! │                        │ claim                                          │
//! │                        ▼                                                │
//! │                   InvoiceBuilder (titan-core, pure)                    │
//! │                        │                                                │
//! │                        ▼                                                │
//! │                   AuthorityClient                                       │
//! │                    ├── TicketCache (memory / redis)                    │
//! │                    ├── sequence lock per (point of sale, type)         │
//! │                    └── ResilientTransport                               │
//! │                         ├── ResponseCache                               │
//! │                         ├── RetryPolicy (adaptive timeout, backoff)    │
//! │                         └── HttpTransport ── ConnectionPool            │
//! │                        │                                                │
//! │                        ▼                                                │
//! │                   receipt + sale write-back, job completed             │
//! │                                                                         │
//! │   status(sale_id) ──► StatusQuery ──► FiscalStatusView                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`authority`] - CAE protocol: tickets, signing, wire format, client
//! - [`clock`] - Wall-clock source read at each job transition
//! - [`config`] - Pipeline configuration (TOML + environment)
//! - [`dispatcher`] - Batch runner and job transitions
//! - [`enqueue`] - Queue entry point
//! - [`error`] - Operation errors and attempt failures
//! - [`metrics`] - `metrics` facade counters and batch percentiles
//! - [`resilience`] - Retry, connection pool, response cache, stats
//! - [`status`] - Status views for callers
//! - [`store`] - Storage seams over titan-db
//! - [`transport`] - Raw request/response exchange with the authority

pub mod authority;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod enqueue;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod status;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::FiscalConfig;
pub use dispatcher::{BatchReport, DispatchPolicy, Dispatcher};
pub use error::{Failure, FiscalError, FiscalResult, RetryableError, TerminalError};

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use titan_core::{EnqueueTicket, FiscalStatusView, InvoiceBuilder, JobPriority};
use titan_db::{Database, QueueCounts};

use crate::authority::{
    AuthorityClient, AuthorityOptions, InMemoryTicketCache, RedisTicketCache, ServerStatus,
    TicketCache, TicketSigner,
};
use crate::config::TicketCacheBackend;
use crate::enqueue::Enqueuer;
use crate::resilience::pool::PoolHealth;
use crate::resilience::{ResilienceStats, ResilientTransport, StatsSnapshot};
use crate::status::StatusQuery;
use crate::store::JobQueue;
use crate::transport::HttpTransport;

/// Queue-level knobs of a [`FiscalService`].
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub dispatch: DispatchPolicy,
    /// Batch size when the caller does not give one.
    pub batch_size: u32,
    pub default_processing_ms: i64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            dispatch: DispatchPolicy::default(),
            batch_size: 10,
            default_processing_ms: titan_core::DEFAULT_PROCESSING_MS,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &FiscalConfig) -> Self {
        ServiceOptions {
            dispatch: DispatchPolicy {
                retry: config.queue.retry_schedule(),
                stale_claim_after: chrono::Duration::seconds(config.queue.stale_claim_after_secs),
            },
            batch_size: config.queue.batch_size,
            default_processing_ms: config.queue.default_processing_ms,
        }
    }
}

/// Answer of the `health` operation.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub authority: Option<ServerStatus>,
    pub authority_error: Option<String>,
    pub pool: Option<PoolHealth>,
    pub queue: Option<QueueCounts>,
    pub resilience: StatsSnapshot,
    pub database: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database && self.authority.as_ref().is_some_and(ServerStatus::is_ok)
    }
}

/// The pipeline wired together: enqueue, batch runs, status and health.
pub struct FiscalService {
    db: Database,
    queue: Arc<dyn JobQueue>,
    enqueuer: Enqueuer,
    dispatcher: Dispatcher,
    status: StatusQuery,
    authority: Arc<AuthorityClient>,
    stats: Arc<ResilienceStats>,
    batch_size: u32,
}

impl FiscalService {
    /// Builds the production stack from configuration.
    pub async fn from_config(config: &FiscalConfig, db: Database) -> FiscalResult<Self> {
        config.validate()?;
        metrics::describe();

        let stats = Arc::new(ResilienceStats::default());
        let http = HttpTransport::new(
            &config.authority.base_url,
            config.resilience.pool_size,
            config.resilience.pool_acquire_timeout(),
            stats.clone(),
        )?;
        let transport = ResilientTransport::new(
            Arc::new(http),
            config.resilience.retry_policy(),
            config.resilience.response_cache(),
            stats.clone(),
        );

        let tickets: Arc<dyn TicketCache> = match config.ticket_cache.backend {
            TicketCacheBackend::Memory => Arc::new(InMemoryTicketCache::new()),
            TicketCacheBackend::Redis => {
                let url = config.ticket_cache.redis_url.as_deref().ok_or_else(|| {
                    FiscalError::InvalidConfig("ticket_cache.redis_url is required for redis".into())
                })?;
                Arc::new(RedisTicketCache::connect(url, config.ticket_cache.key.clone()).await?)
            }
        };

        let authority = AuthorityClient::new(
            Arc::new(transport),
            tickets,
            TicketSigner::from_settings(&config.authority)?,
            AuthorityOptions::from_config(config)?,
        );
        let builder = InvoiceBuilder::new(config.issuer.to_profile()?, config.invoice.to_rules());

        info!(
            authority = %config.authority.base_url,
            point_of_sale = config.issuer.point_of_sale,
            ticket_cache = ?config.ticket_cache.backend,
            "Fiscal service ready"
        );

        Ok(Self::new(
            db,
            authority,
            builder,
            stats,
            ServiceOptions::from_config(config),
        ))
    }

    /// Wires a service around an already built authority client.
    pub fn new(
        db: Database,
        authority: AuthorityClient,
        builder: InvoiceBuilder,
        stats: Arc<ResilienceStats>,
        options: ServiceOptions,
    ) -> Self {
        let queue: Arc<dyn JobQueue> = Arc::new(db.fiscal_queue());
        let authority = Arc::new(authority);

        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(db.sales()),
            Arc::new(db.fiscal_receipts()),
            builder,
            authority.clone(),
            stats.clone(),
            options.dispatch,
        );

        FiscalService {
            enqueuer: Enqueuer::new(queue.clone(), options.default_processing_ms),
            status: StatusQuery::new(queue.clone()),
            dispatcher,
            queue,
            authority,
            stats,
            db,
            batch_size: options.batch_size,
        }
    }

    pub async fn enqueue(&self, sale_id: &str, priority: JobPriority) -> FiscalResult<EnqueueTicket> {
        self.enqueuer.enqueue(sale_id, priority).await
    }

    /// Runs one batch of at most `max_items` jobs (the configured batch size by default).
    pub async fn run_batch(&self, max_items: Option<u32>) -> FiscalResult<BatchReport> {
        self.dispatcher
            .run_batch(max_items.unwrap_or(self.batch_size))
            .await
    }

    pub async fn status(&self, sale_id: &str) -> FiscalResult<FiscalStatusView> {
        self.status.status(sale_id).await
    }

    /// Authority status, pool occupancy, queue counts and database reachability.
    ///
    /// Never fails: each check reports its own outcome.
    pub async fn health(&self) -> HealthReport {
        let (authority, authority_error) = match self.authority.server_status().await {
            Ok(status) => (Some(status), None),
            Err(e) => {
                warn!(error = %e, "Authority status check failed");
                (None, Some(e.to_string()))
            }
        };

        let queue = match self.queue.counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "Queue counts unavailable");
                None
            }
        };

        HealthReport {
            authority,
            authority_error,
            pool: self.authority.transport().pool_health(),
            queue,
            resilience: self.stats.snapshot(),
            database: self.db.health_check().await,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}
