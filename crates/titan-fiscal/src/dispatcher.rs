//! # Batch Dispatcher
//!
//! Drains due jobs from the fiscal queue, one bounded batch per invocation.
//!
//! ## Job Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_batch(max)                                                         │
//! │                                                                         │
//! │  release stale claims ──► find_due(max) ──► for each job:              │
//! │                                                                         │
//! │    claim ──── lost ────► skipped                                        │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │    read sale ─► build document ─► authorize ─► receipt + write-back    │
//! │      │                                  │                    │          │
//! │      │               Failure::Retryable │                    │ ok       │
//! │      │               ──► retry_count+1, │                    ▼          │
//! │      │                   +2/4/8 min     │               completed       │
//! │      │               Failure::Terminal  │                               │
//! │      │               ──► failed         │                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Jobs are processed sequentially. One job failing never stops the batch;
//! only failing to read the queue itself aborts a run. Overlapping runs are
//! safe because `claim` is a conditional update.
//!
//! A failed attempt stores what it sent as a [`VoucherAttempt`]. The next
//! attempt hands it to the authority client for recovery, unless the
//! voucher already sits in the receipt log under another sale.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use titan_core::retry::{RetryDecision, RetrySchedule};
use titan_core::{
    generate_local_reference, BuildContext, FiscalDocument, FiscalReceipt, FiscalStamp,
    InvoiceBuilder, JobResult, QueueJob, ReceiptStatus, SaleRecord, VoucherAttempt,
};

use crate::authority::AuthorityClient;
use crate::clock::{Clock, SystemClock};
use crate::error::{Failure, FiscalResult, TerminalError};
use crate::metrics::{self, TimingSummary};
use crate::resilience::{ResilienceStats, StatsSnapshot};
use crate::store::{JobQueue, ReceiptStore, SaleStore};

/// Outcome of one `run_batch` invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    /// Jobs that ended completed.
    pub processed: usize,
    /// Jobs whose attempt failed (rescheduled or failed for good).
    pub errors: usize,
    /// Due jobs selected.
    pub total: usize,
    /// Jobs another worker claimed first.
    pub skipped: usize,
    /// Abandoned claims returned to pending before selection.
    pub released: u64,
    pub cache_hits: u64,
    pub timing: TimingSummary,
    pub resilience: StatsSnapshot,
}

/// How the dispatcher reacts to failures.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub retry: RetrySchedule,
    /// A claim older than this belongs to a worker that died.
    pub stale_claim_after: chrono::Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy {
            retry: RetrySchedule::default(),
            stale_claim_after: chrono::Duration::minutes(10),
        }
    }
}

/// A failed attempt plus the voucher it had in play.
struct AttemptError {
    failure: Failure,
    attempt: Option<VoucherAttempt>,
}

impl AttemptError {
    fn new(failure: impl Into<Failure>, attempt: Option<VoucherAttempt>) -> Self {
        AttemptError {
            failure: failure.into(),
            attempt,
        }
    }
}

pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    sales: Arc<dyn SaleStore>,
    receipts: Arc<dyn ReceiptStore>,
    builder: InvoiceBuilder,
    authority: Arc<AuthorityClient>,
    stats: Arc<ResilienceStats>,
    policy: DispatchPolicy,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        sales: Arc<dyn SaleStore>,
        receipts: Arc<dyn ReceiptStore>,
        builder: InvoiceBuilder,
        authority: Arc<AuthorityClient>,
        stats: Arc<ResilienceStats>,
        policy: DispatchPolicy,
    ) -> Self {
        Dispatcher {
            queue,
            sales,
            receipts,
            builder,
            authority,
            stats,
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Processes up to `max_items` due jobs.
    pub async fn run_batch(&self, max_items: u32) -> FiscalResult<BatchReport> {
        let before = self.stats.snapshot();
        let mut report = BatchReport::default();
        let mut samples = Vec::new();

        let now = self.clock.now();
        let cutoff = now - self.policy.stale_claim_after;
        report.released = match self.queue.release_stale_claims(cutoff, now).await {
            Ok(released) => released,
            Err(e) => {
                warn!(error = %e, "Failed to release stale claims");
                0
            }
        };

        let jobs = self.queue.find_due(max_items, self.clock.now()).await?;
        report.total = jobs.len();
        debug!(due = jobs.len(), max_items, "Selected due fiscal jobs");

        for job in jobs {
            match self.queue.claim(&job.id, self.clock.now()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, sale_id = %job.sale_id, "Job claimed elsewhere, skipping");
                    report.skipped += 1;
                    metrics::record_skipped();
                    continue;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to claim job");
                    report.errors += 1;
                    continue;
                }
            }

            let started = Instant::now();
            let outcome = self.attempt(&job).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            samples.push(elapsed_ms);

            match outcome {
                Ok(result) => {
                    self.finish_success(&job, result, elapsed_ms).await;
                    report.processed += 1;
                }
                Err(err) => {
                    self.finish_failure(&job, err, elapsed_ms).await;
                    report.errors += 1;
                }
            }
        }

        report.timing = TimingSummary::from_samples(samples);
        report.resilience = self.stats.snapshot().since(&before);
        report.cache_hits = report.resilience.cache_hits;
        metrics::record_cache_hits(report.cache_hits);

        info!(
            total = report.total,
            processed = report.processed,
            errors = report.errors,
            skipped = report.skipped,
            p95_ms = report.timing.p95_ms,
            "Fiscal batch finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Attempt
    // =========================================================================

    async fn attempt(&self, job: &QueueJob) -> Result<JobResult, AttemptError> {
        let sale = match self.sales.read(&job.sale_id).await {
            Ok(Some(sale)) => sale,
            Ok(None) => {
                return Err(AttemptError::new(
                    TerminalError::MissingSale(job.sale_id.clone()),
                    None,
                ))
            }
            Err(e) => return Err(AttemptError::new(Failure::storage(e), None)),
        };

        if let Some(stamp) = sale.fiscal.clone() {
            info!(sale_id = %sale.id, receipt = stamp.receipt_number, "Sale already invoiced");
            return Ok(self.already_invoiced(&sale, stamp).await);
        }

        let issued_at = self.clock.now();
        let ctx = BuildContext {
            issued_at,
            local_reference: generate_local_reference(issued_at),
        };
        let mut document = self
            .builder
            .build(&sale, &ctx)
            .map_err(|e| AttemptError::new(e, None))?;

        let prior = job.voucher_attempt();
        let recoverable = self
            .recoverable(&sale, prior.clone())
            .await
            .map_err(|e| AttemptError::new(Failure::storage(e), prior.clone()))?;

        let authorized = self
            .authority
            .authorize(&mut document, recoverable.as_ref())
            .await
            .map_err(|failure| AttemptError::new(failure, document.voucher_attempt().or(prior)))?;

        let number = authorized.authorization.voucher_number;
        if let Err(e) = self.write_back(&sale, &document).await {
            error!(
                sale_id = %sale.id,
                voucher = number,
                error = %e,
                "Write-back failed after authorization"
            );
            return Err(AttemptError::new(Failure::storage(e), document.voucher_attempt()));
        }

        Ok(JobResult {
            cae: authorized.authorization.cae,
            cae_expiry: authorized.authorization.cae_expiry,
            receipt_number: number,
            document_type: document.document_type,
            point_of_sale: document.point_of_sale,
            local_reference: document.local_reference,
            recovered: authorized.recovered,
        })
    }

    /// The prior attempt, unless its voucher is recorded for another sale.
    async fn recoverable(
        &self,
        sale: &SaleRecord,
        prior: Option<VoucherAttempt>,
    ) -> FiscalResult<Option<VoucherAttempt>> {
        let Some(attempt) = prior else {
            return Ok(None);
        };

        let owner = self
            .receipts
            .find_by_voucher(attempt.point_of_sale, attempt.document_type, attempt.number)
            .await?;
        match owner {
            Some(receipt) if receipt.sale_id != sale.id => {
                warn!(
                    sale_id = %sale.id,
                    owner = %receipt.sale_id,
                    voucher = attempt.number,
                    "Earlier voucher is recorded for another sale, not recovering it"
                );
                Ok(None)
            }
            _ => Ok(Some(attempt)),
        }
    }

    /// Appends the receipt, then mirrors the stamp onto the sale.
    async fn write_back(&self, sale: &SaleRecord, document: &FiscalDocument) -> FiscalResult<()> {
        let stamp = document.fiscal_stamp().ok_or_else(|| {
            crate::error::FiscalError::SerializationFailed("document is not stamped".into())
        })?;

        let receipt = FiscalReceipt {
            id: Uuid::new_v4().to_string(),
            sale_id: sale.id.clone(),
            document_type: i64::from(document.document_type.code()),
            point_of_sale: i64::from(document.point_of_sale),
            receipt_number: stamp.receipt_number,
            cae: stamp.cae.clone(),
            cae_expiry: stamp.cae_expiry,
            snapshot: serde_json::to_string(document)?,
            status: ReceiptStatus::Issued,
            created_at: self.clock.now(),
        };

        if !self.receipts.append(&receipt).await? {
            debug!(sale_id = %sale.id, receipt = receipt.receipt_number, "Receipt already recorded");
        }
        self.sales.write_fiscal(&sale.id, &stamp).await
    }

    /// Result for a sale stamped by an earlier run that never completed its job.
    async fn already_invoiced(&self, sale: &SaleRecord, stamp: FiscalStamp) -> JobResult {
        let receipt = match self.receipts.latest_for_sale(&sale.id).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(sale_id = %sale.id, error = %e, "Could not read receipt history");
                None
            }
        };

        let point_of_sale = receipt
            .as_ref()
            .and_then(|r| u32::try_from(r.point_of_sale).ok())
            .unwrap_or(self.builder.issuer().point_of_sale);
        let local_reference = receipt
            .and_then(|r| serde_json::from_str::<FiscalDocument>(&r.snapshot).ok())
            .map(|doc| doc.local_reference)
            .unwrap_or_default();

        JobResult {
            cae: stamp.cae,
            cae_expiry: stamp.cae_expiry,
            receipt_number: stamp.receipt_number,
            document_type: stamp.document_type,
            point_of_sale,
            local_reference,
            recovered: true,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    async fn finish_success(&self, job: &QueueJob, result: JobResult, elapsed_ms: f64) {
        metrics::record_processed(elapsed_ms);

        let now = self.clock.now();
        match self.queue.complete(&job.id, &result, elapsed_ms as i64, now).await {
            Ok(true) => info!(
                job_id = %job.id,
                sale_id = %job.sale_id,
                receipt = result.receipt_number,
                cae = %result.cae,
                recovered = result.recovered,
                "Fiscal job completed"
            ),
            Ok(false) => warn!(job_id = %job.id, "Job left processing before completion"),
            // The stamp is already on the sale; a later run completes the job.
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job completed"),
        }
    }

    async fn finish_failure(&self, job: &QueueJob, err: AttemptError, elapsed_ms: f64) {
        let AttemptError { failure, attempt } = err;
        let now = self.clock.now();
        let payload = failure.to_job_error(attempt.as_ref(), now);
        let ms = elapsed_ms as i64;
        metrics::record_failed(failure.kind(), failure.is_retryable(), elapsed_ms);

        let transition = if failure.is_retryable() {
            match self.policy.retry.after_failure(job.retry_count) {
                RetryDecision::Reschedule { retry_count, delay } => {
                    let next_attempt_at = now + delay;
                    warn!(
                        job_id = %job.id,
                        sale_id = %job.sale_id,
                        retry_count,
                        next_attempt_at = %next_attempt_at,
                        error = %failure,
                        "Fiscal attempt failed, rescheduled"
                    );
                    self.queue
                        .reschedule(&job.id, retry_count, next_attempt_at, &payload, ms, now)
                        .await
                }
                RetryDecision::GiveUp { retry_count } => {
                    error!(
                        job_id = %job.id,
                        sale_id = %job.sale_id,
                        retry_count,
                        error = %failure,
                        "Fiscal job failed, retries exhausted"
                    );
                    self.queue.fail(&job.id, retry_count, &payload, ms, now).await
                }
            }
        } else {
            error!(
                job_id = %job.id,
                sale_id = %job.sale_id,
                kind = failure.kind(),
                error = %failure,
                "Fiscal job failed"
            );
            self.queue.fail(&job.id, job.retry_count, &payload, ms, now).await
        };

        match transition {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "Job left processing before its failure was recorded"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use titan_core::{DocumentType, JobPriority, JobStatus};
    use titan_db::{Database, DbConfig, FiscalQueueRepository, QueueCounts, SaleRepository};

    use crate::authority::{InMemoryTicketCache, TicketSigner};
    use crate::clock::MockClock;
    use crate::enqueue::Enqueuer;
    use crate::error::FiscalError;
    use crate::resilience::cache::ResponseCache;
    use crate::resilience::retry::RetryPolicy;
    use crate::resilience::ResilientTransport;
    use crate::test_support::{
        sample_sale, test_issuer, test_options, FakeAuthority, Scripted, TEST_CAE,
    };
    use titan_core::InvoiceRules;

    struct Harness {
        db: Database,
        fake: Arc<FakeAuthority>,
        clock: Arc<MockClock>,
        enqueuer: Enqueuer,
        dispatcher: Dispatcher,
    }

    impl Harness {
        async fn run_at(&self, max_items: u32, at: DateTime<Utc>) -> BatchReport {
            self.clock.set(at);
            self.dispatcher.run_batch(max_items).await.unwrap()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..RetryPolicy::default()
        }
    }

    async fn harness_with(db: Database, queue: Arc<dyn JobQueue>, sales: Arc<dyn SaleStore>) -> Harness {
        harness_with_clock(db, queue, sales, Arc::new(MockClock::default())).await
    }

    async fn harness_with_clock(
        db: Database,
        queue: Arc<dyn JobQueue>,
        sales: Arc<dyn SaleStore>,
        clock: Arc<MockClock>,
    ) -> Harness {
        let fake = FakeAuthority::new();
        let stats = Arc::new(ResilienceStats::default());
        let transport = ResilientTransport::new(
            fake.clone(),
            fast_policy(),
            ResponseCache::disabled(),
            stats.clone(),
        );
        let authority = AuthorityClient::new(
            Arc::new(transport),
            Arc::new(InMemoryTicketCache::new()),
            TicketSigner::hmac(b"test-secret"),
            test_options(),
        );

        let dispatcher = Dispatcher::new(
            queue.clone(),
            sales,
            Arc::new(db.fiscal_receipts()),
            InvoiceBuilder::new(test_issuer(), InvoiceRules::default()),
            Arc::new(authority),
            stats,
            DispatchPolicy::default(),
        )
        .with_clock(clock.clone());

        Harness {
            enqueuer: Enqueuer::new(queue, titan_core::DEFAULT_PROCESSING_MS),
            db,
            fake,
            clock,
            dispatcher,
        }
    }

    async fn harness() -> Harness {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue: Arc<dyn JobQueue> = Arc::new(db.fiscal_queue());
        let sales: Arc<dyn SaleStore> = Arc::new(db.sales());
        harness_with(db, queue, sales).await
    }

    async fn job(h: &Harness, sale_id: &str) -> QueueJob {
        h.db.fiscal_queue().find_by_sale(sale_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_sale_is_invoiced_end_to_end() {
        let h = harness().await;
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();

        let ticket = h.enqueuer.enqueue("42", JobPriority::High).await.unwrap();
        assert_eq!(ticket.status, JobStatus::Pending);

        let report = h.dispatcher.run_batch(10).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.timing.count, 1);

        let job = job(&h, "42").await;
        assert_eq!(job.status, JobStatus::Completed);
        let result = job.result().unwrap();
        assert_eq!(result.cae, TEST_CAE);
        assert_eq!(result.receipt_number, 1);
        assert!(!result.recovered);

        let sale = h.db.sales().read_for_invoicing("42").await.unwrap().unwrap();
        let stamp = sale.fiscal.unwrap();
        assert_eq!(stamp.cae, TEST_CAE);
        assert_eq!(stamp.receipt_number, 1);
        assert_eq!(stamp.document_type, DocumentType::FacturaB);

        let receipts = h.db.fiscal_receipts().list_by_sale("42").await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].cae, TEST_CAE);
    }

    #[tokio::test]
    async fn test_always_timing_out_authority_fails_after_four_attempts() {
        let h = harness().await;
        h.fake.fail_every_submit(Scripted::Timeout);
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();

        let t0 = Utc::now();
        h.enqueuer
            .enqueue_at("42", JobPriority::High, t0)
            .await
            .unwrap();

        let mut at = t0;
        for (expected_retry, delay_min) in [(1, 2), (2, 4), (3, 8)] {
            let report = h.run_at(10, at).await;
            assert_eq!(report.errors, 1);

            let job = job(&h, "42").await;
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_count, expected_retry);
            assert_eq!(job.next_attempt_at, at + chrono::Duration::minutes(delay_min));

            let error = job.last_error().unwrap();
            assert_eq!(error.kind, "timeout");
            assert!(error.retryable);
            assert_eq!(error.attempted_voucher, Some(1));

            // Not due yet.
            let early = h.run_at(10, at + chrono::Duration::seconds(30)).await;
            assert_eq!(early.total, 0);

            at = job.next_attempt_at;
        }

        h.run_at(10, at).await;
        let job = job(&h, "42").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 4);
        assert_eq!(h.fake.submissions(), 4);

        let later = h.run_at(10, at + chrono::Duration::hours(1)).await;
        assert_eq!(later.total, 0);

        let sale = h.db.sales().read_for_invoicing("42").await.unwrap().unwrap();
        assert!(sale.fiscal.is_none());
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let h = harness().await;
        let t0 = Utc::now();
        for (i, (sale_id, priority)) in [
            ("low", JobPriority::Low),
            ("normal", JobPriority::Normal),
            ("high-1", JobPriority::High),
            ("high-2", JobPriority::High),
        ]
        .into_iter()
        .enumerate()
        {
            h.db.sales().insert(&sample_sale(sale_id, 1_000)).await.unwrap();
            h.enqueuer
                .enqueue_at(sale_id, priority, t0 + chrono::Duration::milliseconds(i as i64))
                .await
                .unwrap();
        }

        let now = t0 + chrono::Duration::seconds(1);
        let report = h.run_at(3, now).await;
        assert_eq!(report.processed, 3);

        assert_eq!(job(&h, "high-1").await.result().unwrap().receipt_number, 1);
        assert_eq!(job(&h, "high-2").await.result().unwrap().receipt_number, 2);
        assert_eq!(job(&h, "normal").await.result().unwrap().receipt_number, 3);
        assert_eq!(job(&h, "low").await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejection_fails_immediately() {
        let h = harness().await;
        h.fake.script_submit([Scripted::Reject(10015, "DocNro invalido")]);
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();
        h.enqueuer.enqueue("42", JobPriority::Normal).await.unwrap();

        let report = h.dispatcher.run_batch(10).await.unwrap();
        assert_eq!(report.errors, 1);

        let job = job(&h, "42").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        let error = job.last_error().unwrap();
        assert_eq!(error.kind, "rejected");
        assert!(!error.retryable);
        assert_eq!(error.authority_messages[0].code, 10015);
    }

    #[tokio::test]
    async fn test_lost_response_is_recovered_on_next_attempt() {
        let h = harness().await;
        h.fake.script_submit([Scripted::AuthorizeThenTimeout]);
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();

        let t0 = Utc::now();
        h.enqueuer.enqueue_at("42", JobPriority::Normal, t0).await.unwrap();

        h.run_at(10, t0).await;
        let pending = job(&h, "42").await;
        assert_eq!(pending.attempted_voucher(), Some(1));

        h.run_at(10, pending.next_attempt_at).await;
        let done = job(&h, "42").await;
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result().unwrap();
        assert!(result.recovered);
        assert_eq!(result.receipt_number, 1);
        assert_eq!(h.fake.submissions(), 1);

        let sale = h.db.sales().read_for_invoicing("42").await.unwrap().unwrap();
        assert_eq!(sale.fiscal.unwrap().receipt_number, 1);
    }

    #[tokio::test]
    async fn test_voucher_taken_by_another_sale_is_not_adopted() {
        let h = harness().await;
        h.fake.script_submit([Scripted::Timeout]);
        h.db.sales().insert(&sample_sale("a", 12_100)).await.unwrap();
        h.db.sales().insert(&sample_sale("b", 12_100)).await.unwrap();

        let t0 = Utc::now();
        h.enqueuer.enqueue_at("a", JobPriority::Normal, t0).await.unwrap();
        h.run_at(10, t0).await;
        let a = job(&h, "a").await;
        assert_eq!(a.status, JobStatus::Pending);
        let attempt = a.voucher_attempt().unwrap();
        assert_eq!(attempt.number, 1);
        assert!(!attempt.local_reference.is_empty());

        // A second final-consumer sale with the same total gets number 1.
        let t1 = t0 + chrono::Duration::seconds(1);
        h.enqueuer.enqueue_at("b", JobPriority::Normal, t1).await.unwrap();
        h.run_at(10, t1).await;
        assert_eq!(job(&h, "b").await.result().unwrap().receipt_number, 1);

        h.run_at(10, a.next_attempt_at).await;
        let done = job(&h, "a").await;
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result().unwrap();
        assert!(!result.recovered);
        assert_eq!(result.receipt_number, 2);
        assert_eq!(h.fake.submissions(), 3);
        assert_eq!(h.fake.lookups(), 0);

        let a_receipts = h.db.fiscal_receipts().list_by_sale("a").await.unwrap();
        assert_eq!(a_receipts.len(), 1);
        assert_eq!(a_receipts[0].receipt_number, 2);
        let b_sale = h.db.sales().read_for_invoicing("b").await.unwrap().unwrap();
        assert_eq!(b_sale.fiscal.unwrap().receipt_number, 1);
    }

    #[tokio::test]
    async fn test_missing_sale_and_build_errors_are_terminal() {
        let h = harness().await;
        let mut dollars = sample_sale("usd", 1_000);
        dollars.currency = "USD".into();
        h.db.sales().insert(&dollars).await.unwrap();

        h.enqueuer.enqueue("ghost", JobPriority::Normal).await.unwrap();
        h.enqueuer.enqueue("usd", JobPriority::Normal).await.unwrap();

        let report = h.dispatcher.run_batch(10).await.unwrap();
        assert_eq!(report.errors, 2);

        assert_eq!(job(&h, "ghost").await.last_error().unwrap().kind, "missing_sale");
        let usd = job(&h, "usd").await;
        assert_eq!(usd.status, JobStatus::Failed);
        assert_eq!(usd.last_error().unwrap().kind, "unsupported_currency");
        assert_eq!(h.fake.submissions(), 0);
    }

    #[tokio::test]
    async fn test_already_invoiced_sale_completes_without_authority() {
        let h = harness().await;
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();
        h.enqueuer.enqueue("42", JobPriority::Normal).await.unwrap();
        h.dispatcher.run_batch(10).await.unwrap();

        h.enqueuer.enqueue("42", JobPriority::Normal).await.unwrap();
        let report = h.dispatcher.run_batch(10).await.unwrap();
        assert_eq!(report.processed, 1);

        let result = job(&h, "42").await.result().unwrap();
        assert!(result.recovered);
        assert_eq!(result.cae, TEST_CAE);
        assert!(!result.local_reference.is_empty());
        assert_eq!(h.fake.submissions(), 1);
    }

    /// Claims every job it hands out, as a concurrent worker would.
    struct RacingQueue(FiscalQueueRepository);

    #[async_trait]
    impl JobQueue for RacingQueue {
        async fn upsert_pending(&self, sale_id: &str, priority: JobPriority, now: DateTime<Utc>) -> FiscalResult<QueueJob> {
            JobQueue::upsert_pending(&self.0, sale_id, priority, now).await
        }
        async fn find_by_sale(&self, sale_id: &str) -> FiscalResult<Option<QueueJob>> {
            JobQueue::find_by_sale(&self.0, sale_id).await
        }
        async fn find_due(&self, limit: u32, now: DateTime<Utc>) -> FiscalResult<Vec<QueueJob>> {
            let jobs = JobQueue::find_due(&self.0, limit, now).await?;
            for job in &jobs {
                JobQueue::claim(&self.0, &job.id, now).await?;
            }
            Ok(jobs)
        }
        async fn claim(&self, id: &str, now: DateTime<Utc>) -> FiscalResult<bool> {
            JobQueue::claim(&self.0, id, now).await
        }
        async fn complete(&self, id: &str, result: &JobResult, ms: i64, now: DateTime<Utc>) -> FiscalResult<bool> {
            JobQueue::complete(&self.0, id, result, ms, now).await
        }
        async fn reschedule(
            &self,
            id: &str,
            retry_count: i64,
            next_attempt_at: DateTime<Utc>,
            error: &titan_core::JobError,
            ms: i64,
            now: DateTime<Utc>,
        ) -> FiscalResult<bool> {
            JobQueue::reschedule(&self.0, id, retry_count, next_attempt_at, error, ms, now).await
        }
        async fn fail(&self, id: &str, retry_count: i64, error: &titan_core::JobError, ms: i64, now: DateTime<Utc>) -> FiscalResult<bool> {
            JobQueue::fail(&self.0, id, retry_count, error, ms, now).await
        }
        async fn release_stale_claims(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> FiscalResult<u64> {
            JobQueue::release_stale_claims(&self.0, cutoff, now).await
        }
        async fn pending_ahead(&self, id: &str) -> FiscalResult<i64> {
            JobQueue::pending_ahead(&self.0, id).await
        }
        async fn average_processing_ms(&self) -> FiscalResult<Option<f64>> {
            JobQueue::average_processing_ms(&self.0).await
        }
        async fn counts(&self) -> FiscalResult<QueueCounts> {
            JobQueue::counts(&self.0).await
        }
    }

    #[tokio::test]
    async fn test_lost_claims_are_skipped() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let racing: Arc<dyn JobQueue> = Arc::new(RacingQueue(db.fiscal_queue()));
        let sales: Arc<dyn SaleStore> = Arc::new(db.sales());
        let h = harness_with(db, racing, sales).await;
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();
        h.enqueuer.enqueue("42", JobPriority::Normal).await.unwrap();

        let report = h.dispatcher.run_batch(10).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(h.fake.submissions(), 0);

        assert_eq!(job(&h, "42").await.status, JobStatus::Processing);
    }

    /// Fails the first `write_fiscal` calls.
    struct FlakySales {
        inner: SaleRepository,
        failures: AtomicU32,
    }

    #[async_trait]
    impl SaleStore for FlakySales {
        async fn read(&self, sale_id: &str) -> FiscalResult<Option<SaleRecord>> {
            SaleStore::read(&self.inner, sale_id).await
        }

        async fn write_fiscal(&self, sale_id: &str, stamp: &FiscalStamp) -> FiscalResult<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FiscalError::DatabaseError("database is locked".into()));
            }
            SaleStore::write_fiscal(&self.inner, sale_id, stamp).await
        }
    }

    #[tokio::test]
    async fn test_write_back_failure_retries_and_recovers() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let flaky: Arc<dyn SaleStore> = Arc::new(FlakySales {
            inner: db.sales(),
            failures: AtomicU32::new(1),
        });
        let queue: Arc<dyn JobQueue> = Arc::new(db.fiscal_queue());
        let h = harness_with(db, queue, flaky).await;
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();

        let t0 = Utc::now();
        h.enqueuer.enqueue_at("42", JobPriority::Normal, t0).await.unwrap();
        h.run_at(10, t0).await;

        let pending = job(&h, "42").await;
        assert_eq!(pending.status, JobStatus::Pending);
        let error = pending.last_error().unwrap();
        assert_eq!(error.kind, "storage");
        assert_eq!(error.attempted_voucher, Some(1));

        h.run_at(10, pending.next_attempt_at).await;

        let done = job(&h, "42").await;
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.result().unwrap().recovered);
        assert_eq!(h.fake.submissions(), 1);

        let sale = h.db.sales().read_for_invoicing("42").await.unwrap().unwrap();
        assert_eq!(sale.fiscal.unwrap().cae, TEST_CAE);
    }

    /// Each read costs 90 seconds of clock time; notes when each job was claimed.
    struct SlowSales {
        inner: SaleRepository,
        queue: FiscalQueueRepository,
        clock: Arc<MockClock>,
        claimed_at: parking_lot::Mutex<HashMap<String, DateTime<Utc>>>,
    }

    #[async_trait]
    impl SaleStore for SlowSales {
        async fn read(&self, sale_id: &str) -> FiscalResult<Option<SaleRecord>> {
            if let Some(job) = JobQueue::find_by_sale(&self.queue, sale_id).await? {
                self.claimed_at.lock().insert(sale_id.to_string(), job.updated_at);
            }
            self.clock.advance(chrono::Duration::seconds(90));
            SaleStore::read(&self.inner, sale_id).await
        }

        async fn write_fiscal(&self, sale_id: &str, stamp: &FiscalStamp) -> FiscalResult<()> {
            SaleStore::write_fiscal(&self.inner, sale_id, stamp).await
        }
    }

    #[tokio::test]
    async fn test_transitions_use_the_time_they_happen() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let clock = Arc::new(MockClock::default());
        let slow = Arc::new(SlowSales {
            inner: db.sales(),
            queue: db.fiscal_queue(),
            clock: clock.clone(),
            claimed_at: parking_lot::Mutex::new(HashMap::new()),
        });
        let queue: Arc<dyn JobQueue> = Arc::new(db.fiscal_queue());
        let h = harness_with_clock(db, queue, slow.clone(), clock).await;
        h.fake.fail_every_submit(Scripted::Timeout);
        h.db.sales().insert(&sample_sale("a", 12_100)).await.unwrap();
        h.db.sales().insert(&sample_sale("b", 12_100)).await.unwrap();

        let t0 = Utc::now();
        h.enqueuer.enqueue_at("a", JobPriority::High, t0).await.unwrap();
        h.enqueuer.enqueue_at("b", JobPriority::Normal, t0).await.unwrap();

        let report = h.run_at(10, t0).await;
        assert_eq!(report.errors, 2);

        let step = chrono::Duration::seconds(90);
        let retry_delay = chrono::Duration::minutes(2);
        {
            let claimed_at = slow.claimed_at.lock();
            assert_eq!(claimed_at["a"], t0);
            assert_eq!(claimed_at["b"], t0 + step);
        }

        let a = job(&h, "a").await;
        assert_eq!(a.updated_at, t0 + step);
        assert_eq!(a.next_attempt_at, t0 + step + retry_delay);
        assert_eq!(a.last_error().unwrap().timestamp, t0 + step);

        let b = job(&h, "b").await;
        assert_eq!(b.updated_at, t0 + step * 2);
        assert_eq!(b.next_attempt_at, t0 + step * 2 + retry_delay);
    }

    #[tokio::test]
    async fn test_stale_claim_is_released() {
        let h = harness().await;
        h.db.sales().insert(&sample_sale("42", 12_100)).await.unwrap();

        let t0 = Utc::now();
        let ticket = h.enqueuer.enqueue_at("42", JobPriority::Normal, t0).await.unwrap();
        assert!(h.db.fiscal_queue().claim(&ticket.queue_id, t0).await.unwrap());

        let soon = h.run_at(10, t0 + chrono::Duration::minutes(1)).await;
        assert_eq!(soon.total, 0);

        let later = h.run_at(10, t0 + chrono::Duration::minutes(11)).await;
        assert_eq!(later.released, 1);
        assert_eq!(later.processed, 1);
    }
}
