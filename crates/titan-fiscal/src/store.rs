//! # Storage Seams
//!
//! The pipeline talks to storage through three traits so the dispatcher does
//! not depend on SQLite directly:
//!
//! - [`JobQueue`]: the fiscal queue, with the atomic `claim`
//! - [`SaleStore`]: reading sales and writing their fiscal stamp back
//! - [`ReceiptStore`]: the append-only receipt history
//!
//! The `titan-db` repositories implement all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use titan_core::{
    DocumentType, FiscalReceipt, FiscalStamp, JobError, JobPriority, JobResult, QueueJob,
    SaleRecord,
};
use titan_db::{FiscalQueueRepository, FiscalReceiptRepository, QueueCounts, SaleRepository};

use crate::error::FiscalResult;

// =============================================================================
// Traits
// =============================================================================

/// The fiscal job queue.
///
/// Transition methods return `false` when the job was not in the state they
/// expect (another worker got there first).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Inserts or resets the sale's job; a processing job is returned as-is.
    async fn upsert_pending(
        &self,
        sale_id: &str,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> FiscalResult<QueueJob>;

    async fn find_by_sale(&self, sale_id: &str) -> FiscalResult<Option<QueueJob>>;

    /// Due pending jobs in priority, then FIFO order.
    async fn find_due(&self, limit: u32, now: DateTime<Utc>) -> FiscalResult<Vec<QueueJob>>;

    /// pending → processing, atomically.
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> FiscalResult<bool>;

    async fn complete(
        &self,
        id: &str,
        result: &JobResult,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> FiscalResult<bool>;

    async fn reschedule(
        &self,
        id: &str,
        retry_count: i64,
        next_attempt_at: DateTime<Utc>,
        error: &JobError,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> FiscalResult<bool>;

    async fn fail(
        &self,
        id: &str,
        retry_count: i64,
        error: &JobError,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> FiscalResult<bool>;

    /// Returns abandoned claims older than `cutoff` to pending.
    async fn release_stale_claims(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> FiscalResult<u64>;

    /// Pending jobs that will be dispatched before `id`.
    async fn pending_ahead(&self, id: &str) -> FiscalResult<i64>;

    /// Mean processing time of recently completed jobs.
    async fn average_processing_ms(&self) -> FiscalResult<Option<f64>>;

    async fn counts(&self) -> FiscalResult<QueueCounts>;
}

/// Where completed sales live.
#[async_trait]
pub trait SaleStore: Send + Sync {
    async fn read(&self, sale_id: &str) -> FiscalResult<Option<SaleRecord>>;

    /// Mirrors the authorization onto the sale.
    async fn write_fiscal(&self, sale_id: &str, stamp: &FiscalStamp) -> FiscalResult<()>;
}

/// Append-only history of authorized documents.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Returns `false` when the same voucher was already recorded.
    async fn append(&self, receipt: &FiscalReceipt) -> FiscalResult<bool>;

    async fn latest_for_sale(&self, sale_id: &str) -> FiscalResult<Option<FiscalReceipt>>;

    /// The receipt recorded under a voucher, if any sale holds it.
    async fn find_by_voucher(
        &self,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> FiscalResult<Option<FiscalReceipt>>;
}

// =============================================================================
// SQLite Implementations
// =============================================================================

#[async_trait]
impl JobQueue for FiscalQueueRepository {
    async fn upsert_pending(
        &self,
        sale_id: &str,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> FiscalResult<QueueJob> {
        Ok(FiscalQueueRepository::upsert_pending(self, sale_id, priority, now).await?)
    }

    async fn find_by_sale(&self, sale_id: &str) -> FiscalResult<Option<QueueJob>> {
        Ok(FiscalQueueRepository::find_by_sale(self, sale_id).await?)
    }

    async fn find_due(&self, limit: u32, now: DateTime<Utc>) -> FiscalResult<Vec<QueueJob>> {
        Ok(FiscalQueueRepository::find_due(self, limit, now).await?)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> FiscalResult<bool> {
        Ok(FiscalQueueRepository::claim(self, id, now).await?)
    }

    async fn complete(
        &self,
        id: &str,
        result: &JobResult,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> FiscalResult<bool> {
        Ok(FiscalQueueRepository::complete(self, id, result, processing_ms, now).await?)
    }

    async fn reschedule(
        &self,
        id: &str,
        retry_count: i64,
        next_attempt_at: DateTime<Utc>,
        error: &JobError,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> FiscalResult<bool> {
        Ok(FiscalQueueRepository::reschedule(
            self,
            id,
            retry_count,
            next_attempt_at,
            error,
            processing_ms,
            now,
        )
        .await?)
    }

    async fn fail(
        &self,
        id: &str,
        retry_count: i64,
        error: &JobError,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> FiscalResult<bool> {
        Ok(FiscalQueueRepository::fail(self, id, retry_count, error, processing_ms, now).await?)
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> FiscalResult<u64> {
        Ok(FiscalQueueRepository::release_stale_claims(self, cutoff, now).await?)
    }

    async fn pending_ahead(&self, id: &str) -> FiscalResult<i64> {
        Ok(self.count_pending_ahead(id).await?)
    }

    async fn average_processing_ms(&self) -> FiscalResult<Option<f64>> {
        Ok(FiscalQueueRepository::average_processing_ms(self).await?)
    }

    async fn counts(&self) -> FiscalResult<QueueCounts> {
        Ok(FiscalQueueRepository::counts(self).await?)
    }
}

#[async_trait]
impl SaleStore for SaleRepository {
    async fn read(&self, sale_id: &str) -> FiscalResult<Option<SaleRecord>> {
        Ok(self.read_for_invoicing(sale_id).await?)
    }

    async fn write_fiscal(&self, sale_id: &str, stamp: &FiscalStamp) -> FiscalResult<()> {
        Ok(SaleRepository::write_fiscal(self, sale_id, stamp).await?)
    }
}

#[async_trait]
impl ReceiptStore for FiscalReceiptRepository {
    async fn append(&self, receipt: &FiscalReceipt) -> FiscalResult<bool> {
        Ok(FiscalReceiptRepository::append(self, receipt).await?)
    }

    async fn latest_for_sale(&self, sale_id: &str) -> FiscalResult<Option<FiscalReceipt>> {
        Ok(self.find_latest_by_sale(sale_id).await?)
    }

    async fn find_by_voucher(
        &self,
        point_of_sale: u32,
        document_type: DocumentType,
        number: i64,
    ) -> FiscalResult<Option<FiscalReceipt>> {
        Ok(FiscalReceiptRepository::find_by_voucher(
            self,
            i64::from(point_of_sale),
            i64::from(document_type.code()),
            number,
        )
        .await?)
    }
}
