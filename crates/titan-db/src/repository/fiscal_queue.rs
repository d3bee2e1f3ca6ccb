//! # Fiscal Queue Repository
//!
//! Storage for the job queue that drives invoice issuance.
//!
//! ## State Transitions (all guarded in SQL)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  upsert_pending ── INSERT … ON CONFLICT(sale_id) DO UPDATE              │
//! │                    … WHERE status != 'processing'                       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │    pending ── claim ── UPDATE … WHERE id = ? AND status = 'pending'     │
//! │        ▲                 │   (0 rows → someone else has it)             │
//! │        │                 ▼                                              │
//! │        │            processing                                          │
//! │        │                 │                                              │
//! │        └─ reschedule ────┼─── complete ──► completed                    │
//! │                          └─── fail ──────► failed                       │
//! │                                                                         │
//! │  complete / reschedule / fail only apply to a processing row.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//! Due jobs come out by priority rank (high=1, normal=2, low=3), then
//! `created_at`, then rowid so that insertion order breaks exact ties.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use titan_core::{JobError, JobPriority, JobResult, QueueJob};

const PRIORITY_RANK: &str =
    "CASE priority WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END";

/// Completed jobs considered when estimating processing time.
const ESTIMATE_WINDOW: i64 = 50;

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Repository for fiscal queue operations.
#[derive(Debug, Clone)]
pub struct FiscalQueueRepository {
    pool: SqlitePool,
}

impl FiscalQueueRepository {
    /// Creates a new FiscalQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        FiscalQueueRepository { pool }
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Inserts a pending job for the sale, or resets its existing job.
    ///
    /// A job that is currently processing is left untouched and returned
    /// as-is, so a re-enqueue never opens a second active attempt.
    pub async fn upsert_pending(
        &self,
        sale_id: &str,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> DbResult<QueueJob> {
        let result = sqlx::query(
            r#"
            INSERT INTO fiscal_queue (
                id, sale_id, status, priority, retry_count,
                next_attempt_at, created_at, updated_at
            ) VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?4, ?4)
            ON CONFLICT(sale_id) DO UPDATE SET
                status = 'pending',
                priority = excluded.priority,
                retry_count = 0,
                next_attempt_at = excluded.next_attempt_at,
                error_payload = NULL,
                result_payload = NULL,
                completed_at = NULL,
                updated_at = excluded.updated_at
            WHERE fiscal_queue.status != 'processing'
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(sale_id)
        .bind(priority)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(sale_id = %sale_id, "Job is processing, enqueue left it unchanged");
        }

        self.find_by_sale(sale_id)
            .await?
            .ok_or_else(|| DbError::not_found("FiscalJob", sale_id))
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn find_by_id(&self, id: &str) -> DbResult<Option<QueueJob>> {
        let job = sqlx::query_as::<_, QueueJob>("SELECT * FROM fiscal_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn find_by_sale(&self, sale_id: &str) -> DbResult<Option<QueueJob>> {
        let job = sqlx::query_as::<_, QueueJob>("SELECT * FROM fiscal_queue WHERE sale_id = ?1")
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Pending jobs whose `next_attempt_at` has passed, in dispatch order.
    pub async fn find_due(&self, limit: u32, now: DateTime<Utc>) -> DbResult<Vec<QueueJob>> {
        let sql = format!(
            r#"
            SELECT * FROM fiscal_queue
            WHERE status = 'pending' AND next_attempt_at <= ?1
            ORDER BY {PRIORITY_RANK}, created_at ASC, rowid ASC
            LIMIT ?2
            "#
        );

        let jobs = sqlx::query_as::<_, QueueJob>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    /// Pending jobs that will be dispatched before the given one.
    pub async fn count_pending_ahead(&self, id: &str) -> DbResult<i64> {
        let sql = format!(
            r#"
            WITH me AS (
                SELECT rowid AS rid, created_at, {PRIORITY_RANK} AS rank
                FROM fiscal_queue WHERE id = ?1
            ),
            pending AS (
                SELECT rowid AS rid, created_at, {PRIORITY_RANK} AS rank
                FROM fiscal_queue WHERE status = 'pending'
            )
            SELECT COUNT(*) FROM pending, me
            WHERE pending.rid != me.rid
              AND (
                pending.rank < me.rank
                OR (pending.rank = me.rank AND pending.created_at < me.created_at)
                OR (pending.rank = me.rank AND pending.created_at = me.created_at
                    AND pending.rid < me.rid)
              )
            "#
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Mean processing time of recently completed jobs.
    pub async fn average_processing_ms(&self) -> DbResult<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(processing_time_ms) FROM (
                SELECT processing_time_ms FROM fiscal_queue
                WHERE status = 'completed' AND processing_time_ms IS NOT NULL
                ORDER BY completed_at DESC
                LIMIT ?1
            )
            "#,
        )
        .bind(ESTIMATE_WINDOW)
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }

    pub async fn counts(&self) -> DbResult<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM fiscal_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "pending" => counts.pending = n,
                "processing" => counts.processing = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                other => warn!(status = %other, "Unknown queue status in counts"),
            }
        }
        Ok(counts)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Atomically moves a pending job to processing.
    ///
    /// Returns `false` when the job was no longer pending (another batch
    /// claimed it first). This conditional update is the only guard against
    /// double-processing.
    pub async fn claim(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE fiscal_queue
            SET status = 'processing', updated_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a processing job completed with its result payload.
    pub async fn complete(
        &self,
        id: &str,
        result: &JobResult,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let payload = encode("result_payload", result)?;

        let outcome = sqlx::query(
            r#"
            UPDATE fiscal_queue SET
                status = 'completed',
                result_payload = ?2,
                error_payload = NULL,
                processing_time_ms = ?3,
                completed_at = ?4,
                updated_at = ?4
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(payload)
        .bind(processing_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// Sends a processing job back to pending for a later attempt.
    pub async fn reschedule(
        &self,
        id: &str,
        retry_count: i64,
        next_attempt_at: DateTime<Utc>,
        error: &JobError,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let payload = encode("error_payload", error)?;

        let outcome = sqlx::query(
            r#"
            UPDATE fiscal_queue SET
                status = 'pending',
                retry_count = ?2,
                next_attempt_at = ?3,
                error_payload = ?4,
                processing_time_ms = ?5,
                updated_at = ?6
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_attempt_at)
        .bind(payload)
        .bind(processing_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// Marks a processing job permanently failed.
    pub async fn fail(
        &self,
        id: &str,
        retry_count: i64,
        error: &JobError,
        processing_ms: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let payload = encode("error_payload", error)?;

        let outcome = sqlx::query(
            r#"
            UPDATE fiscal_queue SET
                status = 'failed',
                retry_count = ?2,
                error_payload = ?3,
                processing_time_ms = ?4,
                updated_at = ?5
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(payload)
        .bind(processing_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// Returns jobs stuck in processing since before `cutoff` to pending.
    ///
    /// A worker that dies mid-attempt leaves its claim behind; without this
    /// the sale would never be invoiced.
    pub async fn release_stale_claims(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE fiscal_queue
            SET status = 'pending', next_attempt_at = ?2, updated_at = ?2
            WHERE status = 'processing' AND updated_at < ?1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!(released = result.rows_affected(), "Released stale fiscal claims");
        }
        Ok(result.rows_affected())
    }
}

fn encode<T: Serialize>(column: &str, value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::invalid_payload(column, e))
}

// =============================================================================
// Unit Tests
// =============================================================================
