//! Queue entry point: schedule a completed sale for invoicing.
//!
//! Enqueue only records intent. It never contacts the authority and returns
//! as soon as the job row is in place; the fiscal outcome is observed later
//! through `status`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use titan_core::validation::validate_sale_id;
use titan_core::{EnqueueTicket, JobPriority, JobStatus, QueueJob};

use crate::error::FiscalResult;
use crate::store::JobQueue;

pub struct Enqueuer {
    queue: Arc<dyn JobQueue>,
    /// Per-job estimate when no job has completed yet.
    default_processing_ms: i64,
}

impl Enqueuer {
    pub fn new(queue: Arc<dyn JobQueue>, default_processing_ms: i64) -> Self {
        Enqueuer {
            queue,
            default_processing_ms,
        }
    }

    /// Creates or resets the sale's job.
    ///
    /// Enqueueing the same sale again while it waits collapses onto the same
    /// row with its retry count reset. A job being processed right now is left
    /// alone and reported as processing.
    pub async fn enqueue(&self, sale_id: &str, priority: JobPriority) -> FiscalResult<EnqueueTicket> {
        self.enqueue_at(sale_id, priority, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        sale_id: &str,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> FiscalResult<EnqueueTicket> {
        validate_sale_id(sale_id)?;

        let job = self.queue.upsert_pending(sale_id, priority, now).await?;
        let estimated_time_secs = self.estimate_secs(&job).await?;

        info!(
            sale_id = %sale_id,
            queue_id = %job.id,
            priority = %job.priority,
            status = %job.status,
            estimated_time_secs,
            "Sale enqueued for invoicing"
        );

        Ok(EnqueueTicket {
            queue_id: job.id,
            status: job.status,
            estimated_time_secs,
        })
    }

    /// (jobs ahead + 1) × mean processing time, rounded up to whole seconds.
    async fn estimate_secs(&self, job: &QueueJob) -> FiscalResult<u64> {
        let ahead = match job.status {
            JobStatus::Pending => self.queue.pending_ahead(&job.id).await?,
            _ => 0,
        };
        let per_job_ms = self
            .queue
            .average_processing_ms()
            .await?
            .filter(|ms| *ms > 0.0)
            .unwrap_or(self.default_processing_ms as f64);

        debug!(ahead, per_job_ms, "Estimating queue wait");
        let total_ms = (ahead.max(0) + 1) as f64 * per_job_ms;
        Ok((total_ms / 1000.0).ceil() as u64)
    }
}
