//! Read side of the queue: what happened to the invoice for a sale.

use std::sync::Arc;
use tracing::debug;

use titan_core::validation::validate_sale_id;
use titan_core::{FiscalStatusView, JobStatus, QueueJob, StatusKind};

use crate::error::FiscalResult;
use crate::store::JobQueue;

pub struct StatusQuery {
    queue: Arc<dyn JobQueue>,
}

impl StatusQuery {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        StatusQuery { queue }
    }

    pub async fn status(&self, sale_id: &str) -> FiscalResult<FiscalStatusView> {
        validate_sale_id(sale_id)?;

        let view = match self.queue.find_by_sale(sale_id).await? {
            Some(job) => view_of(&job),
            None => FiscalStatusView {
                sale_id: sale_id.to_string(),
                status: StatusKind::NotFound,
                message: "No fiscal job for this sale".to_string(),
                receipt_number: None,
                cae: None,
                last_error: None,
                retry_count: 0,
                next_attempt_at: None,
            },
        };

        debug!(sale_id = %sale_id, status = ?view.status, "Fiscal status queried");
        Ok(view)
    }
}

fn view_of(job: &QueueJob) -> FiscalStatusView {
    let result = job.result();
    let last_error = job.last_error();

    let message = match job.status {
        JobStatus::Pending if job.retry_count == 0 => "Waiting for the first attempt".to_string(),
        JobStatus::Pending => format!(
            "Retrying: attempt {} failed ({}), next attempt at {}",
            job.retry_count,
            last_error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error"),
            job.next_attempt_at.to_rfc3339(),
        ),
        JobStatus::Processing => "Being processed".to_string(),
        JobStatus::Completed => match &result {
            Some(r) if r.recovered => format!("Invoiced as receipt {} (recovered)", r.receipt_number),
            Some(r) => format!("Invoiced as receipt {}", r.receipt_number),
            None => "Invoiced".to_string(),
        },
        JobStatus::Failed => format!(
            "Failed permanently after {} retries: {}",
            job.retry_count,
            last_error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error"),
        ),
    };

    FiscalStatusView {
        sale_id: job.sale_id.clone(),
        status: job.status.into(),
        message,
        receipt_number: result.as_ref().map(|r| r.receipt_number),
        cae: result.map(|r| r.cae),
        last_error,
        retry_count: job.retry_count,
        next_attempt_at: (job.status == JobStatus::Pending).then_some(job.next_attempt_at),
    }
}
