//! Pipeline metrics through the `metrics` facade.
//!
//! Nothing is exported unless the host installs a recorder; without one the
//! macros are no-ops. Batch timing percentiles are also computed locally for
//! [`crate::dispatcher::BatchReport`].

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use serde::Serialize;
use std::sync::OnceLock;

pub const JOBS_PROCESSED: &str = "fiscal_jobs_processed_total";
pub const JOBS_FAILED: &str = "fiscal_jobs_failed_total";
pub const JOBS_SKIPPED: &str = "fiscal_jobs_skipped_total";
pub const CACHE_HITS: &str = "fiscal_cache_hits_total";
pub const JOB_DURATION: &str = "fiscal_job_duration_ms";

static DESCRIBED: OnceLock<()> = OnceLock::new();

/// Registers metric descriptions with the installed recorder, once.
pub fn describe() {
    DESCRIBED.get_or_init(|| {
        describe_counter!(JOBS_PROCESSED, "Fiscal jobs that ended in an authorized document");
        describe_counter!(JOBS_FAILED, "Fiscal attempts that failed, retryable or not");
        describe_counter!(JOBS_SKIPPED, "Due jobs another worker claimed first");
        describe_counter!(CACHE_HITS, "Authority reads answered from the response cache");
        describe_histogram!(JOB_DURATION, Unit::Milliseconds, "Wall time of one fiscal attempt");
    });
}

pub fn record_processed(duration_ms: f64) {
    counter!(JOBS_PROCESSED).increment(1);
    histogram!(JOB_DURATION).record(duration_ms);
}

/// `retryable` lands in a label so dashboards can tell retries from losses.
pub fn record_failed(kind: &'static str, retryable: bool, duration_ms: f64) {
    counter!(JOBS_FAILED, "kind" => kind, "retryable" => retryable.to_string()).increment(1);
    histogram!(JOB_DURATION).record(duration_ms);
}

pub fn record_skipped() {
    counter!(JOBS_SKIPPED).increment(1);
}

pub fn record_cache_hits(hits: u64) {
    if hits > 0 {
        counter!(CACHE_HITS).increment(hits);
    }
}

// =============================================================================
// Percentiles
// =============================================================================

/// Per-job timing of one batch, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingSummary {
    pub count: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl TimingSummary {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.sort_by(|a, b| a.total_cmp(b));
        TimingSummary {
            count: samples.len(),
            p50_ms: nearest_rank(&samples, 50.0),
            p95_ms: nearest_rank(&samples, 95.0),
            p99_ms: nearest_rank(&samples, 99.0),
            max_ms: samples.last().copied().unwrap_or(0.0),
        }
    }
}

/// Nearest-rank percentile of ascending `sorted`; 0 when empty.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
