//! # Retry Schedule
//!
//! Queue-level retries: what happens to a job after a retryable failure.
//!
//! ```text
//! attempt 1 fails → retry_count 1 → next attempt in 2 min
//! attempt 2 fails → retry_count 2 → next attempt in 4 min
//! attempt 3 fails → retry_count 3 → next attempt in 8 min
//! attempt 4 fails → retry_count 4 → failed (never selected again)
//! ```
//!
//! Delays are exact powers of two, without jitter. In-call retries (a few
//! seconds apart, inside one attempt) live in `titan-fiscal`'s resilience
//! layer and are independent of this schedule.

use chrono::Duration;

/// Outcome of applying the schedule to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending, not before `delay` from now.
    Reschedule { retry_count: i64, delay: Duration },
    /// Retries exhausted; the job is failed permanently.
    GiveUp { retry_count: i64 },
}

impl RetryDecision {
    pub fn retry_count(&self) -> i64 {
        match self {
            RetryDecision::Reschedule { retry_count, .. } => *retry_count,
            RetryDecision::GiveUp { retry_count } => *retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_retries: i64,
    /// Unit of the exponential delay (2^n × unit).
    pub base: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: crate::MAX_RETRIES,
            base: Duration::minutes(1),
        }
    }
}

impl RetrySchedule {
    /// Applies one retryable failure to a job that has already failed
    /// `retry_count` times.
    pub fn after_failure(&self, retry_count: i64) -> RetryDecision {
        let retry_count = retry_count.max(0) + 1;
        if retry_count > self.max_retries {
            return RetryDecision::GiveUp { retry_count };
        }

        // retry_count ≤ max_retries keeps the shift small
        let factor = 1i32 << retry_count.min(30);
        RetryDecision::Reschedule {
            retry_count,
            delay: self.base * factor,
        }
    }
}
