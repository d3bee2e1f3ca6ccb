//! # Domain Types
//!
//! Types shared by every layer of the fiscal pipeline.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SaleRecord    │   │    QueueJob     │   │  FiscalReceipt  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │──►│  sale_id (UNIQ) │──►│  sale_id        │       │
//! │  │  total_cents    │   │  status         │   │  receipt_number │       │
//! │  │  customer?      │   │  priority       │   │  cae            │       │
//! │  │  lines[]        │   │  retry_count    │   │  snapshot JSON  │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │      read by the           owned by the          insert-only            │
//! │      dispatcher            queue store                                  │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    TaxRate      │   │    JobStatus    │   │  JobPriority    │       │
//! │  │  bps (u32)      │   │  Pending        │   │  High   (1)     │       │
//! │  │  2100 = 21%     │   │  Processing     │   │  Normal (2)     │       │
//! │  │  → VAT id 5     │   │  Completed      │   │  Low    (3)     │       │
//! │  └─────────────────┘   │  Failed         │   └─────────────────┘       │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::document::{DocumentType, VoucherAttempt};
use crate::error::CoreError;
use crate::money::Money;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// ## Why Basis Points?
/// 1 basis point = 0.01% = 1/10000
/// 1050 bps = 10.5% (reduced VAT rate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Returns the rate as a percentage (for display and the wire only).
    #[inline]
    pub fn percentage(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Zero tax rate.
    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }

    /// Checks if tax rate is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The authority's VAT id for this rate, if the rate is accepted.
    ///
    /// ```text
    /// 0% → 3   10.5% → 4   21% → 5   27% → 6   5% → 8   2.5% → 9
    /// ```
    pub const fn vat_id(&self) -> Option<u8> {
        match self.0 {
            0 => Some(3),
            1050 => Some(4),
            2100 => Some(5),
            2700 => Some(6),
            500 => Some(8),
            250 => Some(9),
            _ => None,
        }
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate(crate::DEFAULT_TAX_RATE_BPS)
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// Lifecycle state of a fiscal queue job.
///
/// ```text
///   enqueue            claim               success
/// ──────────► Pending ───────► Processing ──────────► Completed
///                ▲                  │
///                │   retryable,     │ terminal, or
///                │   retries left   │ retries exhausted
///                └──────────────────┤
///                                   ▼
///                                 Failed
/// ```
/// Re-enqueueing a Completed or Failed job sends it back to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// The value stored in the `status` column.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Pending and Processing jobs are active; at most one exists per sale.
    pub const fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub const fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::UnknownValue {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Job Priority
// =============================================================================

/// Dispatch priority. All high jobs go before normal, normal before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Sort rank used by the dispatcher (lower runs first).
    pub const fn rank(&self) -> u8 {
        match self {
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            _ => Err(CoreError::UnknownValue {
                kind: "job priority",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Queue Job
// =============================================================================

/// One row of the `fiscal_queue` table.
///
/// The `sale_id` column is UNIQUE, so a sale has at most one job and
/// therefore at most one active attempt.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct QueueJob {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub sale_id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Failed attempts since the last enqueue.
    pub retry_count: i64,
    /// The job is not selected before this instant.
    #[ts(as = "String")]
    pub next_attempt_at: DateTime<Utc>,
    /// Wall time of the last attempt.
    pub processing_time_ms: Option<i64>,
    /// [`JobResult`] as JSON, set on completion.
    pub result_payload: Option<String>,
    /// [`JobError`] as JSON, set on every failed attempt.
    pub error_payload: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Decodes the stored error payload, ignoring malformed JSON.
    pub fn last_error(&self) -> Option<JobError> {
        self.error_payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Decodes the stored result payload, ignoring malformed JSON.
    pub fn result(&self) -> Option<JobResult> {
        self.result_payload
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// The voucher number the previous attempt asked the authority for.
    ///
    /// Fed back into the next attempt so an authorized-but-unrecorded
    /// voucher is recovered instead of issued twice.
    pub fn attempted_voucher(&self) -> Option<i64> {
        self.last_error().and_then(|e| e.attempted_voucher)
    }

    /// The full submission behind [`Self::attempted_voucher`], when the
    /// previous attempt recorded one.
    pub fn voucher_attempt(&self) -> Option<VoucherAttempt> {
        self.last_error().and_then(|e| e.attempt)
    }
}

// =============================================================================
// Job Payloads
// =============================================================================

/// A message returned by the tax authority (error or observation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AuthorityMessage {
    pub code: i64,
    pub text: String,
}

/// Error payload persisted on every failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JobError {
    /// Machine-readable failure kind (`timeout`, `rejected`, ...).
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub authority_messages: Vec<AuthorityMessage>,
    /// Voucher number chosen by the attempt, if it got that far.
    #[serde(default)]
    pub attempted_voucher: Option<i64>,
    /// What was submitted under `attempted_voucher`.
    #[serde(default)]
    pub attempt: Option<VoucherAttempt>,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

/// Result payload persisted when a job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JobResult {
    pub cae: String,
    #[ts(as = "String")]
    pub cae_expiry: NaiveDate,
    pub receipt_number: i64,
    pub document_type: DocumentType,
    pub point_of_sale: u32,
    pub local_reference: String,
    /// True when the CAE came from a voucher lookup rather than a new submission.
    pub recovered: bool,
}

// =============================================================================
// Sale View
// =============================================================================

/// Customer data relevant to invoicing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Customer {
    pub name: String,
    /// CUIT, with or without separators.
    pub tax_id: Option<String>,
}

/// A structured sale line. Unit prices include VAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLine {
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub tax_rate_bps: u32,
}

impl SaleLine {
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    #[inline]
    pub fn tax_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.tax_rate_bps)
    }
}

/// The view of a completed sale the pipeline reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleRecord {
    pub id: String,
    /// Tax-inclusive total in cents.
    pub total_cents: i64,
    /// ISO currency code of the sale (`ARS`).
    pub currency: String,
    pub payment_method: String,
    pub customer: Option<Customer>,
    /// May be empty; the builder then synthesizes a single line.
    pub lines: Vec<SaleLine>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Present once write-back has stamped the sale.
    pub fiscal: Option<FiscalStamp>,
}

impl SaleRecord {
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    pub fn is_invoiced(&self) -> bool {
        self.fiscal.is_some()
    }
}

/// Fiscal fields written back onto the sale after authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalStamp {
    pub cae: String,
    #[ts(as = "String")]
    pub cae_expiry: NaiveDate,
    pub receipt_number: i64,
    pub document_type: DocumentType,
}

// =============================================================================
// Fiscal Receipt
// =============================================================================

/// Status of an issued receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    #[default]
    Issued,
    /// Cancelled by a credit note outside this pipeline.
    Void,
}

/// An immutable record of an authorized document (`fiscal_receipts` row).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct FiscalReceipt {
    pub id: String,
    pub sale_id: String,
    /// Authority document type code (1 = Factura A, 6 = Factura B).
    pub document_type: i64,
    pub point_of_sale: i64,
    pub receipt_number: i64,
    pub cae: String,
    #[ts(as = "String")]
    pub cae_expiry: NaiveDate,
    /// The stamped [`crate::FiscalDocument`] as JSON.
    pub snapshot: String,
    pub status: ReceiptStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Public Views
// =============================================================================

/// Status as reported to callers; `NotFound` when no job exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Pending,
    Processing,
    Completed,
    Failed,
    NotFound,
}

impl From<JobStatus> for StatusKind {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => StatusKind::Pending,
            JobStatus::Processing => StatusKind::Processing,
            JobStatus::Completed => StatusKind::Completed,
            JobStatus::Failed => StatusKind::Failed,
        }
    }
}

/// Answer to "what happened to the invoice for this sale?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalStatusView {
    pub sale_id: String,
    pub status: StatusKind,
    /// Human-readable summary; distinguishes "retrying" from "failed".
    pub message: String,
    pub receipt_number: Option<i64>,
    pub cae: Option<String>,
    pub last_error: Option<JobError>,
    pub retry_count: i64,
    #[ts(as = "Option<String>")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Returned by enqueue. The fiscal outcome is only observable via status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EnqueueTicket {
    pub queue_id: String,
    pub status: JobStatus,
    pub estimated_time_secs: u64,
}

// =============================================================================
// Unit Tests
// =============================================================================
