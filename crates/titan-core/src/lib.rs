//! # titan-core: Pure Fiscal Logic for Titan POS
//!
//! This crate holds everything about electronic invoicing that can be
//! decided without touching a database, a clock or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Titan Fiscal Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/fiscal-worker (scheduler entry)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        titan-fiscal (enqueue, dispatcher, authority client)      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ titan-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │  invoice  │  │   retry   │  │   │
//! │  │   │ QueueJob  │  │   Money   │  │  Builder  │  │ Schedule  │  │   │
//! │  │   │SaleRecord │  │ VAT split │  │ FiscalDoc │  │  2/4/8m   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    titan-db (Database Layer)                    │   │
//! │  │            sales, fiscal_queue, fiscal_receipts tables          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Queue jobs, sale view, receipts, status views
//! - [`money`] - Integer money and the inclusive-tax split
//! - [`document`] - The fiscal document and its authorization stamp
//! - [`invoice`] - The invoice builder (sale → fiscal document)
//! - [`retry`] - The queue-level retry schedule
//! - [`validation`] - Tax id and input checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use titan_core::retry::{RetryDecision, RetrySchedule};
//!
//! let schedule = RetrySchedule::default();
//! match schedule.after_failure(0) {
//!     RetryDecision::Reschedule { retry_count, delay } => {
//!         assert_eq!(retry_count, 1);
//!         assert_eq!(delay.num_minutes(), 2);
//!     }
//!     RetryDecision::GiveUp { .. } => unreachable!(),
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod document;
pub mod error;
pub mod invoice;
pub mod money;
pub mod retry;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use document::{
    Authorization, DocumentType, FiscalDocument, FiscalLine, IssuerProfile, Recipient, Totals,
    VatBreakdown, VoucherAttempt,
};
pub use error::{BuildError, CoreError, ValidationError};
pub use invoice::{generate_local_reference, BuildContext, InvoiceBuilder, InvoiceRules};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Retries a job gets after its first failure before it is marked failed.
///
/// Four failed attempts in total: the first run plus three rescheduled ones.
pub const MAX_RETRIES: i64 = 3;

/// VAT rate applied to a synthesized line (21%, the general Argentine rate).
pub const DEFAULT_TAX_RATE_BPS: u32 = 2100;

/// Description used when a sale has no structured line items.
pub const DEFAULT_LINE_DESCRIPTION: &str = "Venta";

/// Fallback per-job processing time for queue estimates, in milliseconds.
pub const DEFAULT_PROCESSING_MS: i64 = 5_000;

/// Maximum accepted length of a sale id.
pub const MAX_SALE_ID_LEN: usize = 64;
