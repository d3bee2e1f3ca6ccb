//! # titan-db: Database Layer for Titan Fiscal
//!
//! SQLite storage for the fiscal-invoice pipeline, via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Titan Fiscal Data Flow                           │
//! │                                                                         │
//! │  titan-fiscal (enqueue / dispatcher / status)                          │
//! │       │   via the JobQueue, SaleStore, ReceiptStore traits              │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     titan-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌─────────────────┐  ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories   │  │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                 │  │  (embedded)  │  │   │
//! │  │   │               │    │ SaleRepo        │  │ 001_sales    │  │   │
//! │  │   │ SqlitePool    │◄───│ FiscalQueueRepo │  │ 002_queue    │  │   │
//! │  │   │               │    │ FiscalReceipt.. │  │ 003_receipts │  │   │
//! │  │   └───────────────┘    └─────────────────┘  └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database (shared with the POS)                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use titan_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fiscal.db")).await?;
//! let due = db.fiscal_queue().find_due(10, chrono::Utc::now()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::fiscal_queue::{FiscalQueueRepository, QueueCounts};
pub use repository::fiscal_receipt::FiscalReceiptRepository;
pub use repository::sale::SaleRepository;
