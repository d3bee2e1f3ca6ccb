//! # Repository Module
//!
//! Database repository implementations for the fiscal pipeline.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  titan-fiscal                                                          │
//! │       │  JobQueue / SaleStore / ReceiptStore (traits, titan-fiscal)     │
//! │       ▼                                                                 │
//! │  FiscalQueueRepository                                                 │
//! │  ├── upsert_pending(sale_id, priority, now)                            │
//! │  ├── find_due(limit, now)                                              │
//! │  ├── claim(id, now)            ← conditional UPDATE, the only guard    │
//! │  └── complete / reschedule / fail                                      │
//! │                                                                         │
//! │  SaleRepository                                                        │
//! │  ├── read_for_invoicing(sale_id)                                       │
//! │  └── write_fiscal(sale_id, stamp)                                      │
//! │                                                                         │
//! │  FiscalReceiptRepository                                               │
//! │  └── append(receipt)           ← insert-only                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`fiscal_queue::FiscalQueueRepository`] - Job queue storage
//! - [`sale::SaleRepository`] - Sale reads and fiscal write-back
//! - [`fiscal_receipt::FiscalReceiptRepository`] - Issued receipts

pub mod fiscal_queue;
pub mod fiscal_receipt;
pub mod sale;
