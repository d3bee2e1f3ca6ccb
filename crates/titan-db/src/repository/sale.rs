//! # Sale Repository
//!
//! The pipeline's window onto the POS `sales` and `sale_items` tables.
//!
//! ## What The Pipeline Touches
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sales                                                                 │
//! │  ├── id, total_cents, currency, payment_method     ◄── read            │
//! │  ├── customer_name, customer_tax_id                ◄── read            │
//! │  └── cae, cae_expiry,                              ◄── written once,   │
//! │      fiscal_receipt_number, fiscal_document_type       on write-back   │
//! │                                                                         │
//! │  sale_items (line_no order)                        ◄── read            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `insert` exists for the POS integration tests and the worker's fixtures;
//! in production the POS owns sale creation.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use titan_core::{Customer, DocumentType, FiscalStamp, SaleLine, SaleRecord};

#[derive(Debug, sqlx::FromRow)]
struct SaleRow {
    id: String,
    total_cents: i64,
    currency: String,
    payment_method: String,
    customer_name: Option<String>,
    customer_tax_id: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    cae: Option<String>,
    cae_expiry: Option<NaiveDate>,
    fiscal_receipt_number: Option<i64>,
    fiscal_document_type: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct SaleItemRow {
    description: String,
    quantity: i64,
    unit_price_cents: i64,
    tax_rate_bps: i64,
}

/// Repository for sale database operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// Inserts a sale and its line items in one transaction.
    pub async fn insert(&self, sale: &SaleRecord) -> DbResult<()> {
        debug!(sale_id = %sale.id, lines = sale.lines.len(), "Inserting sale");

        let now = Utc::now();
        let (customer_name, customer_tax_id) = match &sale.customer {
            Some(c) => (Some(c.name.clone()), c.tax_id.clone()),
            None => (None, None),
        };
        let stamp = sale.fiscal.as_ref();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sales (
                id, total_cents, currency, payment_method,
                customer_name, customer_tax_id, completed_at,
                created_at, updated_at,
                cae, cae_expiry, fiscal_receipt_number, fiscal_document_type
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&sale.id)
        .bind(sale.total_cents)
        .bind(&sale.currency)
        .bind(&sale.payment_method)
        .bind(customer_name)
        .bind(customer_tax_id)
        .bind(sale.completed_at)
        .bind(now)
        .bind(stamp.map(|s| s.cae.clone()))
        .bind(stamp.map(|s| s.cae_expiry))
        .bind(stamp.map(|s| s.receipt_number))
        .bind(stamp.map(|s| s.document_type.code() as i64))
        .execute(&mut *tx)
        .await?;

        for (idx, line) in sale.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO sale_items (
                    id, sale_id, line_no, description,
                    quantity, unit_price_cents, tax_rate_bps
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&sale.id)
            .bind(idx as i64 + 1)
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price_cents)
            .bind(line.tax_rate_bps as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads the invoicing view of a sale, or `None` if it does not exist.
    pub async fn read_for_invoicing(&self, sale_id: &str) -> DbResult<Option<SaleRecord>> {
        let row: Option<SaleRow> = sqlx::query_as(
            r#"
            SELECT
                id, total_cents, currency, payment_method,
                customer_name, customer_tax_id, completed_at,
                cae, cae_expiry, fiscal_receipt_number, fiscal_document_type
            FROM sales
            WHERE id = ?1
            "#,
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items: Vec<SaleItemRow> = sqlx::query_as(
            r#"
            SELECT description, quantity, unit_price_cents, tax_rate_bps
            FROM sale_items
            WHERE sale_id = ?1
            ORDER BY line_no
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        let lines = items
            .into_iter()
            .map(|item| {
                let tax_rate_bps = u32::try_from(item.tax_rate_bps)
                    .map_err(|e| DbError::invalid_payload("sale_items.tax_rate_bps", e))?;
                Ok(SaleLine {
                    description: item.description,
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                    tax_rate_bps,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        let customer = match (row.customer_name, row.customer_tax_id) {
            (None, None) => None,
            (name, tax_id) => Some(Customer {
                name: name.unwrap_or_default(),
                tax_id,
            }),
        };

        let fiscal = match (
            row.cae,
            row.cae_expiry,
            row.fiscal_receipt_number,
            row.fiscal_document_type.and_then(DocumentType::from_code),
        ) {
            (Some(cae), Some(cae_expiry), Some(receipt_number), Some(document_type)) => {
                Some(FiscalStamp {
                    cae,
                    cae_expiry,
                    receipt_number,
                    document_type,
                })
            }
            _ => None,
        };

        Ok(Some(SaleRecord {
            id: row.id,
            total_cents: row.total_cents,
            currency: row.currency,
            payment_method: row.payment_method,
            customer,
            lines,
            completed_at: row.completed_at,
            fiscal,
        }))
    }

    /// Mirrors the authorization onto the sale.
    ///
    /// ## Errors
    /// `DbError::NotFound` when the sale does not exist.
    pub async fn write_fiscal(&self, sale_id: &str, stamp: &FiscalStamp) -> DbResult<()> {
        debug!(
            sale_id = %sale_id,
            receipt_number = stamp.receipt_number,
            "Writing fiscal stamp onto sale"
        );

        let result = sqlx::query(
            r#"
            UPDATE sales SET
                cae = ?2,
                cae_expiry = ?3,
                fiscal_receipt_number = ?4,
                fiscal_document_type = ?5,
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(sale_id)
        .bind(&stamp.cae)
        .bind(stamp.cae_expiry)
        .bind(stamp.receipt_number)
        .bind(stamp.document_type.code() as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Sale", sale_id));
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    fn sample_sale(id: &str) -> SaleRecord {
        SaleRecord {
            id: id.to_string(),
            total_cents: 3500,
            currency: "ARS".to_string(),
            payment_method: "cash".to_string(),
            customer: Some(Customer {
                name: "Cliente SRL".to_string(),
                tax_id: Some("20123456786".to_string()),
            }),
            lines: vec![
                SaleLine {
                    description: "Yerba 1kg".to_string(),
                    quantity: 2,
                    unit_price_cents: 1000,
                    tax_rate_bps: 2100,
                },
                SaleLine {
                    description: "Libro".to_string(),
                    quantity: 1,
                    unit_price_cents: 1500,
                    tax_rate_bps: 1050,
                },
            ],
            completed_at: Some(Utc::now()),
            fiscal: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sales();

        repo.insert(&sample_sale("42")).await.unwrap();

        let sale = repo.read_for_invoicing("42").await.unwrap().unwrap();
        assert_eq!(sale.total_cents, 3500);
        assert_eq!(sale.lines.len(), 2);
        assert_eq!(sale.lines[0].description, "Yerba 1kg");
        assert_eq!(sale.lines[1].tax_rate_bps, 1050);
        assert_eq!(
            sale.customer.unwrap().tax_id.as_deref(),
            Some("20123456786")
        );
        assert!(sale.fiscal.is_none());

        assert!(repo.read_for_invoicing("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_fiscal() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sales();
        repo.insert(&sample_sale("42")).await.unwrap();

        let stamp = FiscalStamp {
            cae: "12345678901234".to_string(),
            cae_expiry: NaiveDate::from_ymd_opt(2026, 10, 28).unwrap(),
            receipt_number: 124,
            document_type: DocumentType::FacturaA,
        };
        repo.write_fiscal("42", &stamp).await.unwrap();

        let sale = repo.read_for_invoicing("42").await.unwrap().unwrap();
        assert_eq!(sale.fiscal, Some(stamp.clone()));
        assert!(sale.is_invoiced());

        let err = repo.write_fiscal("nope", &stamp).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
