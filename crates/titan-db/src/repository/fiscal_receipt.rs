//! # Fiscal Receipt Repository
//!
//! Insert-only log of authorized documents. Rows are never updated here;
//! voiding happens through credit notes outside this pipeline.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;
use titan_core::FiscalReceipt;

/// Repository for issued receipts.
#[derive(Debug, Clone)]
pub struct FiscalReceiptRepository {
    pool: SqlitePool,
}

impl FiscalReceiptRepository {
    /// Creates a new FiscalReceiptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        FiscalReceiptRepository { pool }
    }

    /// Appends a receipt.
    ///
    /// Returns `false` when a receipt for the same (point of sale, type,
    /// number) is already recorded, which happens when an earlier attempt
    /// appended it but failed before completing the job.
    pub async fn append(&self, receipt: &FiscalReceipt) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fiscal_receipts (
                id, sale_id, document_type, point_of_sale, receipt_number,
                cae, cae_expiry, snapshot, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(point_of_sale, document_type, receipt_number) DO NOTHING
            "#,
        )
        .bind(&receipt.id)
        .bind(&receipt.sale_id)
        .bind(receipt.document_type)
        .bind(receipt.point_of_sale)
        .bind(receipt.receipt_number)
        .bind(&receipt.cae)
        .bind(receipt.cae_expiry)
        .bind(&receipt.snapshot)
        .bind(receipt.status)
        .bind(receipt.created_at)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            info!(
                sale_id = %receipt.sale_id,
                receipt_number = receipt.receipt_number,
                "Fiscal receipt recorded"
            );
        } else {
            debug!(
                sale_id = %receipt.sale_id,
                receipt_number = receipt.receipt_number,
                "Fiscal receipt already recorded"
            );
        }
        Ok(inserted)
    }

    /// Most recent receipt for a sale.
    pub async fn find_latest_by_sale(&self, sale_id: &str) -> DbResult<Option<FiscalReceipt>> {
        let receipt = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            SELECT * FROM fiscal_receipts
            WHERE sale_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(receipt)
    }

    /// The receipt recorded under one voucher, whichever sale it belongs to.
    pub async fn find_by_voucher(
        &self,
        point_of_sale: i64,
        document_type: i64,
        receipt_number: i64,
    ) -> DbResult<Option<FiscalReceipt>> {
        let receipt = sqlx::query_as::<_, FiscalReceipt>(
            r#"
            SELECT * FROM fiscal_receipts
            WHERE point_of_sale = ?1 AND document_type = ?2 AND receipt_number = ?3
            "#,
        )
        .bind(point_of_sale)
        .bind(document_type)
        .bind(receipt_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(receipt)
    }

    /// All receipts for a sale, oldest first.
    pub async fn list_by_sale(&self, sale_id: &str) -> DbResult<Vec<FiscalReceipt>> {
        let receipts = sqlx::query_as::<_, FiscalReceipt>(
            "SELECT * FROM fiscal_receipts WHERE sale_id = ?1 ORDER BY created_at, rowid",
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(receipts)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig, DbError};
    use chrono::{NaiveDate, Utc};
    use titan_core::{ReceiptStatus, SaleRecord};

    fn receipt(sale_id: &str, number: i64) -> FiscalReceipt {
        FiscalReceipt {
            id: uuid::Uuid::new_v4().to_string(),
            sale_id: sale_id.to_string(),
            document_type: 6,
            point_of_sale: 3,
            receipt_number: number,
            cae: "12345678901234".to_string(),
            cae_expiry: NaiveDate::from_ymd_opt(2026, 10, 28).unwrap(),
            snapshot: "{}".to_string(),
            status: ReceiptStatus::Issued,
            created_at: Utc::now(),
        }
    }

    async fn db_with_sale(id: &str) -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sales()
            .insert(&SaleRecord {
                id: id.to_string(),
                total_cents: 1000,
                currency: "ARS".to_string(),
                payment_method: "cash".to_string(),
                customer: None,
                lines: vec![],
                completed_at: None,
                fiscal: None,
            })
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_append_and_find() {
        let db = db_with_sale("42").await;
        let repo = db.fiscal_receipts();

        assert!(repo.append(&receipt("42", 7)).await.unwrap());

        let latest = repo.find_latest_by_sale("42").await.unwrap().unwrap();
        assert_eq!(latest.receipt_number, 7);
        assert_eq!(latest.status, ReceiptStatus::Issued);
        assert!(repo.find_latest_by_sale("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_same_number_is_ignored() {
        let db = db_with_sale("42").await;
        let repo = db.fiscal_receipts();

        assert!(repo.append(&receipt("42", 7)).await.unwrap());
        assert!(!repo.append(&receipt("42", 7)).await.unwrap());
        assert_eq!(repo.list_by_sale("42").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_voucher() {
        let db = db_with_sale("42").await;
        let repo = db.fiscal_receipts();
        repo.append(&receipt("42", 7)).await.unwrap();

        let found = repo.find_by_voucher(3, 6, 7).await.unwrap().unwrap();
        assert_eq!(found.sale_id, "42");
        assert!(repo.find_by_voucher(3, 6, 8).await.unwrap().is_none());
        assert!(repo.find_by_voucher(4, 6, 7).await.unwrap().is_none());
        assert!(repo.find_by_voucher(3, 1, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_requires_sale() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db.fiscal_receipts().append(&receipt("ghost", 1)).await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
    }
}
