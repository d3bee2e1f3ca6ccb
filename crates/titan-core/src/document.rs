//! # Fiscal Document
//!
//! The electronic invoice as the tax authority sees it.
//!
//! ## Document Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  FACTURA B                  Pto. Vta 0003   Nro 00000124                │
//! │  Issuer:    30-71234567-1  Comercio Demo SA                             │
//! │  Recipient: 99 / 0  (Consumidor Final)                                  │
//! │  ───────────────────────────────────────────────────────────────────── │
//! │  2 x Yerba 1kg         $10.00   21%   net $16.53  vat $3.47  $20.00     │
//! │  1 x Libro             $15.00   10.5% net $13.57  vat $1.43  $15.00     │
//! │  ───────────────────────────────────────────────────────────────────── │
//! │  VAT id 5 (21%)    base $16.53  amount $3.47                            │
//! │  VAT id 4 (10.5%)  base $13.57  amount $1.43                            │
//! │  Net $30.10    VAT $4.90    Total $35.00                                │
//! │  ───────────────────────────────────────────────────────────────────── │
//! │  CAE 74123456789012   Vto. 2026-10-28                                   │
//! │  ||||||||||||| barcode  +  QR (base64 JSON)                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A document is built fresh for every attempt and never stored as-is; the
//! stamped version is snapshotted into the receipt as JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ts_rs::TS;

use crate::money::Money;
use crate::types::{FiscalStamp, TaxRate};

/// Base URL of the authority's QR verification page.
pub const QR_BASE_URL: &str = "https://www.afip.gob.ar/fe/qr/?p=";

/// Recipient document type for a CUIT.
pub const RECIPIENT_DOC_CUIT: u16 = 80;

/// Recipient document type for an anonymous final consumer.
pub const RECIPIENT_DOC_FINAL_CONSUMER: u16 = 99;

/// Concept code for sales of goods.
pub const CONCEPT_PRODUCTS: u8 = 1;

// =============================================================================
// Document Type
// =============================================================================

/// Invoice class. Numbering is independent per (point of sale, type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// Between registered taxpayers (code 1).
    FacturaA,
    /// To final consumers and exempt customers (code 6).
    FacturaB,
}

impl DocumentType {
    /// The authority's numeric code.
    pub const fn code(&self) -> u16 {
        match self {
            DocumentType::FacturaA => 1,
            DocumentType::FacturaB => 6,
        }
    }

    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DocumentType::FacturaA),
            6 => Some(DocumentType::FacturaB),
            _ => None,
        }
    }

    pub const fn letter(&self) -> char {
        match self {
            DocumentType::FacturaA => 'A',
            DocumentType::FacturaB => 'B',
        }
    }
}

// =============================================================================
// Parties
// =============================================================================

/// The business issuing invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct IssuerProfile {
    /// 11-digit CUIT, digits only.
    pub cuit: String,
    pub business_name: String,
    /// Point of sale registered with the authority.
    pub point_of_sale: u32,
}

/// Who the invoice is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Recipient {
    /// 80 = CUIT, 99 = final consumer.
    pub doc_type: u16,
    /// CUIT digits, or 0 for a final consumer.
    pub doc_number: u64,
    pub name: Option<String>,
    /// Recipient VAT condition (1 = registered, 5 = final consumer).
    pub vat_condition: u8,
}

impl Recipient {
    pub fn final_consumer() -> Self {
        Recipient {
            doc_type: RECIPIENT_DOC_FINAL_CONSUMER,
            doc_number: 0,
            name: None,
            vat_condition: 5,
        }
    }

    pub fn is_final_consumer(&self) -> bool {
        self.doc_type == RECIPIENT_DOC_FINAL_CONSUMER
    }
}

// =============================================================================
// Lines & Totals
// =============================================================================

/// A priced line with its inclusive-tax split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalLine {
    pub description: String,
    pub quantity: i64,
    /// Tax-inclusive unit price.
    pub unit_price: Money,
    pub tax_rate: TaxRate,
    pub net: Money,
    pub tax: Money,
    pub gross: Money,
}

/// VAT grouped per rate, as the authority's `AlicIva` array expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VatBreakdown {
    pub vat_id: u8,
    pub rate: TaxRate,
    pub base: Money,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Totals {
    pub net: Money,
    pub tax: Money,
    pub total: Money,
}

// =============================================================================
// Authorization
// =============================================================================

/// What the authority hands back for an approved document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Authorization {
    /// 14-digit electronic authorization code.
    pub cae: String,
    #[ts(as = "String")]
    pub cae_expiry: NaiveDate,
    pub voucher_number: i64,
}

/// What one attempt sent to the authority under a voucher number.
///
/// Persisted with the failure. A later attempt only adopts the voucher
/// issued under `number` when the authority's record carries this same
/// issue date, amounts and local reference; another sale may hold that
/// number by then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoucherAttempt {
    pub number: i64,
    pub document_type: DocumentType,
    pub point_of_sale: u32,
    #[ts(as = "String")]
    pub issued_at: DateTime<Utc>,
    pub local_reference: String,
    pub totals: Totals,
}

impl VoucherAttempt {
    pub fn issue_date_compact(&self) -> String {
        self.issued_at.format("%Y%m%d").to_string()
    }
}

// =============================================================================
// Fiscal Document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalDocument {
    pub document_type: DocumentType,
    pub point_of_sale: u32,
    /// Assigned by the authority client right before submission.
    pub voucher_number: Option<i64>,
    #[ts(as = "String")]
    pub issued_at: DateTime<Utc>,
    /// Trace reference (`YYYYMMDDHHMMSS-NNNN`), not the fiscal number.
    pub local_reference: String,
    pub issuer: IssuerProfile,
    pub recipient: Recipient,
    pub concept: u8,
    /// Authority currency code (`PES`).
    pub currency: String,
    pub lines: Vec<FiscalLine>,
    pub vat: Vec<VatBreakdown>,
    pub totals: Totals,
    pub cae: Option<String>,
    #[ts(as = "Option<String>")]
    pub cae_expiry: Option<NaiveDate>,
    pub barcode: Option<String>,
    pub qr_payload: Option<String>,
}

impl FiscalDocument {
    /// Issue date as the authority formats it (`yyyymmdd`).
    pub fn issue_date_compact(&self) -> String {
        self.issued_at.format("%Y%m%d").to_string()
    }

    pub fn is_authorized(&self) -> bool {
        self.cae.is_some()
    }

    /// Fills in the authorization: CAE, expiry, voucher number, barcode, QR.
    pub fn stamp(&mut self, authorization: &Authorization) {
        self.voucher_number = Some(authorization.voucher_number);
        self.cae = Some(authorization.cae.clone());
        self.cae_expiry = Some(authorization.cae_expiry);
        self.barcode = Some(self.build_barcode(authorization));
        self.qr_payload = Some(self.build_qr(authorization));
    }

    /// The submission in play, once a voucher number has been chosen.
    pub fn voucher_attempt(&self) -> Option<VoucherAttempt> {
        Some(VoucherAttempt {
            number: self.voucher_number?,
            document_type: self.document_type,
            point_of_sale: self.point_of_sale,
            issued_at: self.issued_at,
            local_reference: self.local_reference.clone(),
            totals: self.totals,
        })
    }

    /// Takes over the identity of an earlier submission whose voucher is
    /// being recovered, so the receipt records what was actually issued.
    pub fn resume(&mut self, attempt: &VoucherAttempt) {
        self.issued_at = attempt.issued_at;
        self.local_reference = attempt.local_reference.clone();
    }

    /// The fields write-back mirrors onto the sale, once stamped.
    pub fn fiscal_stamp(&self) -> Option<FiscalStamp> {
        Some(FiscalStamp {
            cae: self.cae.clone()?,
            cae_expiry: self.cae_expiry?,
            receipt_number: self.voucher_number?,
            document_type: self.document_type,
        })
    }

    /// Interleaved barcode content.
    ///
    /// ```text
    /// CUIT(11) + TYPE(3) + POS(5) + CAE(14) + EXPIRY yyyymmdd(8) + CHECK(1)
    /// ```
    fn build_barcode(&self, authorization: &Authorization) -> String {
        let body = format!(
            "{}{:03}{:05}{}{}",
            self.issuer.cuit,
            self.document_type.code(),
            self.point_of_sale,
            authorization.cae,
            authorization.cae_expiry.format("%Y%m%d"),
        );
        let check = mod10_check_digit(&body);
        format!("{body}{check}")
    }

    fn build_qr(&self, authorization: &Authorization) -> String {
        let cuit: u64 = self.issuer.cuit.parse().unwrap_or_default();
        let cae = authorization
            .cae
            .parse::<u64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(authorization.cae.clone()));

        let payload = json!({
            "ver": 1,
            "fecha": self.issued_at.format("%Y-%m-%d").to_string(),
            "cuit": cuit,
            "ptoVta": self.point_of_sale,
            "tipoCmp": self.document_type.code(),
            "nroCmp": authorization.voucher_number,
            "importe": self.totals.total.as_major_units(),
            "moneda": self.currency,
            "ctz": 1,
            "tipoDocRec": self.recipient.doc_type,
            "nroDocRec": self.recipient.doc_number,
            "tipoCodAut": "E",
            "codAut": cae,
        });

        format!("{}{}", QR_BASE_URL, BASE64.encode(payload.to_string()))
    }
}

/// Check digit for the invoice barcode.
///
/// Odd positions (1st, 3rd, ...) weigh 3, even positions weigh 1;
/// the digit brings the sum up to a multiple of 10.
pub fn mod10_check_digit(digits: &str) -> u32 {
    let sum: u32 = digits
        .chars()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d * 3 } else { d })
        .sum();
    (10 - sum % 10) % 10
}

// =============================================================================
// Unit Tests
// =============================================================================
