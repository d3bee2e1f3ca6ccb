//! # Invoice Builder
//!
//! Turns a completed sale into an unsigned [`FiscalDocument`].
//!
//! ## Build Steps
//! ```text
//! SaleRecord ──► currency (ARS → PES)
//!            ──► recipient (CUIT → 80/number, else 99/0)
//!            ──► lines (structured, or one synthesized line)
//!            ──► per-line split: net = round(gross / (1 + rate)), tax = gross − net
//!            ──► totals + VAT grouped per rate
//!            ──► document type (A when total ≥ threshold and CUIT present, else B)
//! ```
//!
//! The builder never reads the clock or the random generator: the issue
//! instant and local reference come in through [`BuildContext`], so the same
//! inputs always build the same document.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::document::{
    DocumentType, FiscalDocument, FiscalLine, IssuerProfile, Recipient, Totals, VatBreakdown,
    CONCEPT_PRODUCTS, RECIPIENT_DOC_CUIT,
};
use crate::error::BuildError;
use crate::money::Money;
use crate::types::{SaleRecord, TaxRate};
use crate::validation::validate_cuit;

// =============================================================================
// Rules & Context
// =============================================================================

/// Tenant-level invoicing rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRules {
    /// Totals at or above this amount get a Factura A when the customer has a CUIT.
    pub factura_a_threshold: Money,
    /// Description of the synthesized line for sales without line items.
    pub fallback_description: String,
    /// Rate of the synthesized line.
    pub default_tax_rate: TaxRate,
}

impl Default for InvoiceRules {
    fn default() -> Self {
        Self {
            factura_a_threshold: Money::zero(),
            fallback_description: crate::DEFAULT_LINE_DESCRIPTION.to_string(),
            default_tax_rate: TaxRate::default(),
        }
    }
}

/// Per-attempt inputs that would otherwise come from the environment.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub issued_at: DateTime<Utc>,
    pub local_reference: String,
}

impl BuildContext {
    /// Context for "now" with a fresh local reference.
    pub fn now() -> Self {
        let issued_at = Utc::now();
        Self {
            issued_at,
            local_reference: generate_local_reference(issued_at),
        }
    }
}

/// Trace reference: `YYYYMMDDHHMMSS-NNNN`.
///
/// Not unique and not sequential; the fiscal number is assigned by the
/// authority client.
pub fn generate_local_reference(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{}-{:04}", now.format("%Y%m%d%H%M%S"), suffix)
}

// =============================================================================
// Builder
// =============================================================================

/// Builds fiscal documents for one issuer.
#[derive(Debug, Clone)]
pub struct InvoiceBuilder {
    issuer: IssuerProfile,
    rules: InvoiceRules,
}

impl InvoiceBuilder {
    pub fn new(issuer: IssuerProfile, rules: InvoiceRules) -> Self {
        Self { issuer, rules }
    }

    pub fn issuer(&self) -> &IssuerProfile {
        &self.issuer
    }

    pub fn rules(&self) -> &InvoiceRules {
        &self.rules
    }

    /// Builds the document for `sale`.
    ///
    /// ## Errors
    /// Any [`BuildError`]; all of them are terminal for the job.
    pub fn build(&self, sale: &SaleRecord, ctx: &BuildContext) -> Result<FiscalDocument, BuildError> {
        let currency = authority_currency(&sale.currency)?;
        let recipient = build_recipient(sale)?;
        let lines = self.build_lines(sale)?;

        let totals = Totals {
            net: lines.iter().map(|l| l.net).sum(),
            tax: lines.iter().map(|l| l.tax).sum(),
            total: lines.iter().map(|l| l.gross).sum(),
        };

        if !totals.total.is_positive() {
            return Err(BuildError::NonPositiveTotal {
                total_cents: totals.total.cents(),
            });
        }

        let vat = group_vat(&lines);

        let document_type =
            if totals.total >= self.rules.factura_a_threshold && !recipient.is_final_consumer() {
                DocumentType::FacturaA
            } else {
                DocumentType::FacturaB
            };

        Ok(FiscalDocument {
            document_type,
            point_of_sale: self.issuer.point_of_sale,
            voucher_number: None,
            issued_at: ctx.issued_at,
            local_reference: ctx.local_reference.clone(),
            issuer: self.issuer.clone(),
            recipient,
            concept: CONCEPT_PRODUCTS,
            currency,
            lines,
            vat,
            totals,
            cae: None,
            cae_expiry: None,
            barcode: None,
            qr_payload: None,
        })
    }

    fn build_lines(&self, sale: &SaleRecord) -> Result<Vec<FiscalLine>, BuildError> {
        if sale.lines.is_empty() {
            if sale.total_cents <= 0 {
                return Err(BuildError::NonPositiveTotal {
                    total_cents: sale.total_cents,
                });
            }
            let line = price_line(
                self.rules.fallback_description.clone(),
                1,
                sale.total(),
                self.rules.default_tax_rate,
            )?;
            return Ok(vec![line]);
        }

        sale.lines
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                let number = idx + 1;
                if line.quantity <= 0 {
                    return Err(BuildError::InvalidQuantity {
                        line: number,
                        quantity: line.quantity,
                    });
                }
                if line.unit_price_cents < 0 {
                    return Err(BuildError::NegativeUnitPrice {
                        line: number,
                        unit_price_cents: line.unit_price_cents,
                    });
                }
                price_line(
                    line.description.clone(),
                    line.quantity,
                    line.unit_price(),
                    line.tax_rate(),
                )
            })
            .collect()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn authority_currency(currency: &str) -> Result<String, BuildError> {
    match currency.trim().to_ascii_uppercase().as_str() {
        "ARS" => Ok("PES".to_string()),
        _ => Err(BuildError::UnsupportedCurrency(currency.to_string())),
    }
}

fn build_recipient(sale: &SaleRecord) -> Result<Recipient, BuildError> {
    let Some(customer) = &sale.customer else {
        return Ok(Recipient::final_consumer());
    };

    match customer.tax_id.as_deref().map(str::trim) {
        Some(tax_id) if !tax_id.is_empty() => {
            let digits = validate_cuit(tax_id)?;
            Ok(Recipient {
                doc_type: RECIPIENT_DOC_CUIT,
                doc_number: digits.parse().unwrap_or_default(),
                name: Some(customer.name.clone()),
                vat_condition: 1,
            })
        }
        _ => Ok(Recipient {
            name: Some(customer.name.clone()),
            ..Recipient::final_consumer()
        }),
    }
}

fn price_line(
    description: String,
    quantity: i64,
    unit_price: Money,
    tax_rate: TaxRate,
) -> Result<FiscalLine, BuildError> {
    if tax_rate.vat_id().is_none() {
        return Err(BuildError::UnsupportedTaxRate {
            bps: tax_rate.bps(),
        });
    }

    let gross = unit_price.multiply_quantity(quantity);
    let (net, tax) = gross.split_inclusive_tax(tax_rate);

    Ok(FiscalLine {
        description,
        quantity,
        unit_price,
        tax_rate,
        net,
        tax,
        gross,
    })
}

fn group_vat(lines: &[FiscalLine]) -> Vec<VatBreakdown> {
    let mut groups: BTreeMap<TaxRate, (Money, Money)> = BTreeMap::new();
    for line in lines {
        let entry = groups.entry(line.tax_rate).or_default();
        entry.0 += line.net;
        entry.1 += line.tax;
    }

    groups
        .into_iter()
        .filter_map(|(rate, (base, amount))| {
            rate.vat_id().map(|vat_id| VatBreakdown {
                vat_id,
                rate,
                base,
                amount,
            })
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
