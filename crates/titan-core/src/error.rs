//! # Error Types
//!
//! Domain-specific error types for titan-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  titan-core errors (this file)                                         │
//! │  ├── CoreError        - General domain errors                          │
//! │  ├── BuildError       - Sale cannot become a fiscal document           │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  titan-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  titan-fiscal errors (separate crate)                                  │
//! │  ├── FiscalError      - Configuration, storage, transport              │
//! │  └── Failure          - Retryable | Terminal, per job attempt          │
//! │                                                                         │
//! │  Flow: BuildError → Failure::Terminal → job error payload → status     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stored enum value is not one we know.
    ///
    /// ## When This Occurs
    /// - A row was written by a newer version with an extra status
    /// - Manual edits to the database
    #[error("Unknown {kind} value: {value}")]
    UnknownValue { kind: &'static str, value: String },

    /// The sale cannot be turned into a fiscal document.
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Build Error
// =============================================================================

/// Reasons a sale cannot be built into a fiscal document.
///
/// Every variant is terminal for the job: retrying the same sale produces the
/// same document, so no authority call is ever made for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// The document total would be zero or negative.
    #[error("Sale total must be positive, got {total_cents} cents")]
    NonPositiveTotal { total_cents: i64 },

    /// A line item has zero or negative quantity.
    #[error("Line {line}: quantity must be positive, got {quantity}")]
    InvalidQuantity { line: usize, quantity: i64 },

    /// A line item has a negative unit price.
    #[error("Line {line}: unit price must not be negative, got {unit_price_cents} cents")]
    NegativeUnitPrice { line: usize, unit_price_cents: i64 },

    /// The tax rate has no authority VAT id.
    ///
    /// ## When This Occurs
    /// - A product was configured with a rate the authority does not accept
    ///   (supported: 0%, 2.5%, 5%, 10.5%, 21%, 27%)
    #[error("Unsupported tax rate: {bps} bps")]
    UnsupportedTaxRate { bps: u32 },

    /// Only Argentine pesos can be invoiced.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// The customer's tax id is malformed.
    #[error("Invalid customer tax id: {0}")]
    InvalidTaxId(#[from] ValidationError),
}

impl BuildError {
    /// Short machine-readable kind, stored in the job error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::NonPositiveTotal { .. } => "non_positive_total",
            BuildError::InvalidQuantity { .. } => "invalid_quantity",
            BuildError::NegativeUnitPrice { .. } => "negative_unit_price",
            BuildError::UnsupportedTaxRate { .. } => "unsupported_tax_rate",
            BuildError::UnsupportedCurrency(_) => "unsupported_currency",
            BuildError::InvalidTaxId(_) => "invalid_tax_id",
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (wrong length, bad check digit, etc.).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_messages() {
        let err = BuildError::InvalidQuantity { line: 2, quantity: 0 };
        assert_eq!(err.to_string(), "Line 2: quantity must be positive, got 0");
        assert_eq!(err.kind(), "invalid_quantity");

        let err = BuildError::UnsupportedCurrency("USD".to_string());
        assert_eq!(err.to_string(), "Unsupported currency: USD");
    }

    #[test]
    fn test_validation_converts_to_build_error() {
        let validation_err = ValidationError::InvalidFormat {
            field: "tax_id".to_string(),
            reason: "check digit mismatch".to_string(),
        };
        let build_err: BuildError = validation_err.into();
        assert_eq!(build_err.kind(), "invalid_tax_id");

        let core_err: CoreError = build_err.into();
        assert!(matches!(core_err, CoreError::Build(_)));
    }
}
