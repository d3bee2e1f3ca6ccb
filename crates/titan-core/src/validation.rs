//! # Validation Module
//!
//! Input checks that run before anything touches the store or the authority.
//!
//! ## Where Validation Happens
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  enqueue(sale_id)      → validate_sale_id      (before the upsert)      │
//! │  FiscalConfig          → validate_cuit,        (at startup)             │
//! │                          validate_point_of_sale                          │
//! │  InvoiceBuilder        → validate_cuit         (customer tax id)        │
//! │  SQLite                → UNIQUE(sale_id), NOT NULL, CHECK constraints   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use titan_core::validation::validate_cuit;
//!
//! assert_eq!(validate_cuit("20-12345678-6").unwrap(), "20123456786");
//! assert!(validate_cuit("20-12345678-0").is_err());
//! ```

use crate::error::ValidationError;
use crate::MAX_SALE_ID_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const CUIT_WEIGHTS: [u32; 10] = [5, 4, 3, 2, 7, 6, 5, 4, 3, 2];

/// Validates a CUIT and returns its 11 digits without separators.
///
/// ## Rules
/// - Hyphens and spaces are ignored
/// - Exactly 11 digits
/// - The last digit is the mod-11 check digit of the first ten
///   (weights 5,4,3,2,7,6,5,4,3,2; a remainder giving 10 is never valid)
pub fn validate_cuit(raw: &str) -> ValidationResult<String> {
    let digits: String = raw
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();

    if digits.is_empty() {
        return Err(ValidationError::Required {
            field: "tax_id".to_string(),
        });
    }

    if digits.len() != 11 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "tax_id".to_string(),
            reason: "must be 11 digits".to_string(),
        });
    }

    let values: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    let sum: u32 = values
        .iter()
        .zip(CUIT_WEIGHTS.iter())
        .map(|(d, w)| d * w)
        .sum();

    let expected = match 11 - (sum % 11) {
        11 => 0,
        10 => {
            return Err(ValidationError::InvalidFormat {
                field: "tax_id".to_string(),
                reason: "no valid check digit for this prefix".to_string(),
            })
        }
        n => n,
    };

    if values[10] != expected {
        return Err(ValidationError::InvalidFormat {
            field: "tax_id".to_string(),
            reason: "check digit mismatch".to_string(),
        });
    }

    Ok(digits)
}

/// Validates a sale id before it is used as a queue key.
pub fn validate_sale_id(sale_id: &str) -> ValidationResult<()> {
    let sale_id = sale_id.trim();

    if sale_id.is_empty() {
        return Err(ValidationError::Required {
            field: "sale_id".to_string(),
        });
    }

    if sale_id.len() > MAX_SALE_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "sale_id".to_string(),
            max: MAX_SALE_ID_LEN,
        });
    }

    Ok(())
}

/// Points of sale are 1..=99999 (five digits on the barcode).
pub fn validate_point_of_sale(point_of_sale: u32) -> ValidationResult<()> {
    if point_of_sale == 0 || point_of_sale > 99_999 {
        return Err(ValidationError::OutOfRange {
            field: "point_of_sale".to_string(),
            min: 1,
            max: 99_999,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_cuits() {
        assert_eq!(validate_cuit("20123456786").unwrap(), "20123456786");
        assert_eq!(validate_cuit("30-71234567-1").unwrap(), "30712345671");
        assert_eq!(validate_cuit(" 33 69345023 9 ").unwrap(), "33693450239");
    }

    #[test]
    fn test_invalid_cuits() {
        assert!(matches!(
            validate_cuit(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(validate_cuit("2012345678").is_err());
        assert!(validate_cuit("2012345678A").is_err());
        assert!(validate_cuit("20123456787").is_err());
    }

    #[test]
    fn test_sale_id() {
        assert!(validate_sale_id("42").is_ok());
        assert!(validate_sale_id("   ").is_err());
        assert!(validate_sale_id(&"x".repeat(MAX_SALE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_point_of_sale() {
        assert!(validate_point_of_sale(1).is_ok());
        assert!(validate_point_of_sale(0).is_err());
        assert!(validate_point_of_sale(100_000).is_err());
    }
}
