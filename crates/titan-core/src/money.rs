//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  FISCAL DOCUMENTS MUST ADD UP                                           │
//! │                                                                         │
//! │  The authority rejects an invoice when                                  │
//! │    ImpTotal != ImpNeto + ImpIVA                                         │
//! │                                                                         │
//! │  With floats, 100 lines of $8.26 + $1.74 can drift by a cent.           │
//! │                                                                         │
//! │  OUR SOLUTION: Integer Cents                                            │
//! │    net  = round(gross / (1 + rate))   (computed in cents)               │
//! │    tax  = gross - net                 (exact by construction)           │
//! │    Floats only appear at the wire boundary, from exact cents.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use titan_core::money::Money;
//! use titan_core::types::TaxRate;
//!
//! let gross = Money::from_cents(12100); // $121.00, VAT included
//! let (net, tax) = gross.split_inclusive_tax(TaxRate::from_bps(2100));
//! assert_eq!(net.cents(), 10000);
//! assert_eq!(tax.cents(), 2100);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use ts_rs::TS;

use crate::types::TaxRate;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary amount in cents (the smallest currency unit).
///
/// Signed so that credit notes can carry negative amounts later on;
/// invoices built by this crate are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents.
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is positive (greater than zero).
    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Multiplies money by a quantity.
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Splits a tax-inclusive amount into its net and tax parts.
    ///
    /// ## Formula
    /// ```text
    /// net = round_half_up(gross × 10000 / (10000 + bps))
    /// tax = gross − net
    /// ```
    /// `net + tax == gross` always holds, so per-line sums never drift.
    ///
    /// ## Example
    /// ```rust
    /// use titan_core::money::Money;
    /// use titan_core::types::TaxRate;
    ///
    /// // $10.00 at 21% VAT included → $8.26 net + $1.74 VAT
    /// let (net, tax) = Money::from_cents(1000).split_inclusive_tax(TaxRate::from_bps(2100));
    /// assert_eq!(net.cents(), 826);
    /// assert_eq!(tax.cents(), 174);
    /// ```
    pub fn split_inclusive_tax(&self, rate: TaxRate) -> (Money, Money) {
        if rate.is_zero() {
            return (*self, Money::zero());
        }

        // i128 keeps gross × 10000 from overflowing on large amounts
        let gross = self.0 as i128;
        let divisor = 10_000i128 + rate.bps() as i128;
        let scaled = gross * 10_000;

        // Round half away from zero
        let net = if scaled >= 0 {
            (scaled * 2 + divisor) / (divisor * 2)
        } else {
            (scaled * 2 - divisor) / (divisor * 2)
        };

        let net = Money(net as i64);
        (net, *self - net)
    }

    /// Returns the amount in major units as a float.
    ///
    /// ## Note
    /// Only for the authority wire format, which expects decimal numbers.
    /// Never do arithmetic on the result.
    #[inline]
    pub fn as_major_units(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(1099).to_string(), "$10.99");
        assert_eq!(Money::from_cents(500).to_string(), "$5.00");
        assert_eq!(Money::from_cents(-550).to_string(), "-$5.50");
    }

    #[test]
    fn test_split_exact_rate() {
        let (net, tax) = Money::from_cents(12100).split_inclusive_tax(TaxRate::from_bps(2100));
        assert_eq!(net.cents(), 10000);
        assert_eq!(tax.cents(), 2100);
    }

    #[test]
    fn test_split_rounds_and_preserves_gross() {
        // 1000 / 1.105 = 904.977 → 905
        let gross = Money::from_cents(1000);
        let (net, tax) = gross.split_inclusive_tax(TaxRate::from_bps(1050));
        assert_eq!(net.cents(), 905);
        assert_eq!(tax.cents(), 95);
        assert_eq!(net + tax, gross);
    }

    #[test]
    fn test_split_zero_rate() {
        let (net, tax) = Money::from_cents(777).split_inclusive_tax(TaxRate::zero());
        assert_eq!(net.cents(), 777);
        assert!(tax.is_zero());
    }

    #[test]
    fn test_sum_and_quantity() {
        let total: Money = [Money::from_cents(299), Money::from_cents(1)]
            .into_iter()
            .sum();
        assert_eq!(total.cents(), 300);
        assert_eq!(Money::from_cents(299).multiply_quantity(3).cents(), 897);
    }

    #[test]
    fn test_major_units() {
        assert!((Money::from_cents(12345).as_major_units() - 123.45).abs() < 1e-9);
    }
}
