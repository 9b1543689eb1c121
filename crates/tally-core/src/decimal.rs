//! # Decimal Math
//!
//! Exact base-10 arithmetic with explicit scale.
//!
//! ## Why Not Floats?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  In floating point:                                                     │
//! │    0.1 + 0.2 = 0.30000000000000004  ❌ WRONG!                           │
//! │                                                                         │
//! │  OUR SOLUTION: rust_decimal::Decimal                                    │
//! │    96-bit integer mantissa + base-10 scale                              │
//! │    0.1 + 0.2 = 0.3 exactly                                              │
//! │    Every operation names the scale it returns                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rounding Policy: HALF_UP
//! Every rounding step goes through [`round_half_up`]: scale by
//! 10^precision, add or subtract 0.5 according to sign, truncate, rescale.
//! In `rust_decimal` terms that is `RoundingStrategy::MidpointAwayFromZero`.
//! The result is always padded to the requested scale, so `150` rounded to
//! two places serializes as `"150.00"`.
//!
//! ## Usage
//! ```rust
//! use rust_decimal::Decimal;
//! use tally_core::decimal;
//!
//! let base = Decimal::new(1000, 2); // 10.00
//! let rate = Decimal::new(825, 2);  // 8.25 %
//! let fee = decimal::percent_of(base, rate, 2).unwrap();
//! assert_eq!(fee.to_string(), "0.83");
//! ```

use std::cmp::Ordering;
use std::str::FromStr;

use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Scale used for intermediate values (weights, interpolated rates, shares).
pub const INTERNAL_SCALE: u32 = 10;

/// Largest precision a caller may request for money results.
pub const MAX_PRECISION: u32 = 10;

/// Default money precision.
pub const DEFAULT_PRECISION: u32 = 2;

// =============================================================================
// Rounding
// =============================================================================

/// Rounds `value` HALF_UP to exactly `scale` decimal places.
///
/// ## Example
/// ```rust
/// use rust_decimal::Decimal;
/// use tally_core::decimal::round_half_up;
///
/// assert_eq!(round_half_up(Decimal::new(2345, 3), 2).to_string(), "2.35");
/// assert_eq!(round_half_up(Decimal::new(-2345, 3), 2).to_string(), "-2.35");
/// assert_eq!(round_half_up(Decimal::new(150, 0), 2).to_string(), "150.00");
/// ```
pub fn round_half_up(value: Decimal, scale: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(scale);
    rounded
}

/// Zero at the given scale.
pub fn zero(scale: u32) -> Decimal {
    round_half_up(Decimal::ZERO, scale)
}

// =============================================================================
// Arithmetic
// =============================================================================
//
// Every operation is checked: a result outside the 96-bit range is an
// `ARITHMETIC_OVERFLOW` error, never a panic.

fn overflow(operation: &str) -> CoreError {
    CoreError::ArithmeticOverflow {
        context: operation.to_string(),
    }
}

/// `a + b` at `scale`.
#[inline]
pub fn add(a: Decimal, b: Decimal, scale: u32) -> CoreResult<Decimal> {
    a.checked_add(b)
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow("add"))
}

/// `a - b` at `scale`.
#[inline]
pub fn sub(a: Decimal, b: Decimal, scale: u32) -> CoreResult<Decimal> {
    a.checked_sub(b)
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow("sub"))
}

/// `a × b` at `scale`.
#[inline]
pub fn mul(a: Decimal, b: Decimal, scale: u32) -> CoreResult<Decimal> {
    a.checked_mul(b)
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow("mul"))
}

/// Lenient division: a zero divisor yields zero.
pub fn div(a: Decimal, b: Decimal, scale: u32) -> CoreResult<Decimal> {
    if b.is_zero() {
        return Ok(zero(scale));
    }
    a.checked_div(b)
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow("div"))
}

/// Strict division: a zero divisor is an error.
///
/// `context` names the operation for the error message.
pub fn div_strict(a: Decimal, b: Decimal, scale: u32, context: &str) -> CoreResult<Decimal> {
    if b.is_zero() {
        return Err(CoreError::DivisionByZero {
            context: context.to_string(),
        });
    }
    a.checked_div(b)
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow(context))
}

/// Compares `a` and `b` after rounding both to `scale`.
pub fn compare(a: Decimal, b: Decimal, scale: u32) -> Ordering {
    round_half_up(a, scale).cmp(&round_half_up(b, scale))
}

/// `a ^ exp` at `scale`. `None` on overflow or `0 ^ negative`.
pub fn pow(a: Decimal, exp: i64, scale: u32) -> Option<Decimal> {
    a.checked_powi(exp).map(|v| round_half_up(v, scale))
}

/// `base × rate / 100` at `scale`.
///
/// Rates throughout the engine are percentages: `10` means 10 %.
pub fn percent_of(base: Decimal, rate: Decimal, scale: u32) -> CoreResult<Decimal> {
    base.checked_mul(rate)
        .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow("percent"))
}

/// Unrounded sum of `values`.
pub fn total<I>(values: I) -> CoreResult<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .ok_or_else(|| overflow("sum"))
}

/// Sum of `values` at `scale`.
pub fn sum<I>(values: I, scale: u32) -> CoreResult<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    total(values).map(|v| round_half_up(v, scale))
}

/// Product of `values` at `scale`; one for an empty list.
pub fn product<I>(values: I, scale: u32) -> CoreResult<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ONE, |acc, v| acc.checked_mul(v).map(|p| round_half_up(p, scale)))
        .ok_or_else(|| overflow("mul"))
}

/// `first - rest...`; zero for an empty list.
pub fn difference(values: &[Decimal], scale: u32) -> CoreResult<Decimal> {
    let Some((first, rest)) = values.split_first() else {
        return Ok(Decimal::ZERO);
    };
    rest.iter()
        .try_fold(*first, |acc, v| acc.checked_sub(*v))
        .map(|v| round_half_up(v, scale))
        .ok_or_else(|| overflow("sub"))
}

/// Clamps negative values to zero.
#[inline]
pub fn non_negative(value: Decimal) -> Decimal {
    if value.is_sign_negative() && !value.is_zero() {
        Decimal::ZERO
    } else {
        value
    }
}

// =============================================================================
// JSON Normalization
// =============================================================================

/// Parses a JSON number or numeric string into a decimal.
///
/// Numbers go through their source text, which serde_json keeps verbatim,
/// never through `f64`.
/// Exponent notation (`1e-7`) is accepted.
pub fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_text(&n.to_string()),
        Value::String(s) => parse_text(s.trim()),
        _ => None,
    }
}

/// Like [`to_decimal`], but non-numeric values normalize to zero.
pub fn normalize(value: &Value) -> Decimal {
    to_decimal(value).unwrap_or(Decimal::ZERO)
}

fn parse_text(text: &str) -> Option<Decimal> {
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_round_half_up_is_symmetric() {
        assert_eq!(round_half_up(d("2.345"), 2), d("2.35"));
        assert_eq!(round_half_up(d("-2.345"), 2), d("-2.35"));
        assert_eq!(round_half_up(d("2.344"), 2), d("2.34"));
        assert_eq!(round_half_up(d("0.825"), 2), d("0.83"));
        // HALF_UP, not bankers: 2.5 → 3
        assert_eq!(round_half_up(d("2.5"), 0), d("3"));
    }

    #[test]
    fn test_round_pads_scale() {
        assert_eq!(round_half_up(d("150"), 2).to_string(), "150.00");
        assert_eq!(zero(3).to_string(), "0.000");
    }

    #[test]
    fn test_arithmetic_at_scale() {
        assert_eq!(add(d("0.1"), d("0.2"), 2).unwrap().to_string(), "0.30");
        assert_eq!(sub(d("10"), d("3.333"), 2).unwrap().to_string(), "6.67");
        assert_eq!(mul(d("2.99"), d("3"), 2).unwrap().to_string(), "8.97");
        assert_eq!(div(d("10"), d("3"), 4).unwrap().to_string(), "3.3333");
        assert_eq!(product([d("2"), d("1.5"), d("3")], 2).unwrap(), d("9.00"));
        assert_eq!(difference(&[d("10"), d("2.5"), d("0.5")], 2).unwrap(), d("7.00"));
        assert_eq!(difference(&[], 2).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(div(d("10"), Decimal::ZERO, 2).unwrap().to_string(), "0.00");

        let err = div_strict(d("10"), Decimal::ZERO, 2, "test").unwrap_err();
        assert_eq!(err.error_code(), "DIVISION_BY_ZERO");
    }

    #[test]
    fn test_overflow_is_an_error() {
        let big = d("100000000000000000000");
        assert_eq!(mul(big, big, 2).unwrap_err().error_code(), "ARITHMETIC_OVERFLOW");
        assert_eq!(add(Decimal::MAX, Decimal::ONE, 0).unwrap_err().error_code(), "ARITHMETIC_OVERFLOW");
        assert!(sub(Decimal::MIN, Decimal::ONE, 0).is_err());
        assert!(percent_of(Decimal::MAX, d("200"), 2).is_err());
        assert!(sum([Decimal::MAX, Decimal::MAX], 2).is_err());
        assert!(total([Decimal::MAX, Decimal::ONE]).is_err());
        assert!(product([big, big], 2).is_err());
        assert!(div(Decimal::MAX, d("0.1"), 2).is_err());
        assert!(difference(&[Decimal::MIN, Decimal::MAX], 0).is_err());
    }

    #[test]
    fn test_compare_and_pow() {
        assert_eq!(compare(d("1.004"), d("1.0"), 2), Ordering::Equal);
        assert_eq!(compare(d("1.006"), d("1.0"), 2), Ordering::Greater);
        assert_eq!(pow(d("1.1"), 2, 2), Some(d("1.21")));
        assert_eq!(pow(d("2"), 10, 0), Some(d("1024")));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(d("1000"), d("8.25"), 2).unwrap(), d("82.50"));
        assert_eq!(percent_of(d("10.00"), d("8.25"), 2).unwrap(), d("0.83"));
    }

    #[test]
    fn test_json_normalization() {
        assert_eq!(to_decimal(&json!(12)), Some(d("12")));
        assert_eq!(to_decimal(&json!("12.50")), Some(d("12.50")));
        assert_eq!(to_decimal(&json!(0.1)), Some(d("0.1")));
        let parsed: Value = serde_json::from_str("12345678901234.567891").unwrap();
        assert_eq!(to_decimal(&parsed), Some(d("12345678901234.567891")));
        assert_eq!(to_decimal(&json!("abc")), None);
        assert_eq!(to_decimal(&json!(null)), None);
        assert_eq!(normalize(&json!("abc")), Decimal::ZERO);
        assert_eq!(normalize(&json!(true)), Decimal::ZERO);
    }

    #[test]
    fn test_non_negative() {
        assert_eq!(non_negative(d("-3")), Decimal::ZERO);
        assert_eq!(non_negative(d("3")), d("3"));
    }
}
