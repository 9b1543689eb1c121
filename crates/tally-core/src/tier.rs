//! # Tier/Bracket Calculator
//!
//! Progressive-rate mathematics shared by fee tiers and payroll brackets.
//!
//! ## Modes
//! ```text
//! Brackets: [0 – 1000 @ 0%] [1000 – 2000 @ 10%]      base = 1500
//!
//! MARGINAL      each bracket taxes only its own slice
//!               0% × 1000  +  10% × 500            = 50
//!
//! FLAT          the bracket containing the base taxes all of it
//!               10% × 1500                          = 150
//!
//! INTERPOLATED  rate slides between this bracket and the next
//!               (last bracket → its own rate)       = 10% × 1500 = 150
//! ```
//!
//! Brackets are sorted ascending by `from` before use. A bracket is selected
//! by the highest lower bound that does not exceed the key. The last bracket
//! is open-ended, and every amount is clamped at zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{self, INTERNAL_SCALE};
use crate::error::CoreResult;

/// Progressive calculation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    /// Tax-bracket style: each rate applies to its own slice.
    #[default]
    Marginal,
    /// Volume-pricing style: one rate for the whole base.
    Flat,
    /// Linear rate interpolation between bracket boundaries.
    Interpolated,
}

/// One `[from, to)` bracket. Rates are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub from: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Decimal>,
    pub rate: Decimal,
    /// Subtracted once, at the selected bracket.
    #[serde(default)]
    pub deduction: Decimal,
}

impl Bracket {
    pub fn new(from: Decimal, to: Option<Decimal>, rate: Decimal) -> Self {
        Bracket {
            from,
            to,
            rate,
            deduction: Decimal::ZERO,
        }
    }
}

/// Slice taxed by one bracket (MARGINAL mode).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketContribution {
    pub index: usize,
    pub portion: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// Result of a tier calculation, at internal scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierOutcome {
    /// False when the key is below the lowest bracket (or there are none).
    pub matched: bool,
    pub amount: Decimal,
    /// Rate actually applied (the interpolated rate in INTERPOLATED mode).
    pub rate: Option<Decimal>,
    /// Index into the sorted bracket list.
    pub bracket_index: Option<usize>,
    pub deduction: Decimal,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contributions: Vec<BracketContribution>,
}

impl TierOutcome {
    fn unmatched() -> Self {
        TierOutcome {
            matched: false,
            amount: Decimal::ZERO,
            rate: None,
            bracket_index: None,
            deduction: Decimal::ZERO,
            contributions: Vec::new(),
        }
    }
}

/// Returns the brackets sorted ascending by lower bound (stable).
pub fn sorted(brackets: &[Bracket]) -> Vec<Bracket> {
    let mut out = brackets.to_vec();
    out.sort_by(|a, b| a.from.cmp(&b.from));
    out
}

/// Index of the bracket with the highest `from` not above `key`.
pub fn select(key: Decimal, sorted: &[Bracket]) -> Option<usize> {
    sorted.iter().rposition(|b| b.from <= key)
}

/// Applies the tier table to `base`.
pub fn calculate(base: Decimal, brackets: &[Bracket], mode: TierMode) -> CoreResult<TierOutcome> {
    calculate_on(base, base, brackets, mode)
}

/// Selects the bracket by `key` and applies the rate to `amount_base`.
///
/// MARGINAL mode slices `key` itself, so `amount_base` only matters for
/// FLAT and INTERPOLATED.
pub fn calculate_on(
    key: Decimal,
    amount_base: Decimal,
    brackets: &[Bracket],
    mode: TierMode,
) -> CoreResult<TierOutcome> {
    let table = sorted(brackets);
    let Some(index) = select(key, &table) else {
        return Ok(TierOutcome::unmatched());
    };
    let selected = &table[index];

    match mode {
        TierMode::Marginal => {
            let mut contributions = Vec::with_capacity(index + 1);
            for (i, bracket) in table.iter().enumerate().take(index + 1) {
                let upper = upper_bound(&table, i).map_or(key, |upper| key.min(upper));
                let portion = decimal::non_negative(decimal::sub(upper, bracket.from, INTERNAL_SCALE)?);
                contributions.push(BracketContribution {
                    index: i,
                    portion,
                    rate: bracket.rate,
                    amount: decimal::percent_of(portion, bracket.rate, INTERNAL_SCALE)?,
                });
            }
            let gross = decimal::sum(contributions.iter().map(|c| c.amount), INTERNAL_SCALE)?;
            Ok(TierOutcome {
                matched: true,
                amount: decimal::non_negative(decimal::sub(gross, selected.deduction, INTERNAL_SCALE)?),
                rate: Some(selected.rate),
                bracket_index: Some(index),
                deduction: selected.deduction,
                contributions,
            })
        }
        TierMode::Flat => flat_outcome(index, selected.rate, selected.deduction, amount_base),
        TierMode::Interpolated => {
            let rate = interpolated_rate(key, &table, index)?;
            flat_outcome(index, rate, selected.deduction, amount_base)
        }
    }
}

fn flat_outcome(index: usize, rate: Decimal, deduction: Decimal, base: Decimal) -> CoreResult<TierOutcome> {
    let gross = decimal::percent_of(base, rate, INTERNAL_SCALE)?;
    Ok(TierOutcome {
        matched: true,
        amount: decimal::non_negative(decimal::sub(gross, deduction, INTERNAL_SCALE)?),
        rate: Some(rate),
        bracket_index: Some(index),
        deduction,
        contributions: Vec::new(),
    })
}

/// Upper edge of bracket `i`; the last bracket is open-ended.
fn upper_bound(table: &[Bracket], i: usize) -> Option<Decimal> {
    if i + 1 >= table.len() {
        return None;
    }
    Some(table[i].to.unwrap_or(table[i + 1].from))
}

fn interpolated_rate(key: Decimal, table: &[Bracket], index: usize) -> CoreResult<Decimal> {
    let bracket = &table[index];
    let Some(upper) = upper_bound(table, index) else {
        return Ok(bracket.rate);
    };
    let span = decimal::sub(upper, bracket.from, INTERNAL_SCALE)?;
    if span <= Decimal::ZERO {
        return Ok(bracket.rate);
    }
    let offset = decimal::sub(key, bracket.from, INTERNAL_SCALE)?;
    let position = decimal::div(offset, span, INTERNAL_SCALE)?.min(Decimal::ONE);
    let step = decimal::sub(table[index + 1].rate, bracket.rate, INTERNAL_SCALE)?;
    decimal::add(bracket.rate, decimal::mul(step, position, INTERNAL_SCALE)?, INTERNAL_SCALE)
}

// =============================================================================
// Unit Tests
// =============================================================================
