//! # Allocation & Reconciliation
//!
//! Spreads order-scoped amounts over lines and makes the line fees add up
//! to the total exactly.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  weight_i   = value_i / Σ value          (internal scale)               │
//! │  share_i,c  = amount_c × weight_i        (order-scoped components)      │
//! │  fee_i      = round(Σ attributions_i + Σ shares_i, precision)           │
//! │  total      = round(Σ component amounts, precision)                     │
//! │  drift      = total − Σ fee_i                                           │
//! │             └──► added to the line with the largest fee (first wins)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! After reconciliation `Σ fee_amount == total` holds for every strategy.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::amount::{AmountLine, AmountModel};
use crate::decimal::{self, round_half_up, INTERNAL_SCALE};
use crate::error::CoreResult;
use crate::evaluator::ComponentResult;
use crate::policy::Scope;
use crate::trace::Trace;
use crate::types::AllocationStrategy;

/// One component's part of a line fee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentShare {
    pub component_id: String,
    pub amount: Decimal,
}

/// Final fee of one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineAllocation {
    pub line_id: String,
    pub fee_amount: Decimal,
    pub components: Vec<ComponentShare>,
    /// Drift absorbed by this line; zero on every other line.
    pub rounding_adjustment: Decimal,
}

/// Reconciliation report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub strategy: AllocationStrategy,
    pub total: Decimal,
    pub sum_before: Decimal,
    pub drift: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_line_id: Option<String>,
}

/// Allocates `results` over the model's lines and reconciles the drift.
pub fn allocate(
    results: &[ComponentResult],
    model: &AmountModel,
    strategy: AllocationStrategy,
    precision: u32,
    trace: &mut Trace,
) -> CoreResult<(Vec<LineAllocation>, Reconciliation)> {
    let has_order_amounts = results.iter().any(|r| r.scope == Scope::Order);
    let weights = weights(&model.lines, strategy, has_order_amounts, trace)?;

    let mut allocations: Vec<LineAllocation> = Vec::with_capacity(model.lines.len());
    for (line, weight) in model.lines.iter().zip(&weights) {
        let mut raw = Decimal::ZERO;
        let mut components = Vec::new();
        for result in results {
            let part = match result.scope {
                Scope::Line => result
                    .lines
                    .iter()
                    .find(|a| a.line_id == line.line_id)
                    .map(|a| a.amount),
                Scope::Order => Some(decimal::mul(result.amount, *weight, INTERNAL_SCALE)?),
            };
            if let Some(part) = part {
                raw = decimal::add(raw, part, INTERNAL_SCALE)?;
                components.push(ComponentShare {
                    component_id: result.component_id.clone(),
                    amount: round_half_up(part, precision),
                });
            }
        }
        allocations.push(LineAllocation {
            line_id: line.line_id.clone(),
            fee_amount: round_half_up(raw, precision),
            components,
            rounding_adjustment: decimal::zero(precision),
        });
    }

    trace.step(
        "allocated",
        json!({
            "strategy": strategy,
            "weights": weights.iter().map(|w| w.normalize()).collect::<Vec<_>>(),
        }),
    );

    let total = decimal::sum(results.iter().map(|r| r.amount), precision)?;
    let sum_before = decimal::sum(allocations.iter().map(|a| a.fee_amount), precision)?;
    let drift = decimal::sub(total, sum_before, precision)?;

    let mut adjusted_line_id = None;
    if !drift.is_zero() {
        if let Some(index) = largest_fee(&allocations) {
            let target = &mut allocations[index];
            target.fee_amount = decimal::add(target.fee_amount, drift, precision)?;
            target.rounding_adjustment = drift;
            adjusted_line_id = Some(target.line_id.clone());
        }
    }

    debug!(%total, %drift, ?adjusted_line_id, "Allocation reconciled");
    trace.step(
        "reconciled",
        json!({
            "total": total,
            "sum_before": sum_before,
            "drift": drift,
            "adjusted_line_id": adjusted_line_id,
        }),
    );

    let reconciliation = Reconciliation {
        strategy,
        total,
        sum_before,
        drift,
        adjusted_line_id,
    };
    Ok((allocations, reconciliation))
}

/// Per-line weights at internal scale. A non-positive weight sum falls
/// back to an equal split.
pub fn weights(
    lines: &[AmountLine],
    strategy: AllocationStrategy,
    warn_on_fallback: bool,
    trace: &mut Trace,
) -> CoreResult<Vec<Decimal>> {
    let values: Vec<Decimal> = lines
        .iter()
        .map(|line| match strategy {
            AllocationStrategy::ByNet => line.net,
            AllocationStrategy::ByGross => line.gross,
            AllocationStrategy::ByQuantity => line.quantity,
            AllocationStrategy::Equal => Decimal::ONE,
        })
        .collect();
    let total = decimal::total(values.iter().copied())?;

    if total > Decimal::ZERO {
        return values
            .iter()
            .map(|v| decimal::div(*v, total, INTERNAL_SCALE))
            .collect();
    }

    if warn_on_fallback {
        trace.warn(
            "ALLOCATION_ZERO_WEIGHT",
            format!("{} weights sum to zero; splitting equally", strategy),
        );
    }
    let count = Decimal::from(lines.len().max(1));
    lines
        .iter()
        .map(|_| decimal::div(Decimal::ONE, count, INTERNAL_SCALE))
        .collect()
}

/// Index of the largest fee; the first line wins ties.
fn largest_fee(allocations: &[LineAllocation]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, allocation) in allocations.iter().enumerate() {
        match best {
            Some(b) if allocation.fee_amount <= allocations[b].fee_amount => {}
            _ => best = Some(index),
        }
    }
    best
}

// =============================================================================
// Unit Tests
// =============================================================================
