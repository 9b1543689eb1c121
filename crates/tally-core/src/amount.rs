//! # Amount Normalizer
//!
//! Turns partial line records into a fully populated [`AmountModel`].
//!
//! ## Derivation Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  given            │ tax                          │ missing side          │
//! │  ─────────────────┼──────────────────────────────┼─────────────────────  │
//! │  net + gross      │ tax ?? gross − net           │ –                     │
//! │  net              │ tax ?? net × rate ?? 0       │ gross = net + tax     │
//! │  gross + tax      │ tax                          │ net = gross − tax     │
//! │  gross + rate     │ gross − net                  │ net = gross/(1+rate)  │
//! │  gross            │ 0                            │ net = gross           │
//! │  neither          │ MISSING_AMOUNT (always fatal)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The order aggregate is the field-wise sum of lines unless the caller
//! supplies an explicit order total, which wins field by field.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::condition;
use crate::decimal::{self, round_half_up, INTERNAL_SCALE};
use crate::error::{CoreResult, ValidationError};
use crate::types::{LineInput, OrderInput};

// =============================================================================
// Model Types
// =============================================================================

/// A normalized line: net, tax and gross are always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmountLine {
    pub line_id: String,
    pub net: Decimal,
    pub tax: Decimal,
    pub gross: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub category: Option<String>,
    pub flags: Vec<String>,
    pub meta: Value,
}

impl AmountLine {
    /// Numeric field by name, case-insensitive.
    ///
    /// `meta.<path>` reads numeric values out of the line's meta map.
    pub fn field(&self, name: &str) -> Option<Decimal> {
        let lower = name.to_ascii_lowercase();
        if let Some(path) = lower.strip_prefix("meta.") {
            return condition::lookup(&self.meta, path).and_then(decimal::to_decimal);
        }
        match lower.as_str() {
            "net" | "line_total" => Some(self.net),
            "tax" => Some(self.tax),
            "gross" => Some(self.gross),
            "shipping" => Some(self.shipping),
            "discount" => Some(self.discount),
            "quantity" | "qty" => Some(self.quantity),
            "unit_price" => Some(self.unit_price),
            _ => None,
        }
    }

    /// JSON view of the line, used as the context of line selectors.
    pub fn context(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Order-level totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderAggregate {
    pub net: Decimal,
    pub tax: Decimal,
    pub gross: Decimal,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub quantity: Decimal,
}

impl OrderAggregate {
    /// Numeric field by name, case-insensitive.
    pub fn field(&self, name: &str) -> Option<Decimal> {
        match name.to_ascii_lowercase().as_str() {
            "net" | "total" | "order_total" => Some(self.net),
            "tax" => Some(self.tax),
            "gross" | "order_gross" => Some(self.gross),
            "shipping" => Some(self.shipping),
            "discount" => Some(self.discount),
            "quantity" | "qty" => Some(self.quantity),
            _ => None,
        }
    }
}

/// Normalized evaluation input of one calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmountModel {
    pub lines: Vec<AmountLine>,
    pub order: OrderAggregate,
    /// Aggregate fields taken from the explicit order total.
    pub overridden: Vec<String>,
}

impl AmountModel {
    pub fn line(&self, line_id: &str) -> Option<&AmountLine> {
        self.lines.iter().find(|l| l.line_id == line_id)
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Builds the amount model from raw lines and an optional order override.
///
/// ## Example
/// ```rust
/// use rust_decimal::Decimal;
/// use tally_core::amount::build;
/// use tally_core::types::LineInput;
///
/// let line = LineInput {
///     net: Some(Decimal::new(100, 0)),
///     tax_rate: Some(Decimal::new(20, 0)),
///     ..LineInput::default()
/// };
/// let model = build(&[line], None, 2).unwrap();
/// assert_eq!(model.lines[0].gross.to_string(), "120.00");
/// assert_eq!(model.order.tax.to_string(), "20.00");
/// ```
pub fn build(lines: &[LineInput], order: Option<&OrderInput>, precision: u32) -> CoreResult<AmountModel> {
    if lines.is_empty() {
        return Err(ValidationError::EmptyLines.into());
    }

    let lines = lines
        .iter()
        .enumerate()
        .map(|(index, line)| normalize_line(index, line, precision))
        .collect::<CoreResult<Vec<_>>>()?;

    let sum = |f: fn(&AmountLine) -> Decimal| decimal::sum(lines.iter().map(f), precision);
    let mut aggregate = OrderAggregate {
        net: sum(|l| l.net)?,
        tax: sum(|l| l.tax)?,
        gross: sum(|l| l.gross)?,
        shipping: sum(|l| l.shipping)?,
        discount: sum(|l| l.discount)?,
        quantity: decimal::total(lines.iter().map(|l| l.quantity))?,
    };

    let mut overridden = Vec::new();
    if let Some(order) = order {
        let fields = [
            ("net", order.net, &mut aggregate.net),
            ("tax", order.tax, &mut aggregate.tax),
            ("gross", order.gross, &mut aggregate.gross),
            ("shipping", order.shipping, &mut aggregate.shipping),
            ("discount", order.discount, &mut aggregate.discount),
        ];
        for (name, explicit, slot) in fields {
            if let Some(value) = explicit {
                *slot = round_half_up(value, precision);
                overridden.push(name.to_string());
            }
        }
        if let Some(quantity) = order.quantity {
            aggregate.quantity = quantity;
            overridden.push("quantity".to_string());
        }
    }

    Ok(AmountModel {
        lines,
        order: aggregate,
        overridden,
    })
}

/// Normalizes one line. `index` is zero-based; default ids are `L1`, `L2`, ...
pub fn normalize_line(index: usize, input: &LineInput, precision: u32) -> CoreResult<AmountLine> {
    let line_id = input
        .line_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("L{}", index + 1));

    if input.quantity.is_sign_negative() && !input.quantity.is_zero() {
        return Err(ValidationError::NegativeQuantity {
            line_id,
            quantity: input.quantity,
        }
        .into());
    }

    let (net, tax, gross) = match (input.net, input.gross) {
        (Some(net), Some(gross)) => {
            let tax = match input.tax {
                Some(tax) => tax,
                None => decimal::sub(gross, net, precision)?,
            };
            (net, tax, gross)
        }
        (Some(net), None) => {
            let tax = match (input.tax, input.tax_rate) {
                (Some(tax), _) => tax,
                (None, Some(rate)) => decimal::percent_of(net, rate, precision)?,
                (None, None) => Decimal::ZERO,
            };
            (net, tax, decimal::add(net, tax, precision)?)
        }
        (None, Some(gross)) => match (input.tax, input.tax_rate) {
            (Some(tax), _) => (decimal::sub(gross, tax, precision)?, tax, gross),
            (None, Some(rate)) => {
                let divisor = decimal::add(Decimal::ONE, rate / Decimal::ONE_HUNDRED, INTERNAL_SCALE)?;
                let net = decimal::div(gross, divisor, precision)?;
                (net, decimal::sub(gross, net, precision)?, gross)
            }
            (None, None) => (gross, Decimal::ZERO, gross),
        },
        (None, None) => return Err(ValidationError::MissingAmount { line_id }.into()),
    };

    let net = round_half_up(net, precision);
    Ok(AmountLine {
        unit_price: decimal::div(net, input.quantity, precision)?,
        net,
        tax: round_half_up(tax, precision),
        gross: round_half_up(gross, precision),
        shipping: round_half_up(input.shipping.unwrap_or(Decimal::ZERO), precision),
        discount: round_half_up(input.discount.unwrap_or(Decimal::ZERO), precision),
        quantity: input.quantity,
        category: input.category.clone(),
        flags: input.flags.clone(),
        meta: Value::Object(input.meta.clone()),
        line_id,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
