//! # Validation Module
//!
//! Structural checks that run before any policy work starts.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Deserialization (serde)                                       │
//! │  ├── Types, enum tags, decimal parsing                                  │
//! │  └── Unknown component types are rejected here                          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                   │
//! │  ├── currency, lines, amounts, quantities, precision                    │
//! │  └── policy keys, date windows, cap bounds                              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Engine                                                        │
//! │  └── Strict-mode data edge cases (missing fields, unmatched tiers)      │
//! │                                                                         │
//! │  Layers 1 and 2 are fatal in every mode.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::types::Options;
//! use tally_core::validation::validate_options;
//!
//! assert!(validate_options(&Options::default()).is_ok());
//! ```

use crate::decimal::MAX_PRECISION;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::formula::PayrollInput;
use crate::policy::{ComponentKind, Policy};
use crate::types::{CalculationInput, Options};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Input Validators
// =============================================================================

/// Validates a calculation input.
///
/// ## Rules
/// - `currency` must not be blank
/// - At least one line
/// - Every line gives net or gross
/// - No negative quantity
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use tally_core::types::CalculationInput;
/// use tally_core::validation::validate_input;
///
/// let input: CalculationInput = serde_json::from_value(json!({
///     "currency": "EUR",
///     "lines": [{"net": 10}]
/// })).unwrap();
/// assert!(validate_input(&input).is_ok());
/// ```
pub fn validate_input(input: &CalculationInput) -> ValidationResult<()> {
    if input.currency.trim().is_empty() {
        return Err(ValidationError::MissingCurrency);
    }

    if input.lines.is_empty() {
        return Err(ValidationError::EmptyLines);
    }

    for (index, line) in input.lines.iter().enumerate() {
        let line_id = line
            .line_id
            .clone()
            .unwrap_or_else(|| format!("L{}", index + 1));

        if line.net.is_none() && line.gross.is_none() {
            return Err(ValidationError::MissingAmount { line_id });
        }

        if line.quantity.is_sign_negative() && !line.quantity.is_zero() {
            return Err(ValidationError::NegativeQuantity {
                line_id,
                quantity: line.quantity,
            });
        }
    }

    Ok(())
}

/// Validates per-call options.
///
/// ## Rules
/// - `precision` is between 0 and [`MAX_PRECISION`]
pub fn validate_options(options: &Options) -> ValidationResult<()> {
    validate_precision(options.precision)
}

pub fn validate_precision(precision: u32) -> ValidationResult<()> {
    if precision > MAX_PRECISION {
        return Err(ValidationError::PrecisionOutOfRange {
            precision,
            max: MAX_PRECISION,
        });
    }
    Ok(())
}

// =============================================================================
// Policy Validators
// =============================================================================

/// Validates a candidate policy.
///
/// ## Rules
/// - `policy_key` and `channel_key` must not be blank
/// - `effective_to` is not before `effective_from`
/// - Component ids must not be blank
/// - Tier components have at least one bracket
/// - Cap `min` is not above `max` (a policy error, fatal in every mode)
pub fn validate_policy(policy: &Policy) -> CoreResult<()> {
    if policy.policy_key.trim().is_empty() {
        return Err(required("policy_key"));
    }
    if policy.channel_key.trim().is_empty() {
        return Err(required("channel_key"));
    }

    if let Some(to) = policy.effective_to {
        if to < policy.effective_from {
            return Err(ValidationError::InvalidFormat {
                field: format!("{}.effective_to", policy.policy_key),
                reason: format!("{} is before effective_from {}", to, policy.effective_from),
            }
            .into());
        }
    }

    for (index, component) in policy.components.iter().enumerate() {
        if component.id.trim().is_empty() {
            return Err(required(&format!("components[{}].id", index)));
        }
        match &component.kind {
            ComponentKind::Tier { brackets, .. } if brackets.is_empty() => {
                return Err(ValidationError::InvalidFormat {
                    field: format!("{}.brackets", component.id),
                    reason: "at least one bracket is required".to_string(),
                }
                .into());
            }
            ComponentKind::Cap {
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => {
                return Err(CoreError::CapInvalidBounds {
                    component_id: component.id.clone(),
                    min: *min,
                    max: *max,
                });
            }
            _ => {}
        }
    }

    Ok(())
}

/// Validates a payroll input.
///
/// ## Rules
/// - Formula `code` and `target` must not be blank
/// - `net_concept` must not be blank
pub fn validate_payroll(input: &PayrollInput) -> ValidationResult<()> {
    if input.net_concept.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "net_concept".to_string(),
        });
    }
    for (index, formula) in input.formulas.iter().enumerate() {
        if formula.code.trim().is_empty() {
            return Err(ValidationError::Required {
                field: format!("formulas[{}].code", index),
            });
        }
        if formula.target.trim().is_empty() {
            return Err(ValidationError::Required {
                field: format!("{}.target", formula.code),
            });
        }
    }
    Ok(())
}

fn required(field: &str) -> CoreError {
    ValidationError::Required {
        field: field.to_string(),
    }
    .into()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn input(value: Value) -> CalculationInput {
        serde_json::from_value(value).unwrap()
    }

    fn policy(value: Value) -> Policy {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_validate_input() {
        assert!(validate_input(&input(json!({"currency": "EUR", "lines": [{"gross": 5}]}))).is_ok());

        let err = validate_input(&input(json!({"lines": [{"net": 5}]}))).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_CURRENCY");

        let err = validate_input(&input(json!({"currency": "EUR", "lines": []}))).unwrap_err();
        assert_eq!(err.error_code(), "EMPTY_LINES");

        let err = validate_input(&input(json!({
            "currency": "EUR", "lines": [{"net": 1}, {"quantity": 2}]
        })))
        .unwrap_err();
        assert_eq!(err.error_code(), "MISSING_AMOUNT");
        assert!(err.to_string().contains("L2"));

        let err = validate_input(&input(json!({
            "currency": "EUR", "lines": [{"line_id": "X", "net": 1, "quantity": -2}]
        })))
        .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_QUANTITY");
    }

    #[test]
    fn test_validate_precision() {
        assert!(validate_precision(0).is_ok());
        assert!(validate_precision(10).is_ok());
        assert_eq!(validate_precision(11).unwrap_err().error_code(), "INVALID_PRECISION");
    }

    #[test]
    fn test_validate_policy() {
        let valid = policy(json!({
            "policy_key": "p", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01",
            "components": [{"id": "fee", "type": "rate", "rate": 1}]
        }));
        assert!(validate_policy(&valid).is_ok());

        let mut bad = valid.clone();
        bad.channel_key = " ".to_string();
        assert_eq!(validate_policy(&bad).unwrap_err().error_code(), "VALIDATION_ERROR");

        let window = policy(json!({
            "policy_key": "p", "channel_key": "web", "version": 1,
            "effective_from": "2024-06-01", "effective_to": "2024-01-01"
        }));
        assert_eq!(validate_policy(&window).unwrap_err().error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_validate_policy_components() {
        let cap = policy(json!({
            "policy_key": "p", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01",
            "components": [{"id": "cap", "type": "cap", "min": 5, "max": 1,
                            "conditions": [{"var": "never", "op": "exists"}]}]
        }));
        let err = validate_policy(&cap).unwrap_err();
        assert_eq!(err.error_code(), "CAP_INVALID_BOUNDS");

        let tier = policy(json!({
            "policy_key": "p", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01",
            "components": [{"id": "t", "type": "tier", "brackets": []}]
        }));
        assert_eq!(validate_policy(&tier).unwrap_err().error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_validate_payroll() {
        let ok: PayrollInput = serde_json::from_value(json!({
            "formulas": [{"code": "a", "target": "A", "expression": {"op": "literal", "value": 1}}]
        }))
        .unwrap();
        assert!(validate_payroll(&ok).is_ok());

        let blank: PayrollInput = serde_json::from_value(json!({
            "formulas": [{"code": "a", "target": "", "expression": {"op": "literal", "value": 1}}]
        }))
        .unwrap();
        assert!(validate_payroll(&blank).is_err());
    }
}
