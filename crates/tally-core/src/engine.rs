//! # Engine
//!
//! Public entry points. Each call is a pure function of its arguments.
//!
//! ## Calculation Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CalculationInput + [Policy] + Options                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  validation ──► amount::build ──► resolver::select_policy               │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                             resolver::resolve_components                │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                           evaluator::evaluate_components                │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                               allocation::allocate                      │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                        canonical signature ──► CalculationResult        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::allocation;
use crate::amount::{self, AmountModel};
use crate::canonical::{self, SignatureInput};
use crate::error::CoreResult;
use crate::evaluator::{self, EvalSettings};
use crate::formula::{self, PayrollInput, PayrollResult};
use crate::policy::Policy;
use crate::resolver;
use crate::trace::Trace;
use crate::types::{
    CalculationInput, CalculationResponse, CalculationResult, Options, PolicyRef, Response,
};
use crate::validation;

/// Envelope of [`run_payroll`].
pub type PayrollResponse = Response<PayrollResult>;

// =============================================================================
// Calculation
// =============================================================================

/// Calculates fees for `input` under the best matching policy of `policies`.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use tally_core::engine::calculate;
/// use tally_core::policy::Policy;
/// use tally_core::types::{CalculationInput, Options};
///
/// let input: CalculationInput = serde_json::from_value(json!({
///     "channel_key": "web",
///     "currency": "EUR",
///     "as_of": "2024-05-01",
///     "lines": [{"net": "80.00"}]
/// })).unwrap();
/// let policy: Policy = serde_json::from_value(json!({
///     "policy_key": "marketplace", "channel_key": "web", "version": 1,
///     "effective_from": "2024-01-01",
///     "components": [{"id": "commission", "type": "rate", "rate": 10}]
/// })).unwrap();
///
/// let result = calculate(&input, &[policy], &Options::default()).unwrap();
/// assert_eq!(result.total.to_string(), "8.00");
/// ```
pub fn calculate(
    input: &CalculationInput,
    policies: &[Policy],
    options: &Options,
) -> CoreResult<CalculationResult> {
    validation::validate_options(options)?;
    validation::validate_input(input)?;

    let precision = options.precision;
    let model = amount::build(&input.lines, input.order.as_ref(), precision)?;
    let context = condition_context(input, &model)?;

    let mut trace = Trace::new();
    let policy = resolver::select_policy(
        policies,
        input.channel_key.as_deref(),
        input.as_of,
        &context,
        &mut trace,
    )?;
    validation::validate_policy(policy)?;

    let strict = options.effective_strict(policy);
    if let Some(currency) = &policy.currency {
        if !currency.eq_ignore_ascii_case(&input.currency) {
            trace.warn(
                "CURRENCY_MISMATCH",
                format!(
                    "policy currency {} differs from input currency {}",
                    currency, input.currency
                ),
            );
        }
    }

    let resolved = resolver::resolve_components(policy, &context, &mut trace)?;
    let settings = EvalSettings { precision, strict };
    let breakdown = evaluator::evaluate_components(&resolved, &model, settings, &mut trace)?;
    let (allocation, reconciliation) = allocation::allocate(
        &breakdown,
        &model,
        options.allocation_strategy,
        precision,
        &mut trace,
    )?;

    let policy_hash = canonical::policy_hashes(policy)?;
    let lines_hash = canonical::lines_hash(&model.lines)?;
    let context_hash = canonical::context_hash(&input.context)?;
    let signature = canonical::calculation_signature(&SignatureInput {
        policy_hash_v2: &policy_hash.v2,
        policy_key: &policy.policy_key,
        version: policy.version,
        channel_key: &policy.channel_key,
        currency: &input.currency,
        mode: input.mode,
        as_of: input.as_of,
        lines_hash: &lines_hash,
        order: &model.order,
        context_hash: &context_hash,
        precision,
        strict,
        strategy: options.allocation_strategy,
    })?;
    let calculation_id = canonical::calculation_id(&signature);
    trace.step(
        "signed",
        json!({
            "policy_hash_v2": policy_hash.v2,
            "lines_hash": lines_hash,
            "context_hash": context_hash,
            "signature": signature,
        }),
    );

    let (explain_plan, warnings, discarded) = trace.finish();
    info!(
        policy_key = %policy.policy_key,
        version = policy.version,
        total = %reconciliation.total,
        components = breakdown.len(),
        warnings = warnings.len(),
        %calculation_id,
        "Calculation completed"
    );

    Ok(CalculationResult {
        calculation_id,
        total: reconciliation.total,
        currency: input.currency.clone(),
        mode: input.mode,
        precision,
        strict,
        policy: PolicyRef {
            policy_key: policy.policy_key.clone(),
            version: policy.version,
            channel_key: policy.channel_key.clone(),
        },
        breakdown,
        discarded,
        allocation,
        explain_plan,
        reconciliation,
        warnings,
        policy_hash,
        signature,
    })
}

/// [`calculate`], wrapped in the success/failure envelope.
pub fn calculate_response(
    input: &CalculationInput,
    policies: &[Policy],
    options: &Options,
) -> CalculationResponse {
    let result = calculate(input, policies, options);
    if let Err(err) = &result {
        warn!(error_code = err.error_code(), error = %err, "Calculation failed");
    }
    Response::from_result(result)
}

/// Context seen by policy and component conditions.
///
/// Caller context wins; `order`, `channel_key`, `currency`, `as_of` and
/// `mode` are added only when the caller did not set them.
fn condition_context(input: &CalculationInput, model: &AmountModel) -> CoreResult<Value> {
    let mut context: Map<String, Value> = input.context.clone();
    let mut defaults = vec![
        ("order", serde_json::to_value(&model.order)?),
        ("currency", Value::String(input.currency.clone())),
        ("mode", serde_json::to_value(input.mode)?),
    ];
    if let Some(channel_key) = &input.channel_key {
        defaults.push(("channel_key", Value::String(channel_key.clone())));
    }
    if let Some(as_of) = input.as_of {
        defaults.push(("as_of", Value::String(as_of.to_string())));
    }
    for (key, value) in defaults {
        context.entry(key).or_insert(value);
    }
    Ok(Value::Object(context))
}

// =============================================================================
// Payroll
// =============================================================================

/// Runs a payroll formula set.
///
/// Strictness comes from `options.strict` only; there is no policy here.
pub fn run_payroll(input: &PayrollInput, options: &Options) -> CoreResult<PayrollResult> {
    validation::validate_options(options)?;
    validation::validate_payroll(input)?;

    let strict = options.strict.unwrap_or(false);
    let result = formula::run(input, options.precision, strict)?;
    info!(
        concepts = result.concepts.len(),
        skipped = result.skipped.len(),
        warnings = result.warnings.len(),
        "Payroll run completed"
    );
    Ok(result)
}

/// [`run_payroll`], wrapped in the success/failure envelope.
pub fn payroll_response(input: &PayrollInput, options: &Options) -> PayrollResponse {
    let result = run_payroll(input, options);
    if let Err(err) = &result {
        warn!(error_code = err.error_code(), error = %err, "Payroll run failed");
    }
    Response::from_result(result)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    use crate::types::{AllocationStrategy, OrderInput};

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn input(value: Value) -> CalculationInput {
        serde_json::from_value(value).unwrap()
    }

    fn policy(value: Value) -> Policy {
        serde_json::from_value(value).unwrap()
    }

    fn marketplace() -> Policy {
        policy(json!({
            "policy_key": "marketplace",
            "channel_key": "web",
            "version": 3,
            "effective_from": "2024-01-01",
            "components": [
                {"id": "commission", "type": "rate", "rate": "12.5", "tags": ["commission"]},
                {"id": "handling", "type": "fixed_order", "amount": "0.99"},
                {"id": "per_item", "type": "fixed_unit", "amount": "0.10",
                 "line_selector": {"where": [{"var": "category", "op": "eq", "val": "books"}]}},
                {"id": "min_fee", "type": "cap", "min": "2.00", "targets": {"tags": ["commission"]}}
            ]
        }))
    }

    fn order() -> CalculationInput {
        input(json!({
            "channel_key": "web",
            "currency": "EUR",
            "as_of": "2024-03-15",
            "lines": [
                {"line_id": "A", "net": "10.00", "quantity": 2, "category": "books"},
                {"line_id": "B", "net": "3.33", "quantity": 1, "category": "toys"},
                {"line_id": "C", "gross": "11.90", "tax_rate": 19, "quantity": 1, "category": "books"}
            ]
        }))
    }

    #[test]
    fn test_calculate_end_to_end() {
        let result = calculate(&order(), &[marketplace()], &Options::default()).unwrap();

        // commission: 1.25 + 0.42 + 1.25 = 2.92 (above the 2.00 floor)
        assert_eq!(result.breakdown[0].amount, d("2.92"));
        assert_eq!(result.breakdown[1].amount, d("0.99"));
        // per_item: books only, 2 + 1 units
        assert_eq!(result.breakdown[2].amount, d("0.30"));
        assert_eq!(result.breakdown[3].amount, d("0.00"));
        assert_eq!(result.total, d("4.21"));

        assert_eq!(result.policy.policy_key, "marketplace");
        assert_eq!(result.policy.version, 3);
        assert_eq!(result.allocation.len(), 3);
        let allocated: Decimal = result.allocation.iter().map(|a| a.fee_amount).sum();
        assert_eq!(allocated, result.total);

        let steps: Vec<&str> = result.explain_plan.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(steps.first(), Some(&"policy_selected"));
        assert_eq!(steps.last(), Some(&"signed"));
        assert!(steps.contains(&"reconciled"));
    }

    #[test]
    fn test_calculate_is_deterministic() {
        let first = calculate_response(&order(), &[marketplace()], &Options::default());
        let second = calculate_response(&order(), &[marketplace()], &Options::default());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let result = first.result.unwrap();
        assert_eq!(result.calculation_id, canonical::calculation_id(&result.signature));
    }

    #[test]
    fn test_signature_tracks_inputs() {
        let base = calculate(&order(), &[marketplace()], &Options::default()).unwrap();

        let mut reordered = marketplace();
        reordered.components.reverse();
        let same = calculate(&order(), &[reordered], &Options::default()).unwrap();
        assert_eq!(same.policy_hash.v2, base.policy_hash.v2);
        assert_ne!(same.policy_hash.v1, base.policy_hash.v1);

        let options = Options {
            allocation_strategy: AllocationStrategy::Equal,
            ..Options::default()
        };
        let other = calculate(&order(), &[marketplace()], &options).unwrap();
        assert_ne!(other.signature, base.signature);

        let mut changes: Vec<(&str, CalculationInput)> = Vec::new();

        let mut request = order();
        request.context.insert("customer".to_string(), json!({"tier": "gold"}));
        changes.push(("context", request));

        let mut request = order();
        request.order = Some(OrderInput {
            net: Some(d("500.00")),
            ..OrderInput::default()
        });
        changes.push(("order override", request));

        let mut request = order();
        request.as_of = Some("2024-04-01".parse().unwrap());
        changes.push(("as_of", request));

        let mut request = order();
        request.lines[1].net = Some(d("3.34"));
        changes.push(("line amount", request));

        let mut request = order();
        request.currency = "USD".to_string();
        changes.push(("currency", request));

        for (what, request) in changes {
            let changed = calculate(&request, &[marketplace()], &Options::default()).unwrap();
            assert_ne!(changed.signature, base.signature, "{} must change the signature", what);
            assert_ne!(changed.calculation_id, base.calculation_id, "{} must change the id", what);
        }

    }

    #[test]
    fn test_signature_separates_different_totals() {
        let request = input(json!({
            "channel_key": "web", "currency": "EUR", "as_of": "2024-03-15",
            "lines": [{"net": 100}]
        }));

        let loyalty = policy(json!({
            "policy_key": "loyalty", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01",
            "components": [
                {"id": "gold_fee", "type": "rate", "rate": 10,
                 "conditions": [{"var": "customer.tier", "op": "eq", "val": "gold"}]},
                {"id": "base_fee", "type": "fixed_order", "amount": 1}
            ]
        }));
        let plain = calculate(&request, &[loyalty.clone()], &Options::default()).unwrap();
        let mut gold_request = request.clone();
        gold_request.context.insert("customer".to_string(), json!({"tier": "gold"}));
        let gold = calculate(&gold_request, &[loyalty], &Options::default()).unwrap();
        assert_eq!(plain.total, d("1.00"));
        assert_eq!(gold.total, d("11.00"));
        assert_ne!(plain.signature, gold.signature);
        assert_ne!(plain.calculation_id, gold.calculation_id);

        let order_rate = policy(json!({
            "policy_key": "order_rate", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01",
            "components": [{"id": "fee", "type": "rate", "rate": 1, "scope": "order"}]
        }));
        let from_lines = calculate(&request, &[order_rate.clone()], &Options::default()).unwrap();
        let mut explicit = request.clone();
        explicit.order = Some(OrderInput {
            net: Some(d("5000")),
            ..OrderInput::default()
        });
        let from_order = calculate(&explicit, &[order_rate], &Options::default()).unwrap();
        assert_eq!(from_lines.total, d("1.00"));
        assert_eq!(from_order.total, d("50.00"));
        assert_ne!(from_lines.signature, from_order.signature);
    }

    #[test]
    fn test_overflow_strict_vs_lenient() {
        let request = input(json!({
            "channel_key": "web", "currency": "EUR", "as_of": "2024-03-15",
            "lines": [{"net": "10000000000"}]
        }));
        let huge = policy(json!({
            "policy_key": "huge", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01",
            "components": [
                {"id": "scaled", "type": "rate", "rate": 10, "base": {"op": "mul", "args": [
                    "net", {"op": "literal", "value": "100000000000000000000"}
                ]}},
                {"id": "handling", "type": "fixed_order", "amount": "0.99"}
            ]
        }));

        let response = calculate_response(&request, &[huge.clone()], &Options::strict());
        assert!(!response.success);
        let body = response.error.unwrap();
        assert_eq!(body.error_code, "ARITHMETIC_OVERFLOW");
        assert_eq!(serde_json::to_value(body.error_type).unwrap(), json!("calculation"));

        let result = calculate(&request, &[huge], &Options::lenient()).unwrap();
        assert_eq!(result.breakdown[0].amount, d("0.00"));
        assert_eq!(result.total, d("0.99"));
        assert!(result.warnings.iter().any(|w| w.code == "ARITHMETIC_OVERFLOW"));
    }

    #[test]
    fn test_every_strategy_reconciles() {
        for strategy in [
            AllocationStrategy::ByNet,
            AllocationStrategy::ByGross,
            AllocationStrategy::ByQuantity,
            AllocationStrategy::Equal,
        ] {
            let options = Options {
                allocation_strategy: strategy,
                ..Options::default()
            };
            let result = calculate(&order(), &[marketplace()], &options).unwrap();
            let allocated: Decimal = result.allocation.iter().map(|a| a.fee_amount).sum();
            assert_eq!(allocated, result.total, "strategy {}", strategy);
        }
    }

    #[test]
    fn test_policy_selection_by_channel_and_date() {
        let mut archived = marketplace();
        archived.version = 2;
        archived.effective_from = "2023-01-01".parse().unwrap();
        archived.effective_to = Some("2023-12-31".parse().unwrap());
        let mut retail = marketplace();
        retail.channel_key = "retail".to_string();
        retail.priority = 10;

        let result = calculate(&order(), &[archived, retail, marketplace()], &Options::default()).unwrap();
        assert_eq!(result.policy.version, 3);
        assert_eq!(result.policy.channel_key, "web");
    }

    #[test]
    fn test_missing_channel_key() {
        let mut request = order();
        request.channel_key = None;
        let response = calculate_response(&request, &[marketplace(), marketplace()], &Options::default());
        assert!(!response.success);
        assert_eq!(response.error.unwrap().error_code, "MISSING_CHANNEL_KEY");

        // A single candidate needs no channel key.
        assert!(calculate(&request, &[marketplace()], &Options::default()).is_ok());
    }

    #[test]
    fn test_no_matching_policy() {
        let mut request = order();
        request.as_of = Some("2020-01-01".parse().unwrap());
        let err = calculate(&request, &[marketplace()], &Options::default()).unwrap_err();
        assert_eq!(err.error_code(), "NO_MATCHING_POLICY");
        assert!(err.to_string().contains("2020-01-01"));
    }

    #[test]
    fn test_policy_conditions_see_order_totals() {
        let mut gated = marketplace();
        gated.conditions = Some(
            serde_json::from_value(json!([{"var": "order.net", "op": "gte", "val": 100}])).unwrap(),
        );
        let err = calculate(&order(), &[gated.clone()], &Options::default()).unwrap_err();
        assert_eq!(err.error_code(), "NO_MATCHING_POLICY");

        let mut request = order();
        request.context.insert("order".to_string(), json!({"net": 500}));
        assert!(calculate(&request, &[gated], &Options::default()).is_ok());
    }

    #[test]
    fn test_strict_vs_lenient_missing_field() {
        let mut weighted = marketplace();
        weighted.components = serde_json::from_value(json!([
            {"id": "by_weight", "type": "rate", "rate": 5, "base": "meta.weight"}
        ]))
        .unwrap();

        let lenient = calculate(&order(), &[weighted.clone()], &Options::lenient()).unwrap();
        assert_eq!(lenient.total, d("0.00"));
        assert!(lenient.warnings.iter().any(|w| w.code == "FIELD_MISSING"));

        let response = calculate_response(&order(), &[weighted.clone()], &Options::strict());
        let body = response.error.unwrap();
        assert_eq!(body.error_code, "FIELD_MISSING");
        assert_eq!(serde_json::to_value(body.error_type).unwrap(), json!("strict"));

        // Policy-level strictness applies when options leave it unset.
        weighted.strict = Some(true);
        let err = calculate(&order(), &[weighted], &Options::default()).unwrap_err();
        assert_eq!(err.error_code(), "FIELD_MISSING");
    }

    #[test]
    fn test_structural_errors_are_fatal_in_lenient_mode() {
        let mut request = order();
        request.lines.clear();
        let err = calculate(&request, &[marketplace()], &Options::lenient()).unwrap_err();
        assert_eq!(err.error_code(), "EMPTY_LINES");

        let mut duplicated = marketplace();
        duplicated.components[1].id = "commission".to_string();
        let err = calculate(&order(), &[duplicated], &Options::lenient()).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_COMPONENT_ID");

        let options = Options {
            precision: 11,
            ..Options::lenient()
        };
        let err = calculate(&order(), &[marketplace()], &options).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PRECISION");
    }

    #[test]
    fn test_currency_mismatch_warns() {
        let mut usd = marketplace();
        usd.currency = Some("USD".to_string());
        let result = calculate(&order(), &[usd], &Options::default()).unwrap();
        assert!(result.warnings.iter().any(|w| w.code == "CURRENCY_MISMATCH"));
    }

    #[test]
    fn test_success_envelope_shape() {
        let response = calculate_response(&order(), &[marketplace()], &Options::default());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["total"], json!("4.21"));
        assert_eq!(value["currency"], json!("EUR"));
        assert!(value.get("error_code").is_none());
        assert_eq!(value["policy_hash"]["v2"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_run_payroll() {
        let payroll: PayrollInput = serde_json::from_value(json!({
            "concepts": {"BASE": "3000.00", "BONUS": "250.00"},
            "formulas": [
                {"code": "gross", "target": "GROSS", "kind": "earning",
                 "expression": {"op": "add", "args": [
                     {"op": "concept", "code": "BASE"}, {"op": "concept", "code": "BONUS"}]}},
                {"code": "tax", "target": "TAX", "kind": "deduction",
                 "expression": {"op": "percent", "base": {"op": "concept", "code": "GROSS"}, "rate": {"op": "literal", "value": 20}}},
                {"code": "net", "target": "NET_PAY",
                 "expression": {"op": "sub", "args": [
                     {"op": "concept", "code": "GROSS"}, {"op": "concept", "code": "TAX"}]}}
            ]
        }))
        .unwrap();

        let result = run_payroll(&payroll, &Options::default()).unwrap();
        assert_eq!(result.concepts["GROSS"], d("3250.00"));
        assert_eq!(result.concepts["TAX"], d("650.00"));
        assert_eq!(result.concepts["NET_PAY"], d("2600.00"));
        assert_eq!(result.execution_order, vec!["gross", "tax", "net"]);

        let again = payroll_response(&payroll, &Options::default());
        assert_eq!(again.result.unwrap().signature, result.signature);
    }

    #[test]
    fn test_payroll_cycle_fails_before_evaluation() {
        let payroll: PayrollInput = serde_json::from_value(json!({
            "formulas": [
                {"code": "A", "target": "A", "expression": {"op": "concept", "code": "B"}},
                {"code": "B", "target": "B", "expression": {"op": "concept", "code": "A"}}
            ]
        }))
        .unwrap();
        let response = payroll_response(&payroll, &Options::lenient());
        assert!(!response.success);
        assert_eq!(response.error.unwrap().error_code, "CIRCULAR_DEPENDENCY");
    }
}
