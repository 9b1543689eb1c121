//! # Canonicalizer & Signatures
//!
//! Deterministic hashes of policies, formula sets and calculation results.
//!
//! ## Hashes
//! ```text
//! v1  = sha256(key-sorted JSON of the policy as authored)
//! v2  = sha256(key-sorted JSON of the canonical policy)
//!         components sorted by (id, type)
//!         tags, predicates, brackets, cap targets, override excludes sorted
//!         base expression arguments kept in order (sub/div are not commutative)
//!
//! signature      = sha256({v2, policy_key, version, channel_key, currency,
//!                          mode, as_of, lines_hash, order, context_hash,
//!                          precision, strict, strategy})
//! calculation_id = uuid v5(signature)
//!
//! payroll        = sha256({formulas_hash, groups, inputs, context_hash,
//!                          net_concept, as_of, precision, strict})
//! ```
//!
//! Reordering components leaves v2 unchanged and changes v1.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::amount::{AmountLine, OrderAggregate};
use crate::condition::{Predicate, RuleNode, RuleSet, Rules};
use crate::error::CoreResult;
use crate::formula::{ConceptGroup, Formula, PayrollInput};
use crate::policy::{Component, ComponentKind, LineSelector, Policy};
use crate::types::{AllocationStrategy, CalculationMode};

/// Both hash versions of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyHashes {
    pub v1: String,
    pub v2: String,
}

// =============================================================================
// JSON Canonicalization
// =============================================================================

/// Recursively sorts object keys.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Compact, key-sorted JSON text of any serializable value.
pub fn canonical_json<T: Serialize>(value: &T) -> CoreResult<String> {
    let raw = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_keys(&raw))?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical JSON of `value`.
pub fn hash_value<T: Serialize>(value: &T) -> CoreResult<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

// =============================================================================
// Policy Hashes
// =============================================================================

/// Legacy hash: the policy in declared order.
pub fn policy_hash_v1(policy: &Policy) -> CoreResult<String> {
    hash_value(policy)
}

/// Order-insensitive hash of the canonical policy.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use tally_core::canonical::{policy_hash_v1, policy_hash_v2};
/// use tally_core::policy::Policy;
///
/// let a: Policy = serde_json::from_value(json!({
///     "policy_key": "p", "channel_key": "web", "version": 1, "effective_from": "2024-01-01",
///     "components": [
///         {"id": "a", "type": "fixed_order", "amount": 1},
///         {"id": "b", "type": "rate", "rate": 2}
///     ]
/// })).unwrap();
/// let mut b = a.clone();
/// b.components.reverse();
///
/// assert_eq!(policy_hash_v2(&a).unwrap(), policy_hash_v2(&b).unwrap());
/// assert_ne!(policy_hash_v1(&a).unwrap(), policy_hash_v1(&b).unwrap());
/// ```
pub fn policy_hash_v2(policy: &Policy) -> CoreResult<String> {
    hash_value(&canonical_policy(policy)?)
}

pub fn policy_hashes(policy: &Policy) -> CoreResult<PolicyHashes> {
    Ok(PolicyHashes {
        v1: policy_hash_v1(policy)?,
        v2: policy_hash_v2(policy)?,
    })
}

/// Deep-sorted copy of `policy`.
pub fn canonical_policy(policy: &Policy) -> CoreResult<Policy> {
    let mut canonical = policy.clone();
    canonical.conditions = canonical.conditions.map(canonical_rules).transpose()?;
    for component in &mut canonical.components {
        canonicalize_component(component)?;
    }
    canonical
        .components
        .sort_by(|a, b| (a.id.as_str(), a.component_type()).cmp(&(b.id.as_str(), b.component_type())));
    Ok(canonical)
}

fn canonicalize_component(component: &mut Component) -> CoreResult<()> {
    component.tags.sort();
    component.conditions = component.conditions.take().map(canonical_rules).transpose()?;
    if let Some(selector) = component.line_selector.take() {
        component.line_selector = Some(canonical_selector(selector)?);
    }
    match &mut component.kind {
        ComponentKind::Tier { brackets, .. } => brackets.sort_by(|a, b| a.from.cmp(&b.from)),
        ComponentKind::Cap { targets, .. } => {
            targets.ids.sort();
            targets.tags.sort();
            targets.types.sort();
            targets.scopes.sort();
        }
        ComponentKind::Override { exclude } => exclude.sort(),
        _ => {}
    }
    Ok(())
}

fn canonical_rules(rules: Rules) -> CoreResult<Rules> {
    Ok(match rules {
        Rules::List(nodes) => Rules::List(canonical_nodes(nodes)?),
        Rules::Set(set) => Rules::Set(canonical_set(set)?),
    })
}

fn canonical_set(set: RuleSet) -> CoreResult<RuleSet> {
    Ok(RuleSet {
        predicates: canonical_nodes(set.predicates)?,
        ..set
    })
}

fn canonical_nodes(nodes: Vec<RuleNode>) -> CoreResult<Vec<RuleNode>> {
    let nodes = nodes
        .into_iter()
        .map(|node| match node {
            RuleNode::Group(set) => canonical_set(set).map(RuleNode::Group),
            leaf => Ok(leaf),
        })
        .collect::<CoreResult<Vec<_>>>()?;
    sort_by_text(nodes)
}

fn canonical_selector(selector: LineSelector) -> CoreResult<LineSelector> {
    let groups = selector
        .any_of
        .into_iter()
        .map(sort_by_text::<Predicate>)
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(LineSelector {
        all_of: sort_by_text(selector.all_of)?,
        any_of: sort_by_text(groups)?,
        ..selector
    })
}

/// Sorts items by their canonical JSON text.
fn sort_by_text<T: Serialize>(items: Vec<T>) -> CoreResult<Vec<T>> {
    let mut keyed = items
        .into_iter()
        .map(|item| Ok((canonical_json(&item)?, item)))
        .collect::<CoreResult<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

// =============================================================================
// Result Signatures
// =============================================================================

/// Hash of the normalized lines, in input order.
pub fn lines_hash(lines: &[AmountLine]) -> CoreResult<String> {
    hash_value(&lines)
}

/// Hash of a condition context, keys sorted at every level.
pub fn context_hash(context: &Map<String, Value>) -> CoreResult<String> {
    hash_value(context)
}

/// Everything a calculation result is a function of.
#[derive(Debug, Clone, Serialize)]
pub struct SignatureInput<'a> {
    pub policy_hash_v2: &'a str,
    pub policy_key: &'a str,
    pub version: u32,
    pub channel_key: &'a str,
    pub currency: &'a str,
    pub mode: CalculationMode,
    pub as_of: Option<NaiveDate>,
    pub lines_hash: &'a str,
    /// Order totals after explicit overrides.
    pub order: &'a OrderAggregate,
    pub context_hash: &'a str,
    pub precision: u32,
    pub strict: bool,
    pub strategy: AllocationStrategy,
}

pub fn calculation_signature(input: &SignatureInput<'_>) -> CoreResult<String> {
    hash_value(input)
}

/// Deterministic id: UUID v5 of the signature.
pub fn calculation_id(signature: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, signature.as_bytes())
}

/// Signature of a payroll run.
pub fn payroll_signature(input: &PayrollInput, precision: u32, strict: bool) -> CoreResult<String> {
    let mut formulas: Vec<&Formula> = input.formulas.iter().collect();
    formulas.sort_by(|a, b| a.code.cmp(&b.code));
    let mut groups: Vec<&ConceptGroup> = input.groups.iter().collect();
    groups.sort_by(|a, b| a.code.cmp(&b.code));

    let formulas_hash = hash_value(&formulas)?;
    hash_value(&json!({
        "formulas_hash": formulas_hash,
        "groups": groups,
        "inputs": input.concepts,
        "context_hash": context_hash(&input.context)?,
        "net_concept": input.net_concept,
        "as_of": input.as_of,
        "precision": precision,
        "strict": strict,
    }))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn policy(value: Value) -> Policy {
        serde_json::from_value(value).unwrap()
    }

    fn base_policy() -> Value {
        json!({
            "policy_key": "marketplace",
            "channel_key": "web",
            "version": 3,
            "effective_from": "2024-01-01",
            "conditions": [
                {"var": "region", "op": "eq", "val": "eu"},
                {"var": "amount", "op": "gt", "val": 0}
            ],
            "components": [
                {"id": "fee", "type": "rate", "rate": "2.5", "tags": ["b", "a"]},
                {"id": "tier", "type": "tier", "mode": "flat", "brackets": [
                    {"from": 100, "rate": 1}, {"from": 0, "rate": 2}
                ]},
                {"id": "cap", "type": "cap", "max": 10, "targets": {"ids": ["tier", "fee"]}},
                {"id": "off", "type": "override", "exclude": ["z", "y"]}
            ]
        })
    }

    #[test]
    fn test_sort_keys_is_recursive() {
        let value = json!({"b": 1, "a": {"d": [ {"z": 1, "y": 2} ], "c": 3}});
        let text = serde_json::to_string(&sort_keys(&value)).unwrap();
        assert_eq!(text, r#"{"a":{"c":3,"d":[{"y":2,"z":1}]},"b":1}"#);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_reordered_components_keep_v2() {
        let a = policy(base_policy());
        let mut b = a.clone();
        b.components.reverse();

        let ha = policy_hashes(&a).unwrap();
        let hb = policy_hashes(&b).unwrap();
        assert_eq!(ha.v2, hb.v2);
        assert_ne!(ha.v1, hb.v1);
        assert_eq!(ha.v1.len(), 64);
    }

    #[test]
    fn test_nested_lists_are_sorted() {
        let canonical = canonical_policy(&policy(base_policy())).unwrap();
        let ids: Vec<_> = canonical.components.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cap", "fee", "off", "tier"]);

        let fee = &canonical.components[1];
        assert_eq!(fee.tags, vec!["a".to_string(), "b".to_string()]);

        match &canonical.components[3].kind {
            ComponentKind::Tier { brackets, .. } => assert_eq!(brackets[0].from, Decimal::ZERO),
            other => panic!("unexpected kind {:?}", other),
        }
        match &canonical.components[0].kind {
            ComponentKind::Cap { targets, .. } => {
                assert_eq!(targets.ids, vec!["fee".to_string(), "tier".to_string()])
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_predicate_order_does_not_change_v2() {
        let a = policy(base_policy());
        let mut swapped = base_policy();
        swapped["conditions"] = json!([
            {"var": "amount", "op": "gt", "val": 0},
            {"var": "region", "op": "eq", "val": "eu"}
        ]);
        let b = policy(swapped);
        assert_eq!(policy_hash_v2(&a).unwrap(), policy_hash_v2(&b).unwrap());
    }

    #[test]
    fn test_base_argument_order_matters() {
        let mut a = base_policy();
        a["components"][0]["base"] = json!({"op": "sub", "args": ["gross", "tax"]});
        let mut b = base_policy();
        b["components"][0]["base"] = json!({"op": "sub", "args": ["tax", "gross"]});
        assert_ne!(
            policy_hash_v2(&policy(a)).unwrap(),
            policy_hash_v2(&policy(b)).unwrap()
        );
    }

    #[test]
    fn test_calculation_id_is_deterministic() {
        let id = calculation_id("abc");
        assert_eq!(id, calculation_id("abc"));
        assert_ne!(id, calculation_id("abd"));
        assert_eq!(id.get_version_num(), 5);
    }

    #[test]
    fn test_context_hash_ignores_key_order() {
        let a: Map<String, Value> = serde_json::from_value(json!({"a": 1, "b": {"y": 2, "x": 1}})).unwrap();
        let b: Map<String, Value> = serde_json::from_value(json!({"b": {"x": 1, "y": 2}, "a": 1})).unwrap();
        assert_eq!(context_hash(&a).unwrap(), context_hash(&b).unwrap());

        let c: Map<String, Value> = serde_json::from_value(json!({"a": 2, "b": {"x": 1, "y": 2}})).unwrap();
        assert_ne!(context_hash(&a).unwrap(), context_hash(&c).unwrap());
    }

    #[test]
    fn test_payroll_signature_covers_run_inputs() {
        let base: PayrollInput = serde_json::from_value(json!({
            "context": {"employee": {"hours": 160}},
            "concepts": {"BASE": "3000"},
            "formulas": [
                {"code": "b", "target": "NET_PAY", "expression": {"op": "input", "path": "employee.hours"}},
                {"code": "a", "target": "GROSS", "expression": {"op": "concept", "code": "BASE"}}
            ]
        }))
        .unwrap();
        let signature = payroll_signature(&base, 2, false).unwrap();

        let mut reordered = base.clone();
        reordered.formulas.reverse();
        assert_eq!(payroll_signature(&reordered, 2, false).unwrap(), signature);

        let mut context = base.clone();
        context.context.insert("employee".to_string(), json!({"hours": 170}));
        assert_ne!(payroll_signature(&context, 2, false).unwrap(), signature);

        let mut net = base.clone();
        net.net_concept = "GROSS".to_string();
        assert_ne!(payroll_signature(&net, 2, false).unwrap(), signature);

        let mut dated = base.clone();
        dated.as_of = Some("2024-06-30".parse().unwrap());
        assert_ne!(payroll_signature(&dated, 2, false).unwrap(), signature);

        assert_ne!(payroll_signature(&base, 2, true).unwrap(), signature);
    }
}
