//! # Condition Matcher
//!
//! Generic predicate evaluation over nested JSON maps.
//!
//! ## Accepted Shapes
//! ```text
//! Flat list (implicit AND):
//!   [ {"var": "customer.tier", "op": "eq", "val": "gold"},
//!     {"var": "order.net", "op": "gte", "val": 100} ]
//!
//! Structured:
//!   { "mode": "exclude", "logic": "OR",
//!     "predicates": [ {"var": "flags", "op": "contains", "val": "staff"},
//!                     {"logic": "AND", "predicates": [ ... ]} ] }
//! ```
//!
//! ## Field Resolution
//! Paths are dot-separated and case-insensitive (an exact key wins first).
//! A missing field resolves to `null` instead of failing; only `exists` and
//! `not_exists` can tell "missing" apart from "present but null".
//!
//! ## Numeric Operators
//! `gt`, `gte`, `lt`, `lte` and `between` push both operands through
//! [`decimal::normalize`]. A non-numeric operand becomes zero, which gives a
//! deterministic mismatch instead of a crash.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decimal;

// =============================================================================
// Rule Types
// =============================================================================

/// Whether a rule set keeps or inverts its logic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectMode {
    /// Return the logic result as-is.
    #[default]
    Include,
    /// Return the negated logic result.
    Exclude,
}

/// How the predicates of one group combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "all")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "any")]
    Or,
}

/// Comparison operator of a single predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=", alias = "ne")]
    Neq,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    NotIn,
    Contains,
    Between,
    Regex,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    Exists,
    NotExists,
}

/// `{var, op, val}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Dot path into the context.
    pub var: String,
    pub op: Operator,
    /// Comparison value. Unused by the null/existence operators.
    #[serde(default)]
    pub val: Value,
}

impl Predicate {
    pub fn new(var: impl Into<String>, op: Operator, val: Value) -> Self {
        Predicate {
            var: var.into(),
            op,
            val,
        }
    }
}

/// A structured group of predicates or nested groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub mode: SelectMode,
    #[serde(default)]
    pub logic: Logic,
    pub predicates: Vec<RuleNode>,
}

/// One entry of a rule list: a leaf predicate or a nested group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Predicate(Predicate),
    Group(RuleSet),
}

/// Either accepted rule form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rules {
    /// Flat list, implicit AND.
    List(Vec<RuleNode>),
    /// `{mode, logic, predicates}`.
    Set(RuleSet),
}

// =============================================================================
// Outcome Types
// =============================================================================

/// Explain entry for one evaluated predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredicateExplain {
    pub var: String,
    pub op: Operator,
    pub expected: Value,
    pub actual: Value,
    pub result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Result of [`matches`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub matched: bool,
    pub explain: Vec<PredicateExplain>,
}

// =============================================================================
// Public API
// =============================================================================

/// Evaluates `rules` against `context`.
///
/// ## Example
/// ```rust
/// use serde_json::json;
/// use tally_core::condition::{matches, Rules};
///
/// let rules: Rules = serde_json::from_value(json!([
///     {"var": "Customer.Tier", "op": "eq", "val": "gold"}
/// ])).unwrap();
/// let ctx = json!({"customer": {"tier": "gold"}});
/// assert!(matches(&ctx, &rules).matched);
/// ```
pub fn matches(context: &Value, rules: &Rules) -> MatchOutcome {
    let mut explain = Vec::new();
    let matched = match rules {
        Rules::List(nodes) => eval_nodes(context, nodes, Logic::And, &mut explain),
        Rules::Set(set) => eval_set(context, set, &mut explain),
    };
    MatchOutcome { matched, explain }
}

/// Like [`matches`], treating absent rules as a match.
pub fn matches_opt(context: &Value, rules: Option<&Rules>) -> MatchOutcome {
    match rules {
        Some(rules) => matches(context, rules),
        None => MatchOutcome {
            matched: true,
            explain: Vec::new(),
        },
    }
}

/// Evaluates a plain predicate list with the given logic.
pub fn eval_predicates(
    context: &Value,
    predicates: &[Predicate],
    logic: Logic,
    explain: &mut Vec<PredicateExplain>,
) -> bool {
    // Every predicate is evaluated so the explain list stays complete.
    let results: Vec<bool> = predicates
        .iter()
        .map(|p| {
            let entry = evaluate_predicate(context, p);
            let result = entry.result;
            explain.push(entry);
            result
        })
        .collect();
    combine(&results, logic)
}

/// Case-insensitive dot-path lookup.
///
/// Returns `None` when any segment is missing.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).or_else(|| {
                map.iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(segment))
                    .map(|(_, value)| value)
            })?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluates a single predicate.
pub fn evaluate_predicate(context: &Value, predicate: &Predicate) -> PredicateExplain {
    let found = lookup(context, &predicate.var);
    let actual = found.cloned().unwrap_or(Value::Null);
    let expected = &predicate.val;
    let mut note = None;

    let result = match predicate.op {
        Operator::Exists => found.is_some(),
        Operator::NotExists => found.is_none(),
        Operator::IsNull => actual.is_null(),
        Operator::IsNotNull => !actual.is_null(),
        Operator::Eq => values_equal(&actual, expected),
        Operator::Neq => !values_equal(&actual, expected),
        Operator::Gt => decimal::normalize(&actual) > decimal::normalize(expected),
        Operator::Gte => decimal::normalize(&actual) >= decimal::normalize(expected),
        Operator::Lt => decimal::normalize(&actual) < decimal::normalize(expected),
        Operator::Lte => decimal::normalize(&actual) <= decimal::normalize(expected),
        Operator::In => member_of(&actual, expected),
        Operator::NotIn => !member_of(&actual, expected),
        Operator::Between => match expected {
            Value::Array(bounds) if bounds.len() == 2 => {
                let value = decimal::normalize(&actual);
                value >= decimal::normalize(&bounds[0]) && value <= decimal::normalize(&bounds[1])
            }
            _ => {
                note = Some("invalid_between".to_string());
                false
            }
        },
        Operator::Contains => match &actual {
            Value::String(haystack) => text_of(expected)
                .map(|needle| haystack.contains(needle.as_str()))
                .unwrap_or(false),
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            _ => false,
        },
        Operator::StartsWith => match (text_of(&actual), text_of(expected)) {
            (Some(a), Some(e)) => a.starts_with(e.as_str()),
            _ => false,
        },
        Operator::EndsWith => match (text_of(&actual), text_of(expected)) {
            (Some(a), Some(e)) => a.ends_with(e.as_str()),
            _ => false,
        },
        Operator::Regex => match text_of(expected).map(|p| Regex::new(&p)) {
            Some(Ok(re)) => text_of(&actual).map(|t| re.is_match(&t)).unwrap_or(false),
            _ => {
                note = Some("invalid_regex".to_string());
                false
            }
        },
    };

    PredicateExplain {
        var: predicate.var.clone(),
        op: predicate.op,
        expected: expected.clone(),
        actual,
        result,
        note,
    }
}

// =============================================================================
// Internals
// =============================================================================

fn eval_set(context: &Value, set: &RuleSet, explain: &mut Vec<PredicateExplain>) -> bool {
    let result = eval_nodes(context, &set.predicates, set.logic, explain);
    match set.mode {
        SelectMode::Include => result,
        SelectMode::Exclude => !result,
    }
}

fn eval_nodes(
    context: &Value,
    nodes: &[RuleNode],
    logic: Logic,
    explain: &mut Vec<PredicateExplain>,
) -> bool {
    let results: Vec<bool> = nodes
        .iter()
        .map(|node| match node {
            RuleNode::Predicate(p) => {
                let entry = evaluate_predicate(context, p);
                let result = entry.result;
                explain.push(entry);
                result
            }
            RuleNode::Group(set) => eval_set(context, set, explain),
        })
        .collect();
    combine(&results, logic)
}

fn combine(results: &[bool], logic: Logic) -> bool {
    match logic {
        Logic::And => results.iter().all(|r| *r),
        Logic::Or => results.iter().any(|r| *r),
    }
}

/// Numeric equality when both sides are numeric, JSON equality otherwise.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (decimal::to_decimal(a), decimal::to_decimal(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn member_of(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items.iter().any(|item| values_equal(actual, item)),
        other => values_equal(actual, other),
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
