//! # Policy & Component Resolver
//!
//! Picks the governing policy and the set of components that participate.
//!
//! ## Pipeline
//! ```text
//! candidates ──► filter: channel, effective window, policy conditions
//!            ──► rank: priority ▸ latest effective_from ▸ version ▸ first listed
//!            ──► Policy
//!
//! Policy.components
//!   pass 1: matched overrides ──► exclusion set (computed once)
//!   pass 2: declared order   ──► excluded?   discard "override_excluded"
//!                             ──► conditions? discard "condition_failed"
//!                             ──► eligible, stable-sorted by precedence
//! ```

use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::debug;

use crate::amount::AmountModel;
use crate::condition;
use crate::error::{CoreError, CoreResult};
use crate::policy::{Component, ComponentKind, Policy, Scope};
use crate::trace::Trace;

// =============================================================================
// Policy Selection
// =============================================================================

/// Selects the governing policy among `candidates`.
///
/// `context` is what policy-level conditions are evaluated against.
pub fn select_policy<'a>(
    candidates: &'a [Policy],
    channel_key: Option<&str>,
    as_of: Option<NaiveDate>,
    context: &Value,
    trace: &mut Trace,
) -> CoreResult<&'a Policy> {
    let no_match = || CoreError::NoMatchingPolicy {
        channel_key: channel_key.unwrap_or("<none>").to_string(),
        as_of: as_of.map_or_else(|| "<unspecified>".to_string(), |d| d.to_string()),
    };

    if candidates.is_empty() {
        return Err(no_match());
    }
    if channel_key.is_none() && candidates.len() > 1 {
        return Err(CoreError::MissingChannelKey);
    }
    if as_of.is_none() {
        trace.warn(
            "AS_OF_MISSING",
            "as_of not supplied; effective windows were not checked",
        );
    }

    let mut rejected = Vec::new();
    let mut best: Option<&Policy> = None;
    for policy in candidates {
        let reason = if channel_key.is_some_and(|key| key != policy.channel_key) {
            Some("channel_mismatch")
        } else if as_of.is_some_and(|date| !policy.is_effective(date)) {
            Some("not_effective")
        } else if !condition::matches_opt(context, policy.conditions.as_ref()).matched {
            Some("condition_failed")
        } else {
            None
        };

        if let Some(reason) = reason {
            rejected.push(json!({
                "policy_key": policy.policy_key,
                "version": policy.version,
                "reason": reason,
            }));
            continue;
        }

        // Strictly greater replaces, so the first listed wins a full tie.
        best = match best {
            Some(current) if rank(policy) <= rank(current) => Some(current),
            _ => Some(policy),
        };
    }

    let selected = best.ok_or_else(no_match)?;
    debug!(
        policy_key = %selected.policy_key,
        version = selected.version,
        rejected = rejected.len(),
        "Policy selected"
    );
    trace.step(
        "policy_selected",
        json!({
            "policy_key": selected.policy_key,
            "version": selected.version,
            "channel_key": selected.channel_key,
            "candidates": candidates.len(),
            "rejected": rejected,
        }),
    );
    Ok(selected)
}

fn rank(policy: &Policy) -> (i64, NaiveDate, u32) {
    (policy.priority, policy.effective_from, policy.version)
}

// =============================================================================
// Component Resolution
// =============================================================================

/// An eligible component with its resolved scope.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedComponent<'a> {
    /// Position in the policy's declared component list.
    pub index: usize,
    pub component: &'a Component,
    pub scope: Scope,
}

/// Runs both resolution passes and returns eligible components in
/// evaluation order.
pub fn resolve_components<'a>(
    policy: &'a Policy,
    context: &Value,
    trace: &mut Trace,
) -> CoreResult<Vec<ResolvedComponent<'a>>> {
    let mut seen = HashSet::new();
    for component in &policy.components {
        if !seen.insert(component.id.as_str()) {
            return Err(CoreError::DuplicateComponentId(component.id.clone()));
        }
    }

    // Pass 1
    let mut applied_overrides = Vec::new();
    let mut exclusions = BTreeSet::new();
    for component in policy.components.iter().filter(|c| c.is_override()) {
        if !condition::matches_opt(context, component.conditions.as_ref()).matched {
            trace.discard(&component.id, component.component_type(), "condition_failed");
            continue;
        }
        if let ComponentKind::Override { exclude } = &component.kind {
            exclusions.extend(exclude.iter().cloned());
        }
        applied_overrides.push(component.id.clone());
    }
    trace.step(
        "exclusions",
        json!({
            "overrides": applied_overrides,
            "excluded": exclusions,
        }),
    );

    // Pass 2
    let mut eligible = Vec::new();
    for (index, component) in policy.components.iter().enumerate() {
        if component.is_override() {
            continue;
        }
        if exclusions.contains(&component.id) {
            trace.discard(&component.id, component.component_type(), "override_excluded");
            continue;
        }
        if !condition::matches_opt(context, component.conditions.as_ref()).matched {
            trace.discard(&component.id, component.component_type(), "condition_failed");
            continue;
        }
        if component.scope_conflict() {
            trace.warn_component(
                "SCOPE_FORCED",
                &component.id,
                format!(
                    "{} components are always {} scope",
                    component.component_type(),
                    component.effective_scope()
                ),
            );
        }
        eligible.push(ResolvedComponent {
            index,
            component,
            scope: component.effective_scope(),
        });
    }

    eligible.sort_by_key(|rc| (rc.component.precedence, rc.index));

    let discarded = trace.discarded().len();
    trace.step(
        "components_resolved",
        json!({
            "order": eligible.iter().map(|rc| rc.component.id.as_str()).collect::<Vec<_>>(),
            "discarded": discarded,
        }),
    );
    Ok(eligible)
}

// =============================================================================
// Line Selection
// =============================================================================

/// Lines a selector kept and dropped, by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineSelection {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl LineSelection {
    pub fn applies_to(&self, line_id: &str) -> bool {
        self.applied.iter().any(|id| id == line_id)
    }
}

/// Applies the component's line selector, if any.
///
/// Returns `None` when every line applies.
pub fn select_lines(
    resolved: &ResolvedComponent<'_>,
    model: &AmountModel,
    strict: bool,
    trace: &mut Trace,
) -> CoreResult<Option<LineSelection>> {
    let component = resolved.component;
    let Some(selector) = &component.line_selector else {
        return Ok(None);
    };

    if resolved.scope == Scope::Order {
        if strict {
            return Err(CoreError::InvalidLineSelector {
                component_id: component.id.clone(),
            });
        }
        trace.warn_component(
            "LINE_SELECTOR_IGNORED",
            &component.id,
            "line selector ignored on order-scoped component",
        );
        return Ok(None);
    }

    let mut selection = LineSelection::default();
    for line in &model.lines {
        if selector.selects(&line.context()?) {
            selection.applied.push(line.line_id.clone());
        } else {
            selection.skipped.push(line.line_id.clone());
        }
    }

    if selector.require_match && selection.applied.is_empty() {
        if strict {
            return Err(CoreError::LineSelectorNoMatch {
                component_id: component.id.clone(),
            });
        }
        trace.warn_component(
            "LINE_SELECTOR_NO_MATCH",
            &component.id,
            "line selector requires a match but matched no lines",
        );
    }
    Ok(Some(selection))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount;
    use crate::types::LineInput;

    fn policy(value: Value) -> Policy {
        serde_json::from_value(value).unwrap()
    }

    fn simple(key: &str, channel: &str, version: u32, from: &str, priority: i64) -> Policy {
        policy(json!({
            "policy_key": key,
            "channel_key": channel,
            "version": version,
            "effective_from": from,
            "priority": priority,
            "components": []
        }))
    }

    fn date(s: &str) -> Option<NaiveDate> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_select_filters_channel_and_window() {
        let candidates = vec![
            simple("web", "web", 1, "2024-01-01", 0),
            simple("app", "app", 1, "2024-01-01", 0),
            simple("future", "web", 2, "2030-01-01", 0),
        ];
        let mut trace = Trace::new();
        let selected =
            select_policy(&candidates, Some("web"), date("2024-06-01"), &json!({}), &mut trace).unwrap();
        assert_eq!(selected.policy_key, "web");

        let (steps, _, _) = trace.finish();
        let rejected = steps[0].detail["rejected"].as_array().unwrap();
        assert_eq!(rejected[0]["reason"], json!("channel_mismatch"));
        assert_eq!(rejected[1]["reason"], json!("not_effective"));
    }

    #[test]
    fn test_select_tie_breaks() {
        // priority beats recency
        let candidates = vec![
            simple("recent", "web", 1, "2024-05-01", 0),
            simple("priority", "web", 1, "2024-01-01", 5),
        ];
        let mut trace = Trace::new();
        let chosen = select_policy(&candidates, Some("web"), date("2024-06-01"), &json!({}), &mut trace);
        assert_eq!(chosen.unwrap().policy_key, "priority");

        // recency, then version, then the first listed
        let candidates = vec![
            simple("old", "web", 9, "2024-01-01", 0),
            simple("v1", "web", 1, "2024-03-01", 0),
            simple("v2", "web", 2, "2024-03-01", 0),
            simple("v2-dup", "web", 2, "2024-03-01", 0),
        ];
        let chosen = select_policy(&candidates, Some("web"), date("2024-06-01"), &json!({}), &mut trace);
        assert_eq!(chosen.unwrap().policy_key, "v2");
    }

    #[test]
    fn test_select_without_channel_key() {
        let one = vec![simple("only", "web", 1, "2024-01-01", 0)];
        let mut trace = Trace::new();
        let chosen = select_policy(&one, None, date("2024-06-01"), &json!({}), &mut trace);
        assert_eq!(chosen.unwrap().policy_key, "only");

        let two = vec![
            simple("a", "web", 1, "2024-01-01", 0),
            simple("b", "web", 2, "2024-01-01", 0),
        ];
        let err = select_policy(&two, None, date("2024-06-01"), &json!({}), &mut trace).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_CHANNEL_KEY");
    }

    #[test]
    fn test_select_missing_as_of_warns() {
        let one = vec![simple("future", "web", 1, "2030-01-01", 0)];
        let mut trace = Trace::new();
        let chosen = select_policy(&one, Some("web"), None, &json!({}), &mut trace);
        assert!(chosen.is_ok());
        assert!(trace.has_warning("AS_OF_MISSING"));
    }

    #[test]
    fn test_select_no_match() {
        let one = vec![simple("a", "web", 1, "2024-01-01", 0)];
        let mut trace = Trace::new();
        let err = select_policy(&one, Some("app"), date("2024-06-01"), &json!({}), &mut trace).unwrap_err();
        assert_eq!(err.error_code(), "NO_MATCHING_POLICY");

        let err = select_policy(&[], Some("app"), None, &json!({}), &mut trace).unwrap_err();
        assert_eq!(err.error_code(), "NO_MATCHING_POLICY");
    }

    #[test]
    fn test_policy_conditions_filter() {
        let gated = policy(json!({
            "policy_key": "vip", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01", "priority": 10,
            "conditions": [{"var": "customer.tier", "op": "eq", "val": "gold"}],
            "components": []
        }));
        let candidates = vec![gated, simple("base", "web", 1, "2024-01-01", 0)];
        let mut trace = Trace::new();
        let chosen = select_policy(
            &candidates,
            Some("web"),
            date("2024-06-01"),
            &json!({"customer": {"tier": "silver"}}),
            &mut trace,
        );
        assert_eq!(chosen.unwrap().policy_key, "base");
    }

    fn policy_with(components: Value) -> Policy {
        policy(json!({
            "policy_key": "p", "channel_key": "web", "version": 1,
            "effective_from": "2024-01-01", "components": components
        }))
    }

    #[test]
    fn test_resolve_overrides_and_conditions() {
        let policy = policy_with(json!([
            {"id": "base", "type": "rate", "rate": 10},
            {"id": "promo", "type": "fixed_order", "amount": 5,
             "conditions": [{"var": "promo", "op": "eq", "val": true}]},
            {"id": "shipping", "type": "fixed_order", "amount": 3},
            {"id": "free_ship", "type": "override", "exclude": ["shipping"],
             "conditions": [{"var": "order.net", "op": "gte", "val": 100}]}
        ]));
        let ctx = json!({"promo": false, "order": {"net": "150.00"}});
        let mut trace = Trace::new();
        let resolved = resolve_components(&policy, &ctx, &mut trace).unwrap();

        let ids: Vec<_> = resolved.iter().map(|rc| rc.component.id.as_str()).collect();
        assert_eq!(ids, vec!["base"]);
        let reasons: Vec<_> = trace
            .discarded()
            .iter()
            .map(|d| (d.component_id.as_str(), d.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![("promo", "condition_failed"), ("shipping", "override_excluded")]
        );
    }

    #[test]
    fn test_resolve_precedence_is_stable() {
        let policy = policy_with(json!([
            {"id": "c", "type": "fixed_order", "amount": 1, "precedence": 5},
            {"id": "a", "type": "fixed_order", "amount": 1},
            {"id": "b", "type": "fixed_order", "amount": 1},
            {"id": "d", "type": "fixed_order", "amount": 1, "precedence": -1}
        ]));
        let mut trace = Trace::new();
        let resolved = resolve_components(&policy, &json!({}), &mut trace).unwrap();
        let ids: Vec<_> = resolved.iter().map(|rc| rc.component.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_resolve_duplicate_ids() {
        let policy = policy_with(json!([
            {"id": "a", "type": "fixed_order", "amount": 1},
            {"id": "a", "type": "rate", "rate": 1}
        ]));
        let mut trace = Trace::new();
        let err = resolve_components(&policy, &json!({}), &mut trace).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_COMPONENT_ID");
    }

    #[test]
    fn test_resolve_warns_on_forced_scope() {
        let policy = policy_with(json!([
            {"id": "unit", "type": "fixed_unit", "amount": 1, "scope": "order"}
        ]));
        let mut trace = Trace::new();
        let resolved = resolve_components(&policy, &json!({}), &mut trace).unwrap();
        assert_eq!(resolved[0].scope, Scope::Line);
        assert!(trace.has_warning("SCOPE_FORCED"));
    }

    fn model() -> AmountModel {
        let lines: Vec<LineInput> = serde_json::from_value(json!([
            {"line_id": "A", "net": 100, "category": "books"},
            {"line_id": "B", "net": 50, "category": "music"}
        ]))
        .unwrap();
        amount::build(&lines, None, 2).unwrap()
    }

    #[test]
    fn test_select_lines() {
        let policy = policy_with(json!([
            {"id": "books", "type": "rate", "rate": 10,
             "line_selector": {"where": [{"var": "category", "op": "eq", "val": "books"}]}}
        ]));
        let mut trace = Trace::new();
        let resolved = resolve_components(&policy, &json!({}), &mut trace).unwrap();
        let selection = select_lines(&resolved[0], &model(), true, &mut trace)
            .unwrap()
            .unwrap();
        assert_eq!(selection.applied, vec!["A".to_string()]);
        assert_eq!(selection.skipped, vec!["B".to_string()]);
        assert!(selection.applies_to("A"));
    }

    #[test]
    fn test_selector_on_order_scope() {
        let policy = policy_with(json!([
            {"id": "flat", "type": "fixed_order", "amount": 1,
             "line_selector": {"where": [{"var": "category", "op": "eq", "val": "books"}]}}
        ]));
        let mut trace = Trace::new();
        let resolved = resolve_components(&policy, &json!({}), &mut trace).unwrap();

        let lenient = select_lines(&resolved[0], &model(), false, &mut trace).unwrap();
        assert!(lenient.is_none());
        assert!(trace.has_warning("LINE_SELECTOR_IGNORED"));

        let err = select_lines(&resolved[0], &model(), true, &mut trace).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_LINE_SELECTOR");
    }

    #[test]
    fn test_selector_require_match() {
        let policy = policy_with(json!([
            {"id": "games", "type": "rate", "rate": 10,
             "line_selector": {"require_match": true,
                               "where": [{"var": "category", "op": "eq", "val": "games"}]}}
        ]));
        let mut trace = Trace::new();
        let resolved = resolve_components(&policy, &json!({}), &mut trace).unwrap();

        let lenient = select_lines(&resolved[0], &model(), false, &mut trace).unwrap().unwrap();
        assert!(lenient.applied.is_empty());
        assert!(trace.has_warning("LINE_SELECTOR_NO_MATCH"));

        let err = select_lines(&resolved[0], &model(), true, &mut trace).unwrap_err();
        assert_eq!(err.error_code(), "LINE_SELECTOR_NO_MATCH");
    }
}
