//! # Policy Model
//!
//! Declarative fee policies and their components.
//!
//! ## Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Policy {policy_key, channel_key, version, effective_from..to,          │
//! │          priority, strict?, conditions?}                                │
//! │    └── components[]                                                     │
//! │          ├── rate         percent of a base                             │
//! │          ├── rate_pp      percentage points of a base                   │
//! │          ├── fixed_unit   amount × quantity        (always line)        │
//! │          ├── fixed_order  constant amount          (always order)       │
//! │          ├── tier         bracket table on a dimension                  │
//! │          ├── cap          floor/ceiling on prior results (always order) │
//! │          └── override     excludes other components (always order)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components are a closed sum type tagged by `type`; the shared fields
//! (`id`, `scope`, `conditions`, `line_selector`, `tags`, `precedence`)
//! sit next to the tag.

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{self, Logic, Predicate, Rules, SelectMode};
use crate::tier::{Bracket, TierMode};

// =============================================================================
// Policy
// =============================================================================

/// A versioned, channel-bound pricing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_key: String,
    pub channel_key: String,
    pub version: u32,
    pub effective_from: NaiveDate,
    /// Inclusive; `None` is open-ended.
    #[serde(default)]
    pub effective_to: Option<NaiveDate>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub conditions: Option<Rules>,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Policy {
    /// True when `as_of` falls inside `[effective_from, effective_to]`.
    pub fn is_effective(&self, as_of: NaiveDate) -> bool {
        as_of >= self.effective_from && self.effective_to.map_or(true, |to| as_of <= to)
    }
}

// =============================================================================
// Component
// =============================================================================

/// Where a component computes its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Line,
    Order,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Line => write!(f, "line"),
            Scope::Order => write!(f, "order"),
        }
    }
}

/// One pricing component of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(flatten)]
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Rules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_selector: Option<LineSelector>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub precedence: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Component {
    pub fn component_type(&self) -> ComponentType {
        self.kind.component_type()
    }

    /// Scope dictated by the component type, if any.
    pub fn forced_scope(&self) -> Option<Scope> {
        match self.kind {
            ComponentKind::FixedUnit { .. } => Some(Scope::Line),
            ComponentKind::FixedOrder { .. }
            | ComponentKind::Cap { .. }
            | ComponentKind::Override { .. } => Some(Scope::Order),
            _ => None,
        }
    }

    /// Forced scope, then declared scope, then the type default.
    ///
    /// Tiers keyed on an order dimension default to order scope; every
    /// other free component defaults to line scope.
    pub fn effective_scope(&self) -> Scope {
        if let Some(forced) = self.forced_scope() {
            return forced;
        }
        if let Some(declared) = self.scope {
            return declared;
        }
        match &self.kind {
            ComponentKind::Tier { dimension, .. } if dimension.is_order() => Scope::Order,
            _ => Scope::Line,
        }
    }

    /// True when the declared scope contradicts the forced one.
    pub fn scope_conflict(&self) -> bool {
        matches!(
            (self.forced_scope(), self.scope),
            (Some(forced), Some(declared)) if forced != declared
        )
    }

    pub fn is_override(&self) -> bool {
        matches!(self.kind, ComponentKind::Override { .. })
    }
}

/// Type-specific part of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentKind {
    /// `base × rate / 100`.
    Rate {
        rate: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<BaseSpec>,
    },
    /// Same arithmetic as `rate`, reported as percentage points.
    #[serde(rename = "rate_pp")]
    RatePp {
        rate: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<BaseSpec>,
    },
    FixedUnit {
        amount: Decimal,
    },
    FixedOrder {
        amount: Decimal,
    },
    Tier {
        #[serde(default)]
        mode: TierMode,
        #[serde(default)]
        dimension: TierDimension,
        brackets: Vec<Bracket>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<BaseSpec>,
    },
    Cap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<Decimal>,
        #[serde(default)]
        targets: CapTargets,
    },
    Override {
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl ComponentKind {
    pub fn component_type(&self) -> ComponentType {
        match self {
            ComponentKind::Rate { .. } => ComponentType::Rate,
            ComponentKind::RatePp { .. } => ComponentType::RatePp,
            ComponentKind::FixedUnit { .. } => ComponentType::FixedUnit,
            ComponentKind::FixedOrder { .. } => ComponentType::FixedOrder,
            ComponentKind::Tier { .. } => ComponentType::Tier,
            ComponentKind::Cap { .. } => ComponentType::Cap,
            ComponentKind::Override { .. } => ComponentType::Override,
        }
    }
}

/// Component type tag, used by cap targets and in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Rate,
    #[serde(rename = "rate_pp")]
    RatePp,
    FixedUnit,
    FixedOrder,
    Tier,
    Cap,
    Override,
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentType::Rate => "rate",
            ComponentType::RatePp => "rate_pp",
            ComponentType::FixedUnit => "fixed_unit",
            ComponentType::FixedOrder => "fixed_order",
            ComponentType::Tier => "tier",
            ComponentType::Cap => "cap",
            ComponentType::Override => "override",
        };
        write!(f, "{}", name)
    }
}

/// Key a tier table is looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierDimension {
    UnitPrice,
    #[default]
    LineTotal,
    Quantity,
    OrderTotal,
    OrderGross,
}

impl TierDimension {
    pub fn is_order(self) -> bool {
        matches!(self, TierDimension::OrderTotal | TierDimension::OrderGross)
    }
}

/// Which prior results a cap applies to. Lists are OR-matched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapTargets {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub types: Vec<ComponentType>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

impl CapTargets {
    /// Empty targets match every prior result.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.tags.is_empty() && self.types.is_empty() && self.scopes.is_empty()
    }

    pub fn matches(&self, id: &str, tags: &[String], kind: ComponentType, scope: Scope) -> bool {
        self.is_empty()
            || self.ids.iter().any(|t| t == id)
            || self.tags.iter().any(|t| tags.contains(t))
            || self.types.contains(&kind)
            || self.scopes.contains(&scope)
    }
}

// =============================================================================
// Base Spec
// =============================================================================

/// What a rate (or tier) is applied to.
///
/// ## Forms
/// ```json
/// "net"
/// {"op": "sub", "args": ["gross", {"op": "field", "name": "shipping"}]}
/// {"op": "max", "args": [{"op": "literal", "value": "0"}, "meta.points"]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseSpec {
    Field(String),
    Expr(BaseExpr),
}

impl Default for BaseSpec {
    fn default() -> Self {
        BaseSpec::Field("net".to_string())
    }
}

/// Arithmetic over amount fields. `sub` and `div` fold left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BaseExpr {
    Field { name: String },
    Literal { value: Decimal },
    Add { args: Vec<BaseSpec> },
    Sub { args: Vec<BaseSpec> },
    Mul { args: Vec<BaseSpec> },
    Div { args: Vec<BaseSpec> },
    Min { args: Vec<BaseSpec> },
    Max { args: Vec<BaseSpec> },
    Abs { arg: Box<BaseSpec> },
    #[serde(other)]
    Unknown,
}

// =============================================================================
// Line Selector
// =============================================================================

/// Narrows the lines a line-scoped component applies to.
///
/// `where` is an AND list; `any_of` is an OR of AND-groups. Both must hold
/// when both are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineSelector {
    #[serde(default)]
    pub mode: SelectMode,
    #[serde(default, rename = "where", alias = "all_of")]
    pub all_of: Vec<Predicate>,
    #[serde(default)]
    pub any_of: Vec<Vec<Predicate>>,
    #[serde(default)]
    pub require_match: bool,
}

impl LineSelector {
    /// Evaluates the selector against one line context.
    pub fn selects(&self, line: &Value) -> bool {
        let mut explain = Vec::new();
        let all = condition::eval_predicates(line, &self.all_of, Logic::And, &mut explain);
        let any = self.any_of.is_empty()
            || self
                .any_of
                .iter()
                .any(|group| condition::eval_predicates(line, group, Logic::And, &mut explain));
        let matched = all && any;
        match self.mode {
            SelectMode::Include => matched,
            SelectMode::Exclude => !matched,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
