//! # Component Evaluator
//!
//! Computes the amount of every eligible component, in evaluation order.
//!
//! ## Evaluation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for component in resolved (precedence, declared index):                │
//! │                                                                         │
//! │    line scope   ──► for each applicable line:                           │
//! │                       amount_i = round(f(line_i), precision)            │
//! │                     amount = Σ amount_i                                 │
//! │                                                                         │
//! │    order scope  ──► amount = round(f(order aggregate), precision)       │
//! │                                                                         │
//! │    cap          ──► subtotal = Σ matched prior results                  │
//! │                     delta    = clamp(subtotal, min, max) − subtotal     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Strict mode turns a missing field, a zero divisor, an unknown base
//! operator, an unmatched tier or an empty cap target into an error.
//! Lenient mode records a warning and continues with zero.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::amount::{AmountLine, AmountModel, OrderAggregate};
use crate::decimal::{self, round_half_up, INTERNAL_SCALE};
use crate::error::{CoreError, CoreResult};
use crate::policy::{
    BaseExpr, BaseSpec, CapTargets, Component, ComponentKind, ComponentType, Scope, TierDimension,
};
use crate::resolver::{self, LineSelection, ResolvedComponent};
use crate::tier::{self, Bracket, TierMode};
use crate::trace::Trace;

// =============================================================================
// Result Types
// =============================================================================

/// Amount a component attributed to one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineAttribution {
    pub line_id: String,
    pub amount: Decimal,
}

/// Outcome of one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentResult {
    pub component_id: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub scope: Scope,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub amount: Decimal,
    /// Per-line amounts of a line-scoped component.
    pub lines: Vec<LineAttribution>,
    pub explain: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unmatched_lines: Vec<String>,
}

/// Evaluation settings shared by every component of one run.
#[derive(Debug, Clone, Copy)]
pub struct EvalSettings {
    pub precision: u32,
    pub strict: bool,
}

// =============================================================================
// Public API
// =============================================================================

/// Evaluates `resolved` components against `model`.
pub fn evaluate_components(
    resolved: &[ResolvedComponent<'_>],
    model: &AmountModel,
    settings: EvalSettings,
    trace: &mut Trace,
) -> CoreResult<Vec<ComponentResult>> {
    let mut results: Vec<ComponentResult> = Vec::with_capacity(resolved.len());

    for rc in resolved {
        let component = rc.component;
        if component.is_override() {
            continue;
        }

        let selection = resolver::select_lines(rc, model, settings.strict, trace)?;
        let lines: Vec<&AmountLine> = model
            .lines
            .iter()
            .filter(|l| selection.as_ref().map_or(true, |s| s.applies_to(&l.line_id)))
            .collect();

        let mut eval = ComponentEval::new(component, settings);
        match eval.apply(rc.scope, &lines, &model.order, &results, trace) {
            Ok(()) => {}
            Err(err) if err.is_overflow() && !settings.strict => {
                trace.warn_component(
                    "ARITHMETIC_OVERFLOW",
                    &component.id,
                    format!("{}; using 0", err),
                );
                eval.reset();
            }
            Err(err) => return Err(err),
        }

        let result = eval.finish(rc.scope, selection);
        debug!(
            component_id = %result.component_id,
            amount = %result.amount,
            "Component evaluated"
        );
        trace.step(
            "component_evaluated",
            json!({
                "component_id": result.component_id,
                "type": result.component_type,
                "scope": result.scope,
                "amount": result.amount,
            }),
        );
        results.push(result);
    }

    Ok(results)
}

// =============================================================================
// Per-Component Evaluation
// =============================================================================

struct TierSpec<'a> {
    mode: TierMode,
    dimension: TierDimension,
    brackets: &'a [Bracket],
    base: Option<&'a BaseSpec>,
}

struct ComponentEval<'c> {
    component: &'c Component,
    settings: EvalSettings,
    amount: Decimal,
    lines: Vec<LineAttribution>,
    explain: Value,
    unmatched: Vec<String>,
}

impl<'c> ComponentEval<'c> {
    fn new(component: &'c Component, settings: EvalSettings) -> Self {
        ComponentEval {
            component,
            settings,
            amount: decimal::zero(settings.precision),
            lines: Vec::new(),
            explain: Value::Null,
            unmatched: Vec::new(),
        }
    }

    fn apply(
        &mut self,
        scope: Scope,
        lines: &[&AmountLine],
        order: &OrderAggregate,
        prior: &[ComponentResult],
        trace: &mut Trace,
    ) -> CoreResult<()> {
        let component: &'c Component = self.component;
        match &component.kind {
            ComponentKind::Rate { rate, base } | ComponentKind::RatePp { rate, base } => {
                let base = base.clone().unwrap_or_default();
                self.rate(scope, *rate, &base, lines, order, trace)
            }
            ComponentKind::FixedUnit { amount } => self.fixed_unit(*amount, lines),
            ComponentKind::FixedOrder { amount } => {
                self.fixed_order(*amount);
                Ok(())
            }
            ComponentKind::Tier {
                mode,
                dimension,
                brackets,
                base,
            } => {
                let tier = TierSpec {
                    mode: *mode,
                    dimension: *dimension,
                    brackets,
                    base: base.as_ref(),
                };
                self.tier(scope, &tier, lines, order, trace)
            }
            ComponentKind::Cap { min, max, targets } => self.cap(*min, *max, targets, prior, trace),
            ComponentKind::Override { .. } => Ok(()),
        }
    }

    /// Drops partial results after a lenient overflow.
    fn reset(&mut self) {
        self.amount = decimal::zero(self.settings.precision);
        self.lines.clear();
        self.unmatched.clear();
        self.explain = json!({"overflow": true});
    }

    fn round(&self, value: Decimal) -> Decimal {
        round_half_up(value, self.settings.precision)
    }

    fn push_line(&mut self, line_id: &str, amount: Decimal) {
        self.lines.push(LineAttribution {
            line_id: line_id.to_string(),
            amount,
        });
    }

    fn sum_lines(&mut self) -> CoreResult<()> {
        self.amount = decimal::sum(self.lines.iter().map(|l| l.amount), self.settings.precision)?;
        Ok(())
    }

    fn base_evaluator<'t>(&self, trace: &'t mut Trace) -> BaseEvaluator<'c, 't> {
        let component: &'c Component = self.component;
        BaseEvaluator {
            component_id: &component.id,
            strict: self.settings.strict,
            trace,
        }
    }

    fn rate(
        &mut self,
        scope: Scope,
        rate: Decimal,
        base: &BaseSpec,
        lines: &[&AmountLine],
        order: &OrderAggregate,
        trace: &mut Trace,
    ) -> CoreResult<()> {
        match scope {
            Scope::Line => {
                let mut bases = Vec::with_capacity(lines.len());
                for line in lines {
                    let value = self.base_evaluator(trace).eval(base, BaseTarget::Line(line))?;
                    let amount = self.round(decimal::percent_of(value, rate, INTERNAL_SCALE)?);
                    self.push_line(&line.line_id, amount);
                    bases.push(json!({"line_id": line.line_id, "base": value.normalize()}));
                }
                self.sum_lines()?;
                self.explain = json!({"rate": rate, "base": base, "lines": bases});
            }
            Scope::Order => {
                let value = self.base_evaluator(trace).eval(base, BaseTarget::Order(order))?;
                self.amount = self.round(decimal::percent_of(value, rate, INTERNAL_SCALE)?);
                self.explain = json!({"rate": rate, "base": base, "base_value": value.normalize()});
            }
        }
        Ok(())
    }

    fn fixed_unit(&mut self, amount: Decimal, lines: &[&AmountLine]) -> CoreResult<()> {
        for line in lines {
            let value = decimal::mul(amount, line.quantity, self.settings.precision)?;
            self.push_line(&line.line_id, value);
        }
        self.sum_lines()?;
        self.explain = json!({"fixed": amount, "per": "unit"});
        Ok(())
    }

    fn fixed_order(&mut self, amount: Decimal) {
        self.amount = self.round(amount);
        self.explain = json!({"fixed": amount, "per": "order"});
    }

    fn tier(
        &mut self,
        scope: Scope,
        spec: &TierSpec<'_>,
        lines: &[&AmountLine],
        order: &OrderAggregate,
        trace: &mut Trace,
    ) -> CoreResult<()> {
        let base = match (spec.base, spec.mode) {
            (Some(_), TierMode::Marginal) => {
                trace.warn_component(
                    "TIER_BASE_IGNORED",
                    &self.component.id,
                    "marginal tiers slice the dimension itself; base is ignored",
                );
                None
            }
            (base, _) => base,
        };

        match scope {
            Scope::Line => {
                let mut entries = Vec::with_capacity(lines.len());
                for line in lines {
                    let key = line_key(spec.dimension, line, order, self.settings.precision)?;
                    let amount_base = match base {
                        Some(b) => self.base_evaluator(trace).eval(b, BaseTarget::Line(line))?,
                        None => key,
                    };
                    let outcome = tier::calculate_on(key, amount_base, spec.brackets, spec.mode)?;
                    if !outcome.matched {
                        self.unmatched_key(Some(&line.line_id), key, trace)?;
                    }
                    let amount = self.round(outcome.amount);
                    self.push_line(&line.line_id, amount);
                    entries.push(json!({
                        "line_id": line.line_id,
                        "key": key.normalize(),
                        "bracket_index": outcome.bracket_index,
                        "rate": outcome.rate,
                    }));
                }
                self.sum_lines()?;
                self.explain = json!({
                    "mode": spec.mode,
                    "dimension": spec.dimension,
                    "lines": entries,
                });
            }
            Scope::Order => {
                let key = order_key(spec.dimension, order, self.settings.precision)?;
                let amount_base = match base {
                    Some(b) => self.base_evaluator(trace).eval(b, BaseTarget::Order(order))?,
                    None => key,
                };
                let outcome = tier::calculate_on(key, amount_base, spec.brackets, spec.mode)?;
                if !outcome.matched {
                    self.unmatched_key(None, key, trace)?;
                }
                self.amount = self.round(outcome.amount);
                self.explain = json!({
                    "mode": spec.mode,
                    "dimension": spec.dimension,
                    "key": key.normalize(),
                    "bracket_index": outcome.bracket_index,
                    "rate": outcome.rate,
                    "contributions": outcome.contributions,
                });
            }
        }
        Ok(())
    }

    fn unmatched_key(&mut self, line_id: Option<&str>, key: Decimal, trace: &mut Trace) -> CoreResult<()> {
        if self.settings.strict {
            return Err(CoreError::TierNotFound {
                component_id: self.component.id.clone(),
                line_id: line_id.map(str::to_string),
                key,
            });
        }
        trace.warn_component(
            "TIER_NOT_FOUND",
            &self.component.id,
            format!("no bracket matches key {}", key.normalize()),
        );
        self.unmatched.push(line_id.unwrap_or("order").to_string());
        Ok(())
    }

    fn cap(
        &mut self,
        min: Option<Decimal>,
        max: Option<Decimal>,
        targets: &CapTargets,
        prior: &[ComponentResult],
        trace: &mut Trace,
    ) -> CoreResult<()> {
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(CoreError::CapInvalidBounds {
                    component_id: self.component.id.clone(),
                    min: lo,
                    max: hi,
                });
            }
        }

        let matched: Vec<&ComponentResult> = prior
            .iter()
            .filter(|r| targets.matches(&r.component_id, &r.tags, r.component_type, r.scope))
            .collect();

        if matched.is_empty() {
            if self.settings.strict {
                return Err(CoreError::CapTargetNoMatch {
                    component_id: self.component.id.clone(),
                });
            }
            trace.warn_component(
                "CAP_TARGET_NO_MATCH",
                &self.component.id,
                "cap targets matched no prior component",
            );
        }

        let precision = self.settings.precision;
        let subtotal = decimal::sum(matched.iter().map(|r| r.amount), precision)?;
        let delta = match (min, max) {
            (Some(lo), _) if subtotal < lo => decimal::sub(lo, subtotal, precision)?,
            (_, Some(hi)) if subtotal > hi => decimal::sub(hi, subtotal, precision)?,
            _ => Decimal::ZERO,
        };
        self.amount = self.round(delta);
        self.explain = json!({
            "min": min,
            "max": max,
            "subtotal": subtotal,
            "matched": matched.iter().map(|r| r.component_id.as_str()).collect::<Vec<_>>(),
            "adjusted_to": decimal::add(subtotal, delta, precision)?,
        });
        Ok(())
    }

    fn finish(self, scope: Scope, selection: Option<LineSelection>) -> ComponentResult {
        let (applied_lines, skipped_lines) = match selection {
            Some(s) => (Some(s.applied), Some(s.skipped)),
            None => (None, None),
        };
        ComponentResult {
            component_id: self.component.id.clone(),
            component_type: self.component.component_type(),
            scope,
            tags: self.component.tags.clone(),
            label: self.component.label.clone(),
            amount: self.amount,
            lines: self.lines,
            explain: self.explain,
            applied_lines,
            skipped_lines,
            unmatched_lines: self.unmatched,
        }
    }
}

/// Tier key of a line-scoped tier.
fn line_key(
    dimension: TierDimension,
    line: &AmountLine,
    order: &OrderAggregate,
    precision: u32,
) -> CoreResult<Decimal> {
    Ok(match dimension {
        TierDimension::UnitPrice => line.unit_price,
        TierDimension::LineTotal => line.net,
        TierDimension::Quantity => line.quantity,
        TierDimension::OrderTotal | TierDimension::OrderGross => order_key(dimension, order, precision)?,
    })
}

/// Tier key of an order-scoped tier.
fn order_key(dimension: TierDimension, order: &OrderAggregate, precision: u32) -> CoreResult<Decimal> {
    Ok(match dimension {
        TierDimension::UnitPrice => decimal::div(order.net, order.quantity, precision)?,
        TierDimension::LineTotal | TierDimension::OrderTotal => order.net,
        TierDimension::Quantity => order.quantity,
        TierDimension::OrderGross => order.gross,
    })
}

// =============================================================================
// Base Spec Evaluation
// =============================================================================

/// What a base spec reads fields from.
#[derive(Debug, Clone, Copy)]
pub enum BaseTarget<'a> {
    Line(&'a AmountLine),
    Order(&'a OrderAggregate),
}

impl BaseTarget<'_> {
    fn field(&self, name: &str) -> Option<Decimal> {
        match self {
            BaseTarget::Line(line) => line.field(name),
            BaseTarget::Order(order) => order.field(name),
        }
    }

    fn describe(&self) -> String {
        match self {
            BaseTarget::Line(line) => format!("line {}", line.line_id),
            BaseTarget::Order(_) => "order".to_string(),
        }
    }
}

/// Evaluates a [`BaseSpec`] at internal scale.
pub struct BaseEvaluator<'a, 't> {
    pub component_id: &'a str,
    pub strict: bool,
    pub trace: &'t mut Trace,
}

impl BaseEvaluator<'_, '_> {
    pub fn eval(&mut self, spec: &BaseSpec, target: BaseTarget<'_>) -> CoreResult<Decimal> {
        match spec {
            BaseSpec::Field(name) => self.field(name, target),
            BaseSpec::Expr(expr) => self.expr(expr, target),
        }
    }

    fn field(&mut self, name: &str, target: BaseTarget<'_>) -> CoreResult<Decimal> {
        if let Some(value) = target.field(name) {
            return Ok(value);
        }
        let context = format!("component {} ({})", self.component_id, target.describe());
        if self.strict {
            return Err(CoreError::FieldMissing {
                field: name.to_string(),
                context,
            });
        }
        self.trace.warn_component(
            "FIELD_MISSING",
            self.component_id,
            format!("field '{}' is missing in {}; using 0", name, context),
        );
        Ok(Decimal::ZERO)
    }

    fn expr(&mut self, expr: &BaseExpr, target: BaseTarget<'_>) -> CoreResult<Decimal> {
        let value = match expr {
            BaseExpr::Field { name } => self.field(name, target)?,
            BaseExpr::Literal { value } => *value,
            BaseExpr::Add { args } => decimal::total(self.args(args, target)?)?,
            BaseExpr::Sub { args } => decimal::difference(&self.args(args, target)?, INTERNAL_SCALE)?,
            BaseExpr::Mul { args } => {
                let values = self.args(args, target)?;
                if values.is_empty() {
                    Decimal::ZERO
                } else {
                    decimal::product(values, INTERNAL_SCALE)?
                }
            }
            BaseExpr::Div { args } => {
                let values = self.args(args, target)?;
                self.divide(&values, target)?
            }
            BaseExpr::Min { args } => self.args(args, target)?.into_iter().min().unwrap_or(Decimal::ZERO),
            BaseExpr::Max { args } => self.args(args, target)?.into_iter().max().unwrap_or(Decimal::ZERO),
            BaseExpr::Abs { arg } => self.eval(arg, target)?.abs(),
            BaseExpr::Unknown => {
                if self.strict {
                    return Err(CoreError::UnknownBaseOp {
                        component_id: self.component_id.to_string(),
                    });
                }
                self.trace.warn_component(
                    "UNKNOWN_BASE_OP",
                    self.component_id,
                    "unknown base expression operator; using 0",
                );
                Decimal::ZERO
            }
        };
        Ok(round_half_up(value, INTERNAL_SCALE))
    }

    fn args(&mut self, args: &[BaseSpec], target: BaseTarget<'_>) -> CoreResult<Vec<Decimal>> {
        args.iter().map(|arg| self.eval(arg, target)).collect()
    }

    fn divide(&mut self, values: &[Decimal], target: BaseTarget<'_>) -> CoreResult<Decimal> {
        let Some((first, rest)) = values.split_first() else {
            return Ok(Decimal::ZERO);
        };
        let mut acc = *first;
        for divisor in rest {
            if divisor.is_zero() {
                let context = format!("base of component {} ({})", self.component_id, target.describe());
                if self.strict {
                    return Err(CoreError::DivisionByZero { context });
                }
                self.trace.warn_component(
                    "DIVISION_BY_ZERO",
                    self.component_id,
                    format!("division by zero in {}; using 0", context),
                );
                return Ok(Decimal::ZERO);
            }
            acc = decimal::div(acc, *divisor, INTERNAL_SCALE)?;
        }
        Ok(acc)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
