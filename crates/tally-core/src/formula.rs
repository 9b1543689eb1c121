//! # Formula Graph Executor
//!
//! Payroll-style evaluation of formulas that write named concepts.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  formulas ──► producers: target → formula     (DUPLICATE_TARGET)        │
//! │           ──► dependencies = declared ∪ referenced, groups expanded     │
//! │           ──► depth-first topological order   (CIRCULAR_DEPENDENCY)     │
//! │                                                                         │
//! │  for formula in order:                                                  │
//! │     conditions({context.., concepts}) ? evaluate : skip                 │
//! │     concepts[target] = round(value, precision)                          │
//! │                                                                         │
//! │  lines = earnings + deductions in execution order                       │
//! │  diff  = round(net) − (Σ earnings − Σ deductions)                       │
//! │        └──► nonzero: one ROUNDING_ADJUSTMENT line                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole order is computed, and cycles reported, before any formula
//! is evaluated.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::canonical;
use crate::condition::{self, Rules, SelectMode};
use crate::decimal::{self, round_half_up, INTERNAL_SCALE};
use crate::error::{CoreError, CoreResult};
use crate::tier::{self, Bracket, TierMode};
use crate::trace::{Trace, Warning};

/// Concept code of the synthetic rounding line.
pub const ROUNDING_ADJUSTMENT: &str = "ROUNDING_ADJUSTMENT";

// =============================================================================
// Formula Types
// =============================================================================

/// How a concept shows up on the payslip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaKind {
    Earning,
    Deduction,
    /// Computed but not listed as a line.
    #[default]
    Info,
}

/// One formula writing one concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub code: String,
    pub target: String,
    pub expression: Expr,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Rules>,
    #[serde(default)]
    pub kind: FormulaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Formula expression, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    Concept {
        code: String,
    },
    Literal {
        value: Decimal,
    },
    /// Numeric value at a dot path of the run context.
    Input {
        path: String,
    },
    Group {
        code: String,
    },
    Add {
        args: Vec<Expr>,
    },
    Sub {
        args: Vec<Expr>,
    },
    Mul {
        args: Vec<Expr>,
    },
    Div {
        args: Vec<Expr>,
    },
    Min {
        args: Vec<Expr>,
    },
    Max {
        args: Vec<Expr>,
    },
    Abs {
        arg: Box<Expr>,
    },
    /// HALF_UP to `scale`, or to the run precision.
    Round {
        arg: Box<Expr>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_scale"
        )]
        scale: Option<u32>,
    },
    /// `base × rate / 100`.
    Percent {
        base: Box<Expr>,
        rate: Box<Expr>,
    },
    Tier {
        arg: Box<Expr>,
        #[serde(default)]
        mode: TierMode,
        brackets: Vec<Bracket>,
    },
}

impl Expr {
    /// Concept and group codes referenced anywhere in the expression.
    pub fn references(&self) -> Vec<Reference<'_>> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<Reference<'a>>) {
        match self {
            Expr::Concept { code } => out.push(Reference::Concept(code)),
            Expr::Group { code } => out.push(Reference::Group(code)),
            Expr::Literal { .. } | Expr::Input { .. } => {}
            Expr::Add { args }
            | Expr::Sub { args }
            | Expr::Mul { args }
            | Expr::Div { args }
            | Expr::Min { args }
            | Expr::Max { args } => args.iter().for_each(|a| a.collect_references(out)),
            Expr::Abs { arg } | Expr::Round { arg, .. } | Expr::Tier { arg, .. } => {
                arg.collect_references(out)
            }
            Expr::Percent { base, rate } => {
                base.collect_references(out);
                rate.collect_references(out);
            }
        }
    }
}
/// Reads `scale` through [`Decimal`] so it parses from any JSON number form,
/// including the buffered representation inside tagged expressions.
fn deserialize_scale<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(value) = Option::<Decimal>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if !value.fract().is_zero() {
        return Err(D::Error::custom(format!("scale must be an integer, got {}", value)));
    }
    value
        .to_u32()
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("scale out of range: {}", value)))
}

/// A reference found in an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Concept(&'a str),
    Group(&'a str),
}

/// How a group folds its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupAggregate {
    #[default]
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub concept: String,
    #[serde(default)]
    pub mode: SelectMode,
    #[serde(default = "default_weight")]
    pub weight: Decimal,
}

fn default_weight() -> Decimal {
    Decimal::ONE
}

/// A named aggregate over other concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptGroup {
    pub code: String,
    #[serde(default)]
    pub aggregate: GroupAggregate,
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

impl ConceptGroup {
    /// Codes of included members.
    pub fn included(&self) -> impl Iterator<Item = &GroupMember> {
        self.members.iter().filter(|m| m.mode == SelectMode::Include)
    }
}

/// A payroll run request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayrollInput {
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Externally supplied concepts (hours, base salary, ...).
    #[serde(default)]
    pub concepts: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub formulas: Vec<Formula>,
    #[serde(default)]
    pub groups: Vec<ConceptGroup>,
    #[serde(default = "default_net_concept")]
    pub net_concept: String,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

fn default_net_concept() -> String {
    "NET_PAY".to_string()
}

// =============================================================================
// Result Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayrollLine {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub kind: FormulaKind,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFormula {
    pub code: String,
    pub reason: String,
}

/// Outcome of a payroll run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayrollResult {
    pub concepts: BTreeMap<String, Decimal>,
    pub lines: Vec<PayrollLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<PayrollLine>,
    pub execution_order: Vec<String>,
    pub skipped: Vec<SkippedFormula>,
    pub warnings: Vec<Warning>,
    pub precision: u32,
    pub strict: bool,
    pub signature: String,
}

// =============================================================================
// Ordering
// =============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    New,
    OnStack,
    Done,
}

struct Sorter<'a> {
    formulas: &'a [Formula],
    edges: Vec<Vec<usize>>,
    state: Vec<Visit>,
    order: Vec<usize>,
}

impl Sorter<'_> {
    /// Post-order walk from `root` over a frame stack of
    /// `(formula, next edge position)`.
    fn visit(&mut self, root: usize) -> CoreResult<()> {
        if self.state[root] != Visit::New {
            return Ok(());
        }
        self.state[root] = Visit::OnStack;
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(frame) = frames.last_mut() {
            let (index, edge) = *frame;
            let Some(&next) = self.edges[index].get(edge) else {
                frames.pop();
                self.state[index] = Visit::Done;
                self.order.push(index);
                continue;
            };
            frame.1 += 1;

            match self.state[next] {
                Visit::Done => {}
                Visit::OnStack => return Err(self.cycle(&frames, next)),
                Visit::New => {
                    self.state[next] = Visit::OnStack;
                    frames.push((next, 0));
                }
            }
        }
        Ok(())
    }

    fn cycle(&self, frames: &[(usize, usize)], entry: usize) -> CoreError {
        let start = frames.iter().position(|&(i, _)| i == entry).unwrap_or(0);
        let mut path: Vec<String> = frames[start..]
            .iter()
            .map(|&(i, _)| self.formulas[i].code.clone())
            .collect();
        path.push(self.formulas[entry].code.clone());
        CoreError::CircularDependency {
            entry: self.formulas[entry].code.clone(),
            path,
        }
    }
}

/// Dependency codes of one formula: declared first, then referenced, with
/// groups expanded to their members. Duplicates are dropped.
pub fn dependencies(formula: &Formula, groups: &[ConceptGroup]) -> Vec<String> {
    let referenced = formula.expression.references().into_iter().map(|r| match r {
        Reference::Concept(code) | Reference::Group(code) => code,
    });

    let mut out: Vec<String> = Vec::new();
    for code in formula.dependencies.iter().map(String::as_str).chain(referenced) {
        let expanded: Vec<&str> = match groups.iter().find(|g| g.code == code) {
            Some(group) => group.members.iter().map(|m| m.concept.as_str()).collect(),
            None => vec![code],
        };
        for dep in expanded {
            if !out.iter().any(|c| c == dep) {
                out.push(dep.to_string());
            }
        }
    }
    out
}

/// Execution order as indices into `formulas`.
pub fn execution_order(formulas: &[Formula], groups: &[ConceptGroup]) -> CoreResult<Vec<usize>> {
    let mut producers: HashMap<&str, usize> = HashMap::new();
    for (index, formula) in formulas.iter().enumerate() {
        if let Some(&first) = producers.get(formula.target.as_str()) {
            return Err(CoreError::DuplicateTarget {
                target: formula.target.clone(),
                first: formulas[first].code.clone(),
                second: formula.code.clone(),
            });
        }
        producers.insert(&formula.target, index);
    }

    // A dependency nobody produces is an external input.
    let edges = formulas
        .iter()
        .map(|f| {
            dependencies(f, groups)
                .iter()
                .filter_map(|code| producers.get(code.as_str()).copied())
                .collect()
        })
        .collect();

    let mut sorter = Sorter {
        formulas,
        edges,
        state: vec![Visit::New; formulas.len()],
        order: Vec::with_capacity(formulas.len()),
    };
    for index in 0..formulas.len() {
        sorter.visit(index)?;
    }
    Ok(sorter.order)
}

// =============================================================================
// Execution
// =============================================================================

/// Runs every formula of `input` in dependency order.
pub fn run(input: &PayrollInput, precision: u32, strict: bool) -> CoreResult<PayrollResult> {
    let order = execution_order(&input.formulas, &input.groups)?;
    debug!(formulas = order.len(), "Formula order computed");

    let mut trace = Trace::new();
    let mut run = Run {
        input,
        precision,
        strict,
        concepts: input.concepts.clone(),
        group_cache: HashMap::new(),
        trace: &mut trace,
    };

    let mut executed = Vec::with_capacity(order.len());
    let mut skipped = Vec::new();
    for index in order {
        let formula = &input.formulas[index];
        let context = run.condition_context()?;
        if !condition::matches_opt(&context, formula.conditions.as_ref()).matched {
            debug!(code = %formula.code, "Formula skipped");
            skipped.push(SkippedFormula {
                code: formula.code.clone(),
                reason: "condition_failed".to_string(),
            });
            continue;
        }

        match run.eval(&formula.expression, &formula.code) {
            Ok(value) => {
                run.concepts.insert(formula.target.clone(), round_half_up(value, precision));
                executed.push(index);
            }
            Err(err) if err.is_overflow() && !strict => {
                run.trace.warn(
                    "ARITHMETIC_OVERFLOW",
                    format!("formula {} overflowed: {}; using 0", formula.code, err),
                );
                run.concepts.insert(formula.target.clone(), decimal::zero(precision));
                executed.push(index);
            }
            Err(err) if strict => {
                return Err(CoreError::FormulaFailed {
                    code: formula.code.clone(),
                    source: Box::new(err),
                });
            }
            Err(err) => {
                run.trace.warn(
                    "FORMULA_FAILED",
                    format!("formula {} failed: {}", formula.code, err),
                );
                skipped.push(SkippedFormula {
                    code: formula.code.clone(),
                    reason: err.error_code().to_string(),
                });
            }
        }
    }

    let concepts = run.concepts;
    let mut lines: Vec<PayrollLine> = executed
        .iter()
        .map(|&i| &input.formulas[i])
        .filter(|f| f.kind != FormulaKind::Info)
        .filter_map(|f| {
            concepts.get(&f.target).map(|amount| PayrollLine {
                code: f.target.clone(),
                label: f.label.clone(),
                kind: f.kind,
                amount: *amount,
            })
        })
        .collect();

    let adjustment = rounding_adjustment(&concepts, &lines, &input.net_concept, precision)?;
    if let Some(line) = &adjustment {
        lines.push(line.clone());
    }

    let signature = canonical::payroll_signature(input, precision, strict)?;
    info!(
        executed = executed.len(),
        skipped = skipped.len(),
        "Payroll run complete"
    );

    let (_, warnings, _) = trace.finish();
    Ok(PayrollResult {
        concepts,
        lines,
        adjustment,
        execution_order: executed.iter().map(|&i| input.formulas[i].code.clone()).collect(),
        skipped,
        warnings,
        precision,
        strict,
        signature,
    })
}

fn rounding_adjustment(
    concepts: &BTreeMap<String, Decimal>,
    lines: &[PayrollLine],
    net_concept: &str,
    precision: u32,
) -> CoreResult<Option<PayrollLine>> {
    let Some(net) = concepts.get(net_concept) else {
        return Ok(None);
    };
    let net = round_half_up(*net, precision);
    let signed = lines.iter().map(|l| match l.kind {
        FormulaKind::Deduction => -l.amount,
        _ => l.amount,
    });
    let diff = decimal::sub(net, decimal::sum(signed, precision)?, precision)?;
    if diff.is_zero() {
        return Ok(None);
    }
    let (kind, amount) = if diff > Decimal::ZERO {
        (FormulaKind::Earning, diff)
    } else {
        (FormulaKind::Deduction, diff.abs())
    };
    Ok(Some(PayrollLine {
        code: ROUNDING_ADJUSTMENT.to_string(),
        label: Some("Rounding adjustment".to_string()),
        kind,
        amount,
    }))
}

struct Run<'a, 't> {
    input: &'a PayrollInput,
    precision: u32,
    strict: bool,
    concepts: BTreeMap<String, Decimal>,
    group_cache: HashMap<String, Decimal>,
    trace: &'t mut Trace,
}

impl Run<'_, '_> {
    fn condition_context(&self) -> CoreResult<Value> {
        let mut context = self.input.context.clone();
        context.insert("concepts".to_string(), serde_json::to_value(&self.concepts)?);
        if let Some(as_of) = self.input.as_of {
            context
                .entry("as_of".to_string())
                .or_insert_with(|| Value::String(as_of.to_string()));
        }
        Ok(Value::Object(context))
    }

    fn eval(&mut self, expr: &Expr, code: &str) -> CoreResult<Decimal> {
        let value = match expr {
            Expr::Concept { code: concept } => self.concept(concept, code)?,
            Expr::Literal { value } => *value,
            Expr::Input { path } => self.context_value(path, code)?,
            Expr::Group { code: group } => self.group(group, code)?,
            Expr::Add { args } => decimal::total(self.args(args, code)?)?,
            Expr::Sub { args } => decimal::difference(&self.args(args, code)?, INTERNAL_SCALE)?,
            Expr::Mul { args } => {
                let values = self.args(args, code)?;
                if values.is_empty() {
                    Decimal::ZERO
                } else {
                    decimal::product(values, INTERNAL_SCALE)?
                }
            }
            Expr::Div { args } => {
                let values = self.args(args, code)?;
                self.divide(&values, code)?
            }
            Expr::Min { args } => self.args(args, code)?.into_iter().min().unwrap_or(Decimal::ZERO),
            Expr::Max { args } => self.args(args, code)?.into_iter().max().unwrap_or(Decimal::ZERO),
            Expr::Abs { arg } => self.eval(arg, code)?.abs(),
            Expr::Round { arg, scale } => {
                round_half_up(self.eval(arg, code)?, scale.unwrap_or(self.precision))
            }
            Expr::Percent { base, rate } => {
                let base = self.eval(base, code)?;
                let rate = self.eval(rate, code)?;
                decimal::percent_of(base, rate, INTERNAL_SCALE)?
            }
            Expr::Tier { arg, mode, brackets } => {
                let base = self.eval(arg, code)?;
                tier::calculate(base, brackets, *mode)?.amount
            }
        };
        Ok(match expr {
            Expr::Round { .. } => value,
            _ => round_half_up(value, INTERNAL_SCALE),
        })
    }

    fn args(&mut self, args: &[Expr], code: &str) -> CoreResult<Vec<Decimal>> {
        args.iter().map(|arg| self.eval(arg, code)).collect()
    }

    fn divide(&mut self, values: &[Decimal], code: &str) -> CoreResult<Decimal> {
        let Some((first, rest)) = values.split_first() else {
            return Ok(Decimal::ZERO);
        };
        let mut acc = *first;
        for divisor in rest {
            if divisor.is_zero() {
                let context = format!("formula {}", code);
                if self.strict {
                    return Err(CoreError::DivisionByZero { context });
                }
                self.trace.warn("DIVISION_BY_ZERO", format!("division by zero in {}; using 0", context));
                return Ok(Decimal::ZERO);
            }
            acc = decimal::div(acc, *divisor, INTERNAL_SCALE)?;
        }
        Ok(acc)
    }

    fn concept(&mut self, concept: &str, code: &str) -> CoreResult<Decimal> {
        if let Some(value) = self.concepts.get(concept) {
            return Ok(*value);
        }
        if self.strict {
            return Err(CoreError::ConceptMissing {
                code: concept.to_string(),
            });
        }
        self.trace.warn(
            "CONCEPT_MISSING",
            format!("concept {} referenced by {} is not set; using 0", concept, code),
        );
        Ok(Decimal::ZERO)
    }

    fn context_value(&mut self, path: &str, code: &str) -> CoreResult<Decimal> {
        let context = Value::Object(self.input.context.clone());
        if let Some(value) = condition::lookup(&context, path).and_then(decimal::to_decimal) {
            return Ok(value);
        }
        let context = format!("formula {}", code);
        if self.strict {
            return Err(CoreError::FieldMissing {
                field: path.to_string(),
                context,
            });
        }
        self.trace.warn(
            "FIELD_MISSING",
            format!("input '{}' is missing in {}; using 0", path, context),
        );
        Ok(Decimal::ZERO)
    }

    /// Resolves a group once per run. Unset members are left out.
    fn group(&mut self, group_code: &str, code: &str) -> CoreResult<Decimal> {
        if let Some(value) = self.group_cache.get(group_code) {
            return Ok(*value);
        }
        let Some(group) = self.input.groups.iter().find(|g| g.code == group_code) else {
            return self.concept(group_code, code);
        };

        let values = group
            .included()
            .filter_map(|m| self.concepts.get(&m.concept).map(|v| decimal::mul(*v, m.weight, INTERNAL_SCALE)))
            .collect::<CoreResult<Vec<Decimal>>>()?;
        let value = match group.aggregate {
            GroupAggregate::Sum => decimal::total(values.iter().copied())?,
            GroupAggregate::Avg if values.is_empty() => Decimal::ZERO,
            GroupAggregate::Avg => {
                let total = decimal::total(values.iter().copied())?;
                decimal::div(total, Decimal::from(values.len()), INTERNAL_SCALE)?
            }
            GroupAggregate::Min => values.iter().copied().min().unwrap_or(Decimal::ZERO),
            GroupAggregate::Max => values.iter().copied().max().unwrap_or(Decimal::ZERO),
        };
        let value = round_half_up(value, INTERNAL_SCALE);
        self.group_cache.insert(group_code.to_string(), value);
        Ok(value)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
