//! # Domain Types
//!
//! Input, option and result types of a fee calculation.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌─────────────────┐   ┌──────────────────────┐ │
//! │  │ CalculationInput │   │    Options      │   │  CalculationResult   │ │
//! │  │  ──────────────  │   │  ─────────────  │   │  ──────────────────  │ │
//! │  │  channel_key     │   │  precision      │   │  total, currency     │ │
//! │  │  currency        │   │  strict         │   │  breakdown[]         │ │
//! │  │  lines[]         │   │  allocation_    │   │  allocation[]        │ │
//! │  │  order?          │   │    strategy     │   │  reconciliation      │ │
//! │  │  context, as_of  │   └─────────────────┘   │  warnings, signature │ │
//! │  └──────────────────┘                         └──────────────────────┘ │
//! │                                                                         │
//! │  CalculationResponse = {success: true, ..result}                       │
//! │                      | {success: false, error_type, error_code, ..}    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All amounts are `rust_decimal::Decimal`. They serialize as strings and
//! accept JSON strings or numbers on input.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::allocation::{LineAllocation, Reconciliation};
use crate::canonical::PolicyHashes;
use crate::decimal::DEFAULT_PRECISION;
use crate::error::{CoreError, ErrorType};
use crate::evaluator::ComponentResult;
use crate::policy::Policy;
use crate::trace::{DiscardedComponent, PlanStep, Warning};

// =============================================================================
// Input
// =============================================================================

/// One raw line as supplied by the caller.
///
/// Net and/or gross must be present; everything else is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineInput {
    #[serde(default)]
    pub line_id: Option<String>,
    #[serde(default)]
    pub net: Option<Decimal>,
    #[serde(default)]
    pub gross: Option<Decimal>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    /// Percentage hint used to derive the missing side of net/gross.
    #[serde(default)]
    pub tax_rate: Option<Decimal>,
    #[serde(default = "default_quantity")]
    pub quantity: Decimal,
    #[serde(default)]
    pub shipping: Option<Decimal>,
    #[serde(default)]
    pub discount: Option<Decimal>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn default_quantity() -> Decimal {
    Decimal::ONE
}

/// Explicit order totals. Each present field overrides the line sum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderInput {
    #[serde(default)]
    pub net: Option<Decimal>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    #[serde(default)]
    pub gross: Option<Decimal>,
    #[serde(default)]
    pub shipping: Option<Decimal>,
    #[serde(default)]
    pub discount: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
}

/// What the calculated number represents. Carried into the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationMode {
    #[default]
    Fee,
    Commission,
    Price,
    Tax,
}

/// A fee/commission/price calculation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculationInput {
    #[serde(default)]
    pub channel_key: Option<String>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub lines: Vec<LineInput>,
    #[serde(default)]
    pub order: Option<OrderInput>,
    /// Free-form context visible to policy and component conditions.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    #[serde(default)]
    pub mode: CalculationMode,
}

// =============================================================================
// Options
// =============================================================================

/// How order-scoped amounts are spread over lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    ByNet,
    ByGross,
    ByQuantity,
    Equal,
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStrategy::ByNet => write!(f, "by_net"),
            AllocationStrategy::ByGross => write!(f, "by_gross"),
            AllocationStrategy::ByQuantity => write!(f, "by_quantity"),
            AllocationStrategy::Equal => write!(f, "equal"),
        }
    }
}

impl FromStr for AllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "by_net" | "net" => Ok(AllocationStrategy::ByNet),
            "by_gross" | "gross" => Ok(AllocationStrategy::ByGross),
            "by_quantity" | "quantity" | "qty" => Ok(AllocationStrategy::ByQuantity),
            "equal" | "even" => Ok(AllocationStrategy::Equal),
            other => Err(format!(
                "Unknown allocation strategy: '{}'. Valid options: by_net, by_gross, by_quantity, equal",
                other
            )),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Decimal places of money results.
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Overrides the policy's own `strict` flag when set.
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,
}

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

impl Default for Options {
    fn default() -> Self {
        Options {
            precision: DEFAULT_PRECISION,
            strict: None,
            allocation_strategy: AllocationStrategy::default(),
        }
    }
}

impl Options {
    /// Lenient options at the default precision.
    pub fn lenient() -> Self {
        Options {
            strict: Some(false),
            ..Options::default()
        }
    }

    /// Strict options at the default precision.
    pub fn strict() -> Self {
        Options {
            strict: Some(true),
            ..Options::default()
        }
    }

    /// Options, then policy, then lenient.
    pub fn effective_strict(&self, policy: &Policy) -> bool {
        self.strict.or(policy.strict).unwrap_or(false)
    }
}

// =============================================================================
// Result
// =============================================================================

/// Identity of the policy a result was computed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRef {
    pub policy_key: String,
    pub version: u32,
    pub channel_key: String,
}

/// A successful calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationResult {
    /// UUID v5 of the signature; identical runs share an id.
    pub calculation_id: Uuid,
    pub total: Decimal,
    pub currency: String,
    pub mode: CalculationMode,
    pub precision: u32,
    pub strict: bool,
    pub policy: PolicyRef,
    pub breakdown: Vec<ComponentResult>,
    pub discarded: Vec<DiscardedComponent>,
    pub allocation: Vec<LineAllocation>,
    pub explain_plan: Vec<PlanStep>,
    pub reconciliation: Reconciliation,
    pub warnings: Vec<Warning>,
    pub policy_hash: PolicyHashes,
    pub signature: String,
}

/// Failure body of the response envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error_type: ErrorType,
    pub error_code: String,
    pub error_message: String,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        ErrorBody {
            error_type: err.error_type(),
            error_code: err.error_code().to_string(),
            error_message: err.to_string(),
        }
    }
}

/// Success flag plus either the result or the error body, flattened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response<T> {
    pub success: bool,
    #[serde(flatten)]
    pub result: Option<T>,
    #[serde(flatten)]
    pub error: Option<ErrorBody>,
}

impl<T> Response<T> {
    pub fn from_result(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(value) => Response {
                success: true,
                result: Some(value),
                error: None,
            },
            Err(err) => Response {
                success: false,
                result: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }
}

/// Envelope of [`crate::engine::calculate`].
pub type CalculationResponse = Response<CalculationResult>;

// =============================================================================
// Unit Tests
// =============================================================================
