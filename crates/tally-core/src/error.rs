//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Engine failures (policy, calculation, strict)  │
//! │  └── ValidationError  - Structural input failures                      │
//! │                                                                         │
//! │  Every error maps to:                                                  │
//! │  ├── ErrorType   input | policy | calculation | strict                 │
//! │  └── error_code  fixed SCREAMING_SNAKE_CASE vocabulary                 │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → ErrorBody → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Families
//! - **Structural** errors (missing input, no policy, bad cap bounds, cycles)
//!   are fatal in every mode.
//! - **Strict** errors only exist in strict mode. Lenient mode turns the same
//!   situations into warnings and a safe default.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// Category reported in the failure envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The calculation input is structurally invalid.
    Input,
    /// The policy (or formula set) is misconfigured.
    Policy,
    /// Arithmetic or serialization failed.
    Calculation,
    /// A data edge case that strict mode refuses to default.
    Strict,
}

// =============================================================================
// Core Error
// =============================================================================

/// Engine errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// More than one candidate policy was supplied without a channel key.
    #[error("channel_key is required when more than one policy is supplied")]
    MissingChannelKey,

    /// No candidate survived channel, date and condition filtering.
    ///
    /// ## When This Occurs
    /// - Empty candidate list
    /// - Channel key matches no policy
    /// - Every matching policy is outside its effective window
    /// - Policy-level conditions reject the context
    #[error("No policy matches channel '{channel_key}' as of {as_of}")]
    NoMatchingPolicy { channel_key: String, as_of: String },

    /// Two components in one policy share an id.
    #[error("Component id '{0}' is declared more than once")]
    DuplicateComponentId(String),

    /// A cap declares a floor above its ceiling.
    #[error("Cap {component_id} has min {min} greater than max {max}")]
    CapInvalidBounds {
        component_id: String,
        min: Decimal,
        max: Decimal,
    },

    /// The formula graph contains a cycle.
    #[error("Circular dependency entering formula {entry}: {}", path.join(" -> "))]
    CircularDependency { entry: String, path: Vec<String> },

    /// Two formulas write the same concept.
    #[error("Concept {target} is produced by both {first} and {second}")]
    DuplicateTarget {
        target: String,
        first: String,
        second: String,
    },

    /// No tier bracket contains the tiering key (strict mode).
    #[error("No tier bracket of {component_id} matches {key}")]
    TierNotFound {
        component_id: String,
        line_id: Option<String>,
        key: Decimal,
    },

    /// A strict division hit a zero divisor.
    #[error("Division by zero in {context}")]
    DivisionByZero { context: String },

    /// A result does not fit in a 96-bit decimal.
    ///
    /// ## When This Occurs
    /// - A base expression multiplies large amounts
    /// - A sum of component amounts exceeds roughly 7.9 × 10^28
    ///
    /// Lenient mode records an `ARITHMETIC_OVERFLOW` warning and uses zero.
    #[error("Arithmetic overflow in {context}")]
    ArithmeticOverflow { context: String },

    /// A base expression referenced a field that does not exist (strict mode).
    #[error("Field '{field}' is missing in {context}")]
    FieldMissing { field: String, context: String },

    /// A base expression used an operator the engine does not know (strict mode).
    #[error("Unknown base expression operator in component {component_id}")]
    UnknownBaseOp { component_id: String },

    /// A cap's target filter matched nothing (strict mode).
    #[error("Cap {component_id} targets matched no prior component")]
    CapTargetNoMatch { component_id: String },

    /// A line selector was declared on an order-scoped component (strict mode).
    #[error("Line selector is not allowed on order-scoped component {component_id}")]
    InvalidLineSelector { component_id: String },

    /// `require_match` selector matched zero lines (strict mode).
    #[error("Line selector of {component_id} requires a match but matched no lines")]
    LineSelectorNoMatch { component_id: String },

    /// A formula read a concept that was never set (strict mode).
    #[error("Concept {code} is not set")]
    ConceptMissing { code: String },

    /// A single formula failed while strict mode was on.
    #[error("Formula {code} failed: {source}")]
    FormulaFailed {
        code: String,
        #[source]
        source: Box<CoreError>,
    },

    /// Canonical serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// True for [`CoreError::ArithmeticOverflow`].
    pub fn is_overflow(&self) -> bool {
        matches!(self, CoreError::ArithmeticOverflow { .. })
    }

    /// Category of this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            CoreError::MissingChannelKey | CoreError::Validation(_) => ErrorType::Input,
            CoreError::NoMatchingPolicy { .. }
            | CoreError::DuplicateComponentId(_)
            | CoreError::CapInvalidBounds { .. }
            | CoreError::CircularDependency { .. }
            | CoreError::DuplicateTarget { .. } => ErrorType::Policy,
            CoreError::Serialization(_) | CoreError::ArithmeticOverflow { .. } => {
                ErrorType::Calculation
            }
            CoreError::TierNotFound { .. }
            | CoreError::DivisionByZero { .. }
            | CoreError::FieldMissing { .. }
            | CoreError::UnknownBaseOp { .. }
            | CoreError::CapTargetNoMatch { .. }
            | CoreError::InvalidLineSelector { .. }
            | CoreError::LineSelectorNoMatch { .. }
            | CoreError::ConceptMissing { .. }
            | CoreError::FormulaFailed { .. } => ErrorType::Strict,
        }
    }

    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::MissingChannelKey => "MISSING_CHANNEL_KEY",
            CoreError::NoMatchingPolicy { .. } => "NO_MATCHING_POLICY",
            CoreError::DuplicateComponentId(_) => "DUPLICATE_COMPONENT_ID",
            CoreError::CapInvalidBounds { .. } => "CAP_INVALID_BOUNDS",
            CoreError::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            CoreError::DuplicateTarget { .. } => "DUPLICATE_TARGET",
            CoreError::TierNotFound { .. } => "TIER_NOT_FOUND",
            CoreError::DivisionByZero { .. } => "DIVISION_BY_ZERO",
            CoreError::ArithmeticOverflow { .. } => "ARITHMETIC_OVERFLOW",
            CoreError::FieldMissing { .. } => "FIELD_MISSING",
            CoreError::UnknownBaseOp { .. } => "UNKNOWN_BASE_OP",
            CoreError::CapTargetNoMatch { .. } => "CAP_TARGET_NO_MATCH",
            CoreError::InvalidLineSelector { .. } => "INVALID_LINE_SELECTOR",
            CoreError::LineSelectorNoMatch { .. } => "LINE_SELECTOR_NO_MATCH",
            CoreError::ConceptMissing { .. } => "CONCEPT_MISSING",
            CoreError::FormulaFailed { .. } => "FORMULA_FAILED",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Validation(v) => v.error_code(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Structural input errors.
///
/// These are checked before any policy work starts and are fatal in
/// every mode.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// `currency` is absent or blank.
    #[error("currency is required")]
    MissingCurrency,

    /// The input has no lines at all.
    #[error("at least one line is required")]
    EmptyLines,

    /// A line gave neither net nor gross.
    #[error("line {line_id} must provide net or gross")]
    MissingAmount { line_id: String },

    /// A line quantity is negative.
    #[error("line {line_id} has negative quantity {quantity}")]
    NegativeQuantity { line_id: String, quantity: Decimal },

    /// Requested precision is outside the supported range.
    #[error("precision must be between 0 and {max}, got {precision}")]
    PrecisionOutOfRange { precision: u32, max: u32 },

    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g., invalid date window).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ValidationError::MissingCurrency => "MISSING_CURRENCY",
            ValidationError::EmptyLines => "EMPTY_LINES",
            ValidationError::MissingAmount { .. } => "MISSING_AMOUNT",
            ValidationError::NegativeQuantity { .. } => "INVALID_QUANTITY",
            ValidationError::PrecisionOutOfRange { .. } => "INVALID_PRECISION",
            ValidationError::Required { .. } | ValidationError::InvalidFormat { .. } => {
                "VALIDATION_ERROR"
            }
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
