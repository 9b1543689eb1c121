//! # tally-core: Pure Calculation Engine for Tally
//!
//! This crate is the **heart** of Tally. It turns a versioned policy and a
//! set of line amounts into an explainable, signed fee breakdown, and runs
//! payroll-style formula graphs. Everything here is a pure function.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    tally-cli (apps/tally-cli)                   │   │
//! │  │    config ──► read JSON files ──► call engine ──► print JSON    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  amount   │  │ resolver  │  │ evaluator │  │allocation │  │   │
//! │  │   │  lines,   │  │  policy,  │  │ rate/tier │  │  weights, │  │   │
//! │  │   │  order    │  │ overrides │  │ fixed/cap │  │   drift   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  formula  │  │ canonical │  │ condition │  │  decimal  │  │   │
//! │  │   │  payroll  │  │  hashes,  │  │   rules   │  │  HALF_UP  │  │   │
//! │  │   │   graph   │  │ signature │  │           │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO CLOCK • NO GLOBAL STATE • PURE FUNCTIONS         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Policy/formula storage and result persistence live outside.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - Entry points (`calculate`, `run_payroll`, envelopes)
//! - [`types`] - Input, options and result types
//! - [`policy`] - Policy and component model
//! - [`amount`] - Line and order normalization
//! - [`resolver`] - Policy selection and component eligibility
//! - [`evaluator`] - Component amounts and base expressions
//! - [`allocation`] - Order-to-line allocation and reconciliation
//! - [`formula`] - Payroll concept graphs
//! - [`canonical`] - Canonical hashing and signatures
//! - [`condition`] - Rule matching
//! - [`tier`] - Bracket mathematics
//! - [`decimal`] - Exact decimal helpers
//! - [`trace`] - Explain plan, warnings, discards
//! - [`validation`] - Structural checks
//! - [`error`] - Domain error types
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: same input, same output, same signature
//! 2. **No I/O**: file system, network and clock access is FORBIDDEN here
//! 3. **Exact Decimals**: `rust_decimal` everywhere, HALF_UP at the edges
//! 4. **Explicit Errors**: every failure has a type and a stable code
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::{calculate, CalculationInput, Options, Policy};
//!
//! let input: CalculationInput = serde_json::from_value(json!({
//!     "currency": "EUR",
//!     "lines": [{"net": 1500}]
//! })).unwrap();
//! let policy: Policy = serde_json::from_value(json!({
//!     "policy_key": "volume", "channel_key": "web", "version": 1,
//!     "effective_from": "2024-01-01",
//!     "components": [{
//!         "id": "tiered", "type": "tier", "mode": "marginal",
//!         "brackets": [{"from": 0, "to": 1000, "rate": 0}, {"from": 1000, "rate": 10}]
//!     }]
//! })).unwrap();
//!
//! let result = calculate(&input, &[policy], &Options::default()).unwrap();
//! assert_eq!(result.total.to_string(), "50.00");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod allocation;
pub mod amount;
pub mod canonical;
pub mod condition;
pub mod decimal;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod formula;
pub mod policy;
pub mod resolver;
pub mod tier;
pub mod trace;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use tally_core::calculate` instead of
// `use tally_core::engine::calculate`

pub use engine::{calculate, calculate_response, payroll_response, run_payroll, PayrollResponse};
pub use error::{CoreError, CoreResult, ErrorType, ValidationError};
pub use formula::{PayrollInput, PayrollResult};
pub use policy::{Component, ComponentKind, Policy};
pub use types::*;
