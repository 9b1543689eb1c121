//! # Command Handlers
//!
//! Reads JSON documents, calls the engine and hands back the response
//! value. I/O failures are `anyhow` errors; engine failures are envelopes.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tally_core::canonical;
use tally_core::{
    calculate_response, payroll_response, AllocationStrategy, CalculationInput, Options,
    PayrollInput, Policy,
};
use tracing::{debug, info};

/// Serialized response plus whether it reports success.
#[derive(Debug)]
pub struct Outcome {
    pub success: bool,
    pub body: Value,
}

/// Flag overrides layered on top of the configured options.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptionOverrides {
    pub precision: Option<u32>,
    pub strict: Option<bool>,
    pub strategy: Option<AllocationStrategy>,
}

impl OptionOverrides {
    pub fn apply(self, mut options: Options) -> Options {
        if let Some(precision) = self.precision {
            options.precision = precision;
        }
        if let Some(strict) = self.strict {
            options.strict = Some(strict);
        }
        if let Some(strategy) = self.strategy {
            options.allocation_strategy = strategy;
        }
        options
    }
}

// =============================================================================
// Commands
// =============================================================================

pub fn calculate(input: &Path, policies: &Path, options: &Options) -> Result<Outcome> {
    let request: CalculationInput = read_json(input)?;
    let policies = parse_policies(&read_text(policies)?)
        .with_context(|| format!("Invalid policies in {}", policies.display()))?;
    info!(
        lines = request.lines.len(),
        candidates = policies.len(),
        "Running calculation"
    );

    let response = calculate_response(&request, &policies, options);
    Ok(Outcome {
        success: response.success,
        body: serde_json::to_value(&response)?,
    })
}

pub fn payroll(input: &Path, options: &Options) -> Result<Outcome> {
    let request: PayrollInput = read_json(input)?;
    info!(formulas = request.formulas.len(), "Running payroll");

    let response = payroll_response(&request, options);
    Ok(Outcome {
        success: response.success,
        body: serde_json::to_value(&response)?,
    })
}

pub fn hash(policy: &Path) -> Result<Outcome> {
    let policy: Policy = read_json(policy)?;
    let hashes = canonical::policy_hashes(&policy)?;
    Ok(Outcome {
        success: true,
        body: serde_json::to_value(&hashes)?,
    })
}

// =============================================================================
// Input Helpers
// =============================================================================

/// Accepts a single policy object or an array of policies.
pub fn parse_policies(text: &str) -> Result<Vec<Policy>> {
    let value: Value = serde_json::from_str(text)?;
    let policies: Vec<Policy> = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(_) => vec![serde_json::from_value(value)?],
        other => bail!("expected a policy object or an array, found {}", kind(&other)),
    };
    debug!(count = policies.len(), "Policies parsed");
    Ok(policies)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = read_text(path)?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// Reads a file, or stdin when the path is `-`.
fn read_text(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"{
        "policy_key": "p", "channel_key": "web", "version": 1,
        "effective_from": "2024-01-01",
        "components": [{"id": "fee", "type": "rate", "rate": 1}]
    }"#;

    #[test]
    fn test_parse_single_policy() {
        let policies = parse_policies(POLICY).unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].policy_key, "p");
    }

    #[test]
    fn test_parse_policy_array() {
        let text = format!("[{}, {}]", POLICY, POLICY.replace("\"web\"", "\"retail\""));
        let policies = parse_policies(&text).unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[1].channel_key, "retail");
    }

    #[test]
    fn test_parse_policies_rejects_scalars() {
        let err = parse_policies("42").unwrap_err();
        assert!(err.to_string().contains("a number"));
        assert!(parse_policies("not json").is_err());
    }

    #[test]
    fn test_overrides_win_over_config() {
        let overrides = OptionOverrides {
            precision: Some(4),
            strict: Some(true),
            strategy: None,
        };
        let options = overrides.apply(Options::default());
        assert_eq!(options.precision, 4);
        assert_eq!(options.strict, Some(true));
        assert_eq!(options.allocation_strategy, AllocationStrategy::ByNet);

        let untouched = OptionOverrides::default().apply(Options::lenient());
        assert_eq!(untouched, Options::lenient());
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = hash(Path::new("/nonexistent/tally/policy.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
