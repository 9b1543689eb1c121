//! # Trace
//!
//! Collects the explain plan, warnings and discarded components of one run.
//!
//! A [`Trace`] is created per call and threaded by `&mut` through the
//! pipeline. Warnings are mirrored to `tracing::warn!` as they are raised.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::policy::ComponentType;

/// One step of the explain plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub step: String,
    pub detail: Value,
}

/// A degraded-but-successful situation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
}

/// A component that did not participate, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscardedComponent {
    pub component_id: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub reason: String,
}

/// Accumulator for plan steps, warnings and discards.
#[derive(Debug, Default)]
pub struct Trace {
    steps: Vec<PlanStep>,
    warnings: Vec<Warning>,
    discarded: Vec<DiscardedComponent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&mut self, step: &str, detail: Value) {
        debug!(step, "Plan step");
        self.steps.push(PlanStep {
            step: step.to_string(),
            detail,
        });
    }

    pub fn warn(&mut self, code: &str, message: impl Into<String>) {
        self.push_warning(code, message.into(), None);
    }

    pub fn warn_component(&mut self, code: &str, component_id: &str, message: impl Into<String>) {
        self.push_warning(code, message.into(), Some(component_id.to_string()));
    }

    fn push_warning(&mut self, code: &str, message: String, component_id: Option<String>) {
        warn!(code, component_id = component_id.as_deref(), "{}", message);
        self.warnings.push(Warning {
            code: code.to_string(),
            message,
            component_id,
        });
    }

    pub fn discard(&mut self, component_id: &str, component_type: ComponentType, reason: &str) {
        debug!(component_id, reason, "Component discarded");
        self.discarded.push(DiscardedComponent {
            component_id: component_id.to_string(),
            component_type,
            reason: reason.to_string(),
        });
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn discarded(&self) -> &[DiscardedComponent] {
        &self.discarded
    }

    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    /// Consumes the trace into `(steps, warnings, discarded)`.
    pub fn finish(self) -> (Vec<PlanStep>, Vec<Warning>, Vec<DiscardedComponent>) {
        (self.steps, self.warnings, self.discarded)
    }
}
