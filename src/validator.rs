//! Plan validation
//!
//! Runs against the raw JSON so that every problem can be reported in one
//! pass, including missing fields that would stop a typed deserialize at the
//! first error. Nothing is repaired.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::plan::{Plan, ToolRef};
use crate::tools::registry::ToolRegistry;

/// Result of validating a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

pub struct PlanValidator {
    registry: Arc<ToolRegistry>,
}

impl PlanValidator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Check a raw plan document. Never panics, never short-circuits.
    pub fn validate(&self, raw: &Value) -> ValidationReport {
        let mut errors = Vec::new();

        let Some(plan) = raw.as_object() else {
            return ValidationReport::from_errors(vec!["plan must be a JSON object".to_string()]);
        };

        match plan.get("intent") {
            Some(Value::String(_)) => {}
            Some(_) => errors.push("plan.intent must be a string".to_string()),
            None => errors.push("plan.intent is required".to_string()),
        }

        for field in ["reasoning", "expectedOutcome"] {
            if let Some(value) = plan.get(field) {
                if !value.is_string() && !value.is_null() {
                    errors.push(format!("plan.{} must be a string", field));
                }
            }
        }

        if let Some(cost) = plan.get("totalCost") {
            if !cost.is_number() && !cost.is_null() {
                errors.push("plan.totalCost must be a number".to_string());
            }
        }

        match plan.get("steps") {
            Some(Value::Array(steps)) => {
                for (index, step) in steps.iter().enumerate() {
                    self.check_step(index, step, &mut errors);
                }
            }
            Some(_) => errors.push("plan.steps must be an array".to_string()),
            None => errors.push("plan.steps is required".to_string()),
        }

        if !errors.is_empty() {
            debug!(errors = errors.len(), "plan failed validation");
        }
        ValidationReport::from_errors(errors)
    }

    /// Validate and, if clean, deserialize into a typed [`Plan`].
    pub fn parse(&self, raw: &Value) -> Result<Plan, ValidationReport> {
        let report = self.validate(raw);
        if !report.valid {
            return Err(report);
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| ValidationReport::from_errors(vec![format!("plan is malformed: {}", e)]))
    }

    fn check_step(&self, index: usize, step: &Value, errors: &mut Vec<String>) {
        let Some(step) = step.as_object() else {
            errors.push(format!("step {}: must be a JSON object", index));
            return;
        };

        let namespace = required_string(index, step.get("toolNamespace"), "toolNamespace", errors);
        let name = required_string(index, step.get("toolName"), "toolName", errors);
        required_string(index, step.get("reason"), "reason", errors);

        match step.get("params") {
            Some(Value::Object(_)) => {}
            Some(_) => errors.push(format!("step {}: params must be an object", index)),
            None => errors.push(format!("step {}: params is required", index)),
        }

        if let (Some(namespace), Some(name)) = (namespace, name) {
            let tool = ToolRef::new(namespace, name);
            if !self.registry.contains(&tool) {
                errors.push(format!("step {}: unknown tool {}", index, tool));
            }
        }

        match step.get("dependsOn") {
            None | Some(Value::Null) => {}
            Some(Value::Array(deps)) => {
                for dep in deps {
                    match dep.as_u64() {
                        Some(dep) if (dep as usize) < index => {}
                        Some(dep) => errors.push(format!(
                            "step {}: dependsOn index {} must refer to an earlier step",
                            index, dep
                        )),
                        None => errors.push(format!(
                            "step {}: dependsOn entries must be non-negative integers, got {}",
                            index, dep
                        )),
                    }
                }
            }
            Some(_) => errors.push(format!("step {}: dependsOn must be an array", index)),
        }
    }
}

fn required_string<'a>(
    index: usize,
    value: Option<&'a Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<&'a str> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
        Some(Value::String(_)) => {
            errors.push(format!("step {}: {} must not be empty", index, field));
            None
        }
        Some(_) => {
            errors.push(format!("step {}: {} must be a string", index, field));
            None
        }
        None => {
            errors.push(format!("step {}: {} is required", index, field));
            None
        }
    }
}
