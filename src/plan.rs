//! Plan data model
//!
//! A [`Plan`] is the ordered list of tool calls produced by the planner.
//! It is parsed once at the boundary (see [`crate::validator`]) and handed,
//! read-only, to exactly one executor run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::registry::Price;

/// Fully qualified tool name, e.g. `wallet.get_wallet_info`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolRef {
    pub namespace: String,
    pub name: String,
}

impl ToolRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ToolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// One planned tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub tool_namespace: String,
    pub tool_name: String,
    pub params: Map<String, Value>,
    pub reason: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub depends_on: Vec<usize>,
}

impl Step {
    pub fn tool(&self) -> ToolRef {
        ToolRef::new(&self.tool_namespace, &self.tool_name)
    }
}

/// Planner output contract
///
/// Only `intent` and `steps` are required. Model output often omits
/// `totalCost`, `reasoning` and `expectedOutcome`, so they default to empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub intent: String,
    pub steps: Vec<Step>,
    /// The planner's own estimate. Informational only; billing uses the registry.
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_cost: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reasoning: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub expected_outcome: String,
}

/// Planner output sometimes carries explicit nulls for optional fields
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Per-run scratch state. Owned by a single executor run and dropped with it.
#[derive(Debug)]
pub struct ExecutionContext {
    results: BTreeMap<usize, Value>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            results: BTreeMap::new(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Store the result of step `index`. Returns `false` and leaves the
    /// existing value untouched if the step already has a result.
    pub fn record(&mut self, index: usize, result: Value) -> bool {
        if self.results.contains_key(&index) {
            return false;
        }
        self.results.insert(index, result);
        true
    }

    pub fn result(&self, index: usize) -> Option<&Value> {
        self.results.get(&index)
    }

    pub fn has_result(&self, index: usize) -> bool {
        self.results.contains_key(&index)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: usize,
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Registry price charged for this step (USD). Zero on failure.
    pub cost: f64,
}

impl StepRecord {
    pub fn succeeded(step: usize, tool: &ToolRef, result: Value, price: Price) -> Self {
        Self {
            step,
            tool: tool.to_string(),
            success: true,
            result: Some(result),
            error: None,
            cost: price.as_usd(),
        }
    }

    pub fn failed(step: usize, tool: &ToolRef, error: impl Into<String>) -> Self {
        Self {
            step,
            tool: tool.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
            cost: 0.0,
        }
    }
}

/// Aggregate result of one executor run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub run_id: String,
    pub success: bool,
    pub results: Vec<StepRecord>,
    pub total_cost: f64,
    /// Wall-clock milliseconds
    pub execution_time: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}
