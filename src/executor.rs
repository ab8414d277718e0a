//! Plan executor
//!
//! Runs a validated plan's steps one at a time, in declared order. `dependsOn`
//! is a precondition, not a scheduling hint: a step whose dependency has no
//! result aborts the run. The first failing tool call ends the run; steps after
//! it are never attempted or recorded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::plan::{ExecutionContext, ExecutionResult, Plan, Step, StepRecord};
use crate::tools::registry::{Price, ToolRegistry};
use crate::tools::ToolInvoker;

/// Advisory time per dependency level, used only for estimates
pub const ESTIMATED_SECONDS_PER_LEVEL: u64 = 3;

/// Params filled from the first dependency's result when a step omits them
pub const AUTO_POPULATED_FIELDS: &[&str] = &["address", "chain"];

/// Key under which dependency results are attached to a step's params
pub const PREVIOUS_RESULTS_KEY: &str = "_previousResults";

/// Nested objects searched (after the top level) for auto-populated fields
const NESTED_RESULT_KEYS: &[&str] = &["wallet", "data"];

/// Precondition violations. Tool failures are not errors; they are reported
/// inside [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("step {step} depends on step {missing}, which has no result")]
    DependencyUnsatisfied { step: usize, missing: usize },
}

pub struct PlanExecutor {
    invoker: Arc<dyn ToolInvoker>,
    registry: Arc<ToolRegistry>,
}

impl PlanExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>, registry: Arc<ToolRegistry>) -> Self {
        Self { invoker, registry }
    }

    /// Execute every step of `plan` in order, stopping at the first failure.
    pub async fn execute(&self, plan: &Plan) -> Result<ExecutionResult, ExecutionError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut ctx = ExecutionContext::new();
        let mut records = Vec::with_capacity(plan.steps.len());
        let mut total = Price::ZERO;
        let mut errors = None;

        info!(run_id = %run_id, intent = %plan.intent, plan_steps = plan.steps.len(), "executing plan");

        for (index, step) in plan.steps.iter().enumerate() {
            if let Some(&missing) = step.depends_on.iter().find(|&&dep| !ctx.has_result(dep)) {
                warn!(run_id = %run_id, step = index, missing, "dependency unsatisfied, aborting run");
                return Err(ExecutionError::DependencyUnsatisfied {
                    step: index,
                    missing,
                });
            }

            let tool = step.tool();
            let Some(price) = self.registry.price_of(&tool) else {
                let message = format!("unknown tool: {}", tool);
                warn!(run_id = %run_id, step = index, tool = %tool, "step references unregistered tool");
                errors = Some(vec![failure_summary(index, &tool.to_string(), &message)]);
                records.push(StepRecord::failed(index, &tool, message));
                break;
            };

            let params = enrich_params(step, &ctx);
            info!(run_id = %run_id, step = index, tool = %tool, "invoking step");

            match self.invoker.invoke(&tool, &params).await {
                Ok(result) => {
                    ctx.record(index, result.clone());
                    total = total.saturating_add(price);
                    records.push(StepRecord::succeeded(index, &tool, result, price));
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(run_id = %run_id, step = index, tool = %tool, error = %message, "step failed, halting plan");
                    errors = Some(vec![failure_summary(index, &tool.to_string(), &message)]);
                    records.push(StepRecord::failed(index, &tool, message));
                    break;
                }
            }
        }

        let success = records.iter().all(|r| r.success);
        let execution_time = ctx.elapsed_ms();
        info!(
            run_id = %run_id,
            success,
            steps_run = records.len(),
            total_cost = %total,
            elapsed_ms = execution_time,
            "plan execution finished"
        );

        Ok(ExecutionResult {
            run_id,
            success,
            results: records,
            total_cost: total.as_usd(),
            execution_time,
            started_at: ctx.started_at(),
            errors,
        })
    }
}

fn failure_summary(index: usize, tool: &str, message: &str) -> String {
    format!("Step {} ({}) failed: {}", index, tool, message)
}

/// Build the params actually sent for `step`.
///
/// Attaches every dependency's raw result under `_previousResults`, then fills
/// [`AUTO_POPULATED_FIELDS`] from the first dependency's result only. Values the
/// step already set are never replaced.
pub fn enrich_params(step: &Step, ctx: &ExecutionContext) -> Value {
    let mut params = step.params.clone();
    if step.depends_on.is_empty() {
        return Value::Object(params);
    }

    let previous: Vec<Value> = step
        .depends_on
        .iter()
        .filter_map(|&dep| {
            ctx.result(dep).map(|result| {
                serde_json::json!({
                    "index": dep,
                    "result": result,
                })
            })
        })
        .collect();
    params.insert(PREVIOUS_RESULTS_KEY.to_string(), Value::Array(previous));

    if let Some(first) = step.depends_on.first().and_then(|&dep| ctx.result(dep)) {
        for field in AUTO_POPULATED_FIELDS {
            if is_explicit(&params, field) {
                continue;
            }
            if let Some(value) = find_field(first, field) {
                params.insert((*field).to_string(), value.clone());
            }
        }
    }

    Value::Object(params)
}

fn is_explicit(params: &Map<String, Value>, field: &str) -> bool {
    params.get(field).is_some_and(|v| !v.is_null())
}

fn find_field<'a>(result: &'a Value, field: &str) -> Option<&'a Value> {
    let usable = |v: &&Value| !v.is_null();
    result.get(field).filter(usable).or_else(|| {
        NESTED_RESULT_KEYS
            .iter()
            .find_map(|key| result.get(*key).and_then(|nested| nested.get(field)).filter(usable))
    })
}

/// Longest dependency chain in the plan (1 for a plan with no dependencies,
/// 0 for an empty plan). Invalid indices are ignored.
pub fn dependency_depth(plan: &Plan) -> usize {
    let mut depths: Vec<usize> = Vec::with_capacity(plan.steps.len());
    for (index, step) in plan.steps.iter().enumerate() {
        let deepest = step
            .depends_on
            .iter()
            .filter(|&&dep| dep < index)
            .map(|&dep| depths[dep])
            .max()
            .unwrap_or(0);
        depths.push(deepest + 1);
    }
    depths.into_iter().max().unwrap_or(0)
}

/// Advisory wall-clock estimate assuming independent branches could overlap.
/// Execution itself is always sequential.
pub fn estimate_time(plan: &Plan) -> Duration {
    Duration::from_secs(dependency_depth(plan) as u64 * ESTIMATED_SECONDS_PER_LEVEL)
}

/// Registry cost of running every step; unknown tools add nothing.
pub fn estimate_cost(plan: &Plan, registry: &ToolRegistry) -> Price {
    plan.steps
        .iter()
        .filter_map(|step| registry.price_of(&step.tool()))
        .fold(Price::ZERO, Price::saturating_add)
}
