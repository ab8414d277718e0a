//! Text-to-plan collaborator
//!
//! The planner only drafts a plan. Its output is untrusted and always goes
//! through [`crate::validator::PlanValidator`] before anything runs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::llm::{LlmClient, LlmError};
use crate::tools::registry::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner is not configured")]
    NotConfigured,
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("planner returned invalid plan JSON: {0}")]
    InvalidOutput(String),
}

/// Turns a natural-language request into raw plan JSON
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, query: &str) -> Result<Value, PlannerError>;
}

const SYSTEM_PROMPT: &str = "You plan tool calls for a crypto wallet assistant. \
Reply with a single JSON object and nothing else, shaped as \
{\"intent\": string, \"steps\": [{\"toolNamespace\": string, \"toolName\": string, \
\"params\": object, \"reason\": string, \"dependsOn\": [earlier step indexes]}], \
\"totalCost\": number, \"reasoning\": string, \"expectedOutcome\": string}. \
Use only the tools listed by the user. A step may depend only on earlier steps.";

pub struct LlmPlanner {
    client: LlmClient,
    registry: Arc<ToolRegistry>,
    max_tokens: u32,
}

impl LlmPlanner {
    pub fn new(client: LlmClient, registry: Arc<ToolRegistry>, max_tokens: u32) -> Self {
        Self {
            client,
            registry,
            max_tokens,
        }
    }

    fn prompt(&self, query: &str) -> String {
        let mut prompt = String::from("Available tools (price in USD):\n");
        for spec in self.registry.list() {
            prompt.push_str(&format!(
                "- {}.{} ({}): {}\n",
                spec.namespace, spec.name, spec.price, spec.description
            ));
        }
        prompt.push_str("\nRequest: ");
        prompt.push_str(query);
        prompt
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, query: &str) -> Result<Value, PlannerError> {
        let response = self
            .client
            .complete(&self.prompt(query), Some(SYSTEM_PROMPT), self.max_tokens)
            .await?;

        let plan = extract_json(&response.content).map_err(|e| {
            warn!(error = %e, "planner output was not JSON");
            e
        })?;

        let plan_steps = plan
            .get("steps")
            .and_then(|steps| steps.as_array())
            .map_or(0, |steps| steps.len());
        info!(model = %response.model, plan_steps, "plan drafted");
        Ok(plan)
    }
}

/// Pull the JSON object out of model output, tolerating a markdown fence
/// or chatter around it.
pub fn extract_json(text: &str) -> Result<Value, PlannerError> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&body[start..=end])
            .map_err(|e| PlannerError::InvalidOutput(e.to_string())),
        _ => Err(PlannerError::InvalidOutput(
            "no JSON object in planner output".to_string(),
        )),
    }
}
