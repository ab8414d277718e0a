use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{ToolInvocationError, ToolInvoker};
use crate::plan::ToolRef;

/// Longest slice of a raw error body kept in an error message
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorField>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Text(String),
    Detail { message: Option<String> },
}

/// Calls tools on a remote tool service: `POST {base_url}/tools/{namespace}/{name}`
/// with the params as the JSON body.
pub struct HttpToolInvoker {
    client: Client,
    base_url: String,
}

impl HttpToolInvoker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ToolInvocationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolInvocationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, tool: &ToolRef) -> String {
        format!("{}/tools/{}/{}", self.base_url, tool.namespace, tool.name)
    }
}

/// Pull a readable message out of a non-success body, falling back to the
/// truncated raw text.
fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        let structured = match parsed.error {
            Some(ErrorField::Text(text)) => Some(text),
            Some(ErrorField::Detail { message }) => message,
            None => None,
        }
        .or(parsed.message);

        if let Some(msg) = structured {
            return msg;
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    if trimmed.chars().count() > MAX_ERROR_BODY_CHARS {
        let head: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    async fn invoke(&self, tool: &ToolRef, params: &Value) -> Result<Value, ToolInvocationError> {
        let url = self.endpoint(tool);
        info!(tool = %tool, url = %url, "invoking tool over HTTP");

        let response = self
            .client
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(|e| ToolInvocationError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolInvocationError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = error_message(&body);
            warn!(tool = %tool, status = status.as_u16(), error = %message, "tool call failed");
            return Err(ToolInvocationError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| ToolInvocationError::Malformed(e.to_string()))
    }
}
