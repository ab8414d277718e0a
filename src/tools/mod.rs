//! Tool invocation adapter
//!
//! The executor only sees [`ToolInvoker`]: give it a tool and params, get a
//! JSON result or a [`ToolInvocationError`]. Transports:
//! - [`local::LocalTools`]: in-process handlers (preferred)
//! - [`http::HttpToolInvoker`]: HTTP tool service (fallback)
//!
//! [`FallbackInvoker`] combines the two.

pub mod http;
pub mod local;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::plan::ToolRef;

/// Errors surfaced by a tool call. The `Display` text is what the executor
/// records verbatim in the failing step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool service request failed: {0}")]
    Transport(String),
    #[error("tool service returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed tool response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Handler(String),
}

/// Uniform "invoke named tool with params" capability
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &ToolRef, params: &Value) -> Result<Value, ToolInvocationError>;
}

/// Prefers the in-process transport and falls back to HTTP for tools that
/// have no local handler.
pub struct FallbackInvoker {
    local: local::LocalTools,
    remote: Option<Arc<dyn ToolInvoker>>,
}

impl FallbackInvoker {
    pub fn new(local: local::LocalTools) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// Set the fallback transport (for dependency injection / testing)
    pub fn with_remote(mut self, remote: Arc<dyn ToolInvoker>) -> Self {
        self.remote = Some(remote);
        self
    }
}

#[async_trait]
impl ToolInvoker for FallbackInvoker {
    async fn invoke(&self, tool: &ToolRef, params: &Value) -> Result<Value, ToolInvocationError> {
        if self.local.handles(tool) {
            return self.local.invoke(tool, params).await;
        }

        match &self.remote {
            Some(remote) => {
                debug!(tool = %tool, "no local handler, using HTTP transport");
                remote.invoke(tool, params).await
            }
            None => Err(ToolInvocationError::UnknownTool(tool.to_string())),
        }
    }
}
