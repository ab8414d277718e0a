use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{ToolInvocationError, ToolInvoker};
use crate::plan::ToolRef;

/// An in-process tool implementation
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: &Value) -> Result<Value, String>;
}

/// Table of in-process tool handlers
#[derive(Default, Clone)]
pub struct LocalTools {
    handlers: HashMap<ToolRef, Arc<dyn ToolHandler>>,
}

impl LocalTools {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: ToolRef, handler: Arc<dyn ToolHandler>) {
        info!(tool = %tool, "registering local tool handler");
        self.handlers.insert(tool, handler);
    }

    pub fn handles(&self, tool: &ToolRef) -> bool {
        self.handlers.contains_key(tool)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl ToolInvoker for LocalTools {
    async fn invoke(&self, tool: &ToolRef, params: &Value) -> Result<Value, ToolInvocationError> {
        let handler = self
            .handlers
            .get(tool)
            .ok_or_else(|| ToolInvocationError::UnknownTool(tool.to_string()))?;

        handler.call(params).await.map_err(ToolInvocationError::Handler)
    }
}
