// ABOUTME: Implements the Registry - a thread-safe container of tools that
// ABOUTME: doubles as the ToolBackend the execution runner dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DEFAULT_CATEGORY, Parameters, Tool, ToolBackend, ToolOutput};
use crate::error::ToolError;

/// Description of a registered tool, for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub schema: serde_json::Value,
}

/// A thread-safe registry of tools.
#[derive(Default)]
pub struct Registry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    pub async fn register<T: Tool + 'static>(&self, tool: T) {
        self.register_arc(Arc::new(tool)).await;
    }

    /// Register a tool from an Arc.
    pub async fn register_arc(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub async fn unregister(&self, name: &str) {
        let mut tools = self.tools.write().await;
        tools.remove(name);
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// List all tool names, sorted alphabetically.
    pub async fn list(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<_> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools.
    pub async fn count(&self) -> usize {
        let tools = self.tools.read().await;
        tools.len()
    }

    /// Describe every registered tool, sorted by name.
    pub async fn describe(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut descriptors: Vec<_> = tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                category: t.category().to_string(),
                schema: t.schema(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            tools: Arc::clone(&self.tools),
        }
    }
}

#[async_trait]
impl ToolBackend for Registry {
    async fn execute_tool(
        &self,
        name: &str,
        params: &Parameters,
    ) -> Result<ToolOutput, anyhow::Error> {
        let tool = self
            .get(name)
            .await
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(params).await
    }

    async fn category_of(&self, name: &str) -> String {
        match self.get(name).await {
            Some(tool) => tool.category().to_string(),
            None => DEFAULT_CATEGORY.to_string(),
        }
    }
}
