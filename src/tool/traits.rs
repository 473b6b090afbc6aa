// ABOUTME: Defines the Tool trait and the ToolBackend capability the runner calls.
// ABOUTME: Backends resolve a tool by name, execute it, and report its rate category.

use async_trait::async_trait;

use super::ToolOutput;

/// Ordered, schema-less tool parameters.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Rate-limit category used when a tool does not declare one.
pub const DEFAULT_CATEGORY: &str = "default";

/// A single tool that can be registered with a [`super::Registry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the unique name of this tool.
    fn name(&self) -> &str;

    /// Returns a human-readable description.
    fn description(&self) -> &str;

    /// Returns the JSON Schema for the tool's input parameters.
    fn schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Rate-limit category this tool is accounted under.
    fn category(&self) -> &str {
        DEFAULT_CATEGORY
    }

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: &Parameters) -> Result<ToolOutput, anyhow::Error>;
}

/// The capability through which all tool work is performed.
///
/// This is the only external dependency of the execution core: given a tool
/// name and parameters, produce an output or fail.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Execute the named tool.
    async fn execute_tool(
        &self,
        name: &str,
        params: &Parameters,
    ) -> Result<ToolOutput, anyhow::Error>;

    /// Rate-limit category for the named tool.
    async fn category_of(&self, _name: &str) -> String {
        DEFAULT_CATEGORY.to_string()
    }
}
