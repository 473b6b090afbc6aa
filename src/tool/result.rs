// ABOUTME: Defines the ToolOutput type - what a tool backend hands back for
// ABOUTME: one call: an output value, error state, and metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Output of a single tool backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The output value.
    pub output: serde_json::Value,

    /// Whether this output represents an error reported by the tool.
    pub is_error: bool,

    /// Error message when `is_error` is set.
    pub error: Option<String>,

    /// Optional metadata about the execution.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolOutput {
    /// Create a successful output from any JSON value.
    pub fn value(output: serde_json::Value) -> Self {
        Self {
            output,
            is_error: false,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a successful text output.
    pub fn text(content: impl Into<String>) -> Self {
        Self::value(serde_json::Value::String(content.into()))
    }

    /// Create an error output.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: serde_json::Value::Null,
            is_error: true,
            error: Some(message.into()),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the output.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    /// Returns true when the tool reported success.
    pub fn success(&self) -> bool {
        !self.is_error
    }
}

impl Default for ToolOutput {
    fn default() -> Self {
        Self::value(serde_json::Value::Null)
    }
}
