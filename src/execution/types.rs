// ABOUTME: Core data model for tool execution: requests, results, strategies,
// ABOUTME: call context, priority, and the forward-only execution status machine.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GovernorError;
use crate::tool::{Parameters, ToolOutput};

/// Default per-call deadline in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;

/// Default retry ceiling exposed to callers.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Scheduling priority. Lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
}

impl Default for Priority {
    fn default() -> Self {
        Priority(1)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single tool invocation requested by an agent role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Name of the tool to invoke.
    pub tool_name: String,

    /// Tool parameters, in caller order.
    #[serde(default)]
    pub parameters: Parameters,

    #[serde(default)]
    pub priority: Priority,

    /// Tools this call declares it depends on. Only presence is inspected.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Per-call deadline.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,

    /// Attempts already made by the caller.
    #[serde(default)]
    pub retry_count: u32,

    /// Retry ceiling; exposed to the caller, never acted on here.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_seconds() -> f64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl ToolCallRequest {
    /// Create a request for the named tool with default settings.
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters: Parameters::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Add one parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.parameters.insert(key.into(), v);
        }
        self
    }

    /// Replace all parameters.
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Declare a dependency on another tool.
    pub fn depends_on(mut self, tool_name: impl Into<String>) -> Self {
        self.dependencies.push(tool_name.into());
        self
    }

    /// Set the per-call deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Returns true if the request declares any dependency.
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// The per-call deadline, or an error if it is not a positive finite duration.
    pub fn deadline(&self) -> Result<Duration, GovernorError> {
        if self.timeout_seconds.is_nan() || self.timeout_seconds <= 0.0 {
            return Err(GovernorError::Validation(format!(
                "tool '{}' has non-positive timeout {}",
                self.tool_name, self.timeout_seconds
            )));
        }
        Duration::try_from_secs_f64(self.timeout_seconds).map_err(|e| {
            GovernorError::Validation(format!(
                "tool '{}' has invalid timeout {}: {}",
                self.tool_name, self.timeout_seconds, e
            ))
        })
    }
}

/// The normalized outcome of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tool_name: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionResult {
    /// Build a result from what the backend returned.
    pub fn from_output(tool_name: impl Into<String>, output: ToolOutput, duration: Duration) -> Self {
        let success = output.success();
        let mut metadata = output.metadata;
        let error = if success {
            None
        } else {
            metadata.insert(
                "error_type".to_string(),
                serde_json::Value::from("ExecutionFailure"),
            );
            Some(
                output
                    .error
                    .unwrap_or_else(|| "tool reported an error".to_string()),
            )
        };
        Self {
            tool_name: tool_name.into(),
            success,
            output: if output.output.is_null() {
                None
            } else {
                Some(output.output)
            },
            error,
            duration_seconds: duration.as_secs_f64(),
            metadata,
        }
    }

    /// Build a failed result with a classified error type.
    pub fn failure(
        tool_name: impl Into<String>,
        error_type: &str,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "error_type".to_string(),
            serde_json::Value::from(error_type),
        );
        Self {
            tool_name: tool_name.into(),
            success: false,
            output: None,
            error: Some(message.into()),
            duration_seconds: duration.as_secs_f64(),
            metadata,
        }
    }

    /// The classified error type, if this result failed.
    pub fn error_type(&self) -> Option<&str> {
        self.metadata.get("error_type").and_then(|v| v.as_str())
    }
}

/// How a batch of calls is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// No call declares dependencies; everything runs concurrently.
    Parallel,
    /// Every call declares dependencies; calls run one at a time.
    Sequential,
    /// Dependent calls run first in order, then the rest concurrently.
    Mixed,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Parallel => write!(f, "parallel"),
            StrategyKind::Sequential => write!(f, "sequential"),
            StrategyKind::Mixed => write!(f, "mixed"),
        }
    }
}

/// Scheduling decision for one batch. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStrategy {
    pub kind: StrategyKind,
    pub parallel_tools: Vec<String>,
    pub sequential_tools: Vec<String>,
    pub execution_order: Vec<String>,
}

/// Who is calling and with what ambient values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    /// Role issuing the calls; scopes rate-limit accounting.
    pub role: String,

    /// Free-form values passed along with the batch.
    #[serde(default)]
    pub values: Parameters,
}

impl CallContext {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            values: Parameters::new(),
        }
    }

    /// Add a context value.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.values.insert(key.into(), v);
        }
        self
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// Lifecycle of an execution or task.
///
/// Transitions are forward-only: `Pending → Running → {Completed | Failed | Cancelled}`,
/// and `Pending` may also go straight to a terminal state. Nothing leaves a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true for completed, failed, and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (ExecutionStatus::Pending, ExecutionStatus::Pending) => false,
            (ExecutionStatus::Pending, _) => true,
            (ExecutionStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}
