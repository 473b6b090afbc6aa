// ABOUTME: Defines the error taxonomy for toolgate using thiserror.
// ABOUTME: Admission, execution, and validation failures share one enum.

use std::time::Duration;

/// Top-level error type for the toolgate library.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GovernorError {
    /// A request reached the planner or runner in a malformed state.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The rate governor denied a call for its tracking key.
    #[error("Rate limit exceeded for '{key}'")]
    RateLimitExceeded { key: String },

    /// The admission queue is at capacity.
    #[error("Execution queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The resource gate refused a new task.
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A call or batch missed its deadline.
    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// The tool backend returned an error or panicked.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// The work was cancelled explicitly.
    #[error("Execution cancelled")]
    Cancelled,

    /// The component no longer accepts work.
    #[error("Component is shutting down")]
    ShuttingDown,

    /// No task is registered under the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

impl GovernorError {
    /// Short, stable name for the error kind, used as `error_type` metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            GovernorError::Validation(_) => "ValidationError",
            GovernorError::RateLimitExceeded { .. } => "RateLimitExceeded",
            GovernorError::QueueFull { .. } => "QueueFull",
            GovernorError::ResourceExhausted(_) => "ResourceExhausted",
            GovernorError::ExecutionTimeout(_) => "ExecutionTimeout",
            GovernorError::ExecutionFailure(_) => "ExecutionFailure",
            GovernorError::Cancelled => "Cancelled",
            GovernorError::ShuttingDown => "ShuttingDown",
            GovernorError::TaskNotFound(_) => "TaskNotFound",
        }
    }
}

impl From<anyhow::Error> for GovernorError {
    fn from(err: anyhow::Error) -> Self {
        GovernorError::ExecutionFailure(format!("{:#}", err))
    }
}

/// Errors raised by tool backends before or during a call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

impl ToolError {
    /// Short, stable name for the error kind, used as `error_type` metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "ToolNotFound",
            ToolError::InvalidParams(_) => "ValidationError",
        }
    }
}

/// Convenience alias for results in this crate.
pub type Result<T, E = GovernorError> = std::result::Result<T, E>;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
