// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use toolgate::prelude::*;` to get started quickly.

pub use crate::coordinator::{
    AdmissionCoordinator, CoordinatorConfig, CoordinatorStatus, DynamicAdjustment,
    ExecutionRecord, FailurePolicy, QuotaInfo, RateGovernor, RateGovernorConfig, RateLimitRule,
    RuleUpdate,
};
pub use crate::error::{GovernorError, ToolError};
pub use crate::execution::{
    CallContext, ExecutionPlanner, ExecutionResult, ExecutionRunner, ExecutionStatus,
    ExecutionStrategy, Priority, RunnerConfig, StrategyKind, ToolCallRequest, ToolExecutor,
};
pub use crate::gate::{GateConfig, ToolGate};
pub use crate::resource::{
    ConcurrencyTask, ExecutionContext, ProcessCommand, ResourceConfig, ResourceGovernor,
    ResourceLimits, ResourceMonitor, StaticProbe, TaskResult, TaskSpec,
};
pub use crate::tool::{Parameters, Registry, Tool, ToolBackend, ToolOutput};
