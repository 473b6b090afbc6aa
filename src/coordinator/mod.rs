// ABOUTME: Coordinator module - admission control for tool batches and the
// ABOUTME: sliding-window rate governor consulted before each call.

mod coordinator;
mod rate_limiter;
mod record;

pub use coordinator::{AdmissionCoordinator, CoordinatorConfig, CoordinatorStatus};
pub use rate_limiter::{
    AdjustmentCondition, DEFAULT_RULE, DynamicAdjustment, FailurePolicy, QuotaInfo, RateGovernor,
    RateGovernorConfig, RateLimitInfo, RateLimitRule, RuleUpdate, TrackingKey, UsageStatistics,
    UsageStats, default_rules,
};
pub use record::ExecutionRecord;
