// ABOUTME: ToolGate - wires the rate governor, runner, and admission coordinator
// ABOUTME: over one tool backend and exposes their operations together.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordinator::{
    AdmissionCoordinator, CoordinatorConfig, CoordinatorStatus, ExecutionRecord, QuotaInfo,
    RateGovernor, RateGovernorConfig, UsageStatistics,
};
use crate::error::Result;
use crate::execution::{
    CallContext, ExecutionResult, ExecutionRunner, ExecutionStats, ExecutionStrategy, Priority,
    RunnerConfig, ToolCallRequest,
};
use crate::tool::{Parameters, ToolBackend};

/// Configuration for a [`ToolGate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub rate: RateGovernorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

/// The execution-governance layer for one tool backend.
///
/// Every call the runner makes is checked against the shared rate governor;
/// queued batches go through the admission coordinator and run on the same
/// runner.
pub struct ToolGate {
    rate_governor: Arc<RateGovernor>,
    runner: Arc<ExecutionRunner>,
    coordinator: AdmissionCoordinator,
}

impl ToolGate {
    /// Build the layer. Background tasks start when called inside a tokio runtime.
    pub fn new(backend: Arc<dyn ToolBackend>, config: GateConfig) -> Self {
        let rate_governor = Arc::new(RateGovernor::new(config.rate));
        let runner = Arc::new(
            ExecutionRunner::new(backend)
                .with_config(config.runner)
                .with_rate_governor(Arc::clone(&rate_governor)),
        );
        let coordinator = AdmissionCoordinator::new(config.coordinator);
        info!("Tool gate started");

        Self {
            rate_governor,
            runner,
            coordinator,
        }
    }

    pub fn rate_governor(&self) -> &Arc<RateGovernor> {
        &self.rate_governor
    }

    pub fn runner(&self) -> &Arc<ExecutionRunner> {
        &self.runner
    }

    pub fn coordinator(&self) -> &AdmissionCoordinator {
        &self.coordinator
    }

    pub fn check_rate_limit(&self, role: &str, category: &str, tool: &str) -> bool {
        self.rate_governor.check_rate_limit(role, category, tool)
    }

    pub fn get_remaining_quota(&self, role: &str, category: &str, tool: &str) -> QuotaInfo {
        self.rate_governor.get_remaining_quota(role, category, tool)
    }

    pub fn plan_strategy(&self, requests: &[ToolCallRequest]) -> ExecutionStrategy {
        self.runner.planner().plan(requests)
    }

    /// Run a batch now, bypassing the queue.
    pub async fn execute_batch(
        &self,
        requests: &[ToolCallRequest],
        role: &str,
        context: Parameters,
    ) -> Result<Vec<ExecutionResult>> {
        let context = CallContext {
            role: role.to_string(),
            values: context,
        };
        self.runner.execute_batch(requests, &context).await
    }

    /// Queue a batch; fails with `QueueFull` when the queue is at capacity.
    pub fn submit_execution(
        &self,
        requests: Vec<ToolCallRequest>,
        role: &str,
        context: Parameters,
        priority: Priority,
    ) -> Result<String> {
        self.coordinator
            .submit(self.runner.clone(), requests, role, context, priority)
    }

    pub fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.coordinator.get_status(execution_id)
    }

    pub async fn wait_for_execution(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Option<ExecutionRecord> {
        self.coordinator.wait_for(execution_id, timeout).await
    }

    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        self.coordinator.cancel(execution_id)
    }

    pub fn get_coordinator_status(&self) -> CoordinatorStatus {
        self.coordinator.get_coordinator_status()
    }

    pub fn get_usage_statistics(&self) -> UsageStatistics {
        self.rate_governor.get_usage_statistics()
    }

    pub fn get_execution_stats(&self) -> ExecutionStats {
        self.runner.get_execution_stats()
    }

    /// Stop the coordinator, then the rate governor's sweep. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.rate_governor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RateLimitRule;
    use crate::error::GovernorError;
    use crate::execution::{ExecutionStatus, StrategyKind};
    use crate::tool::{Registry, Tool, ToolOutput};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the parameters back"
        }

        fn category(&self) -> &str {
            "limited"
        }

        async fn execute(&self, params: &Parameters) -> Result<ToolOutput, anyhow::Error> {
            Ok(ToolOutput::value(serde_json::Value::Object(params.clone())))
        }
    }

    async fn gate() -> ToolGate {
        let registry = Registry::new();
        registry.register(EchoTool).await;
        let config = GateConfig {
            rate: RateGovernorConfig::default().rule("limited", RateLimitRule::new(2, 60, 5)),
            ..GateConfig::default()
        };
        ToolGate::new(Arc::new(registry), config)
    }

    #[tokio::test]
    async fn test_batch_calls_are_rate_limited_by_tool_category() {
        let gate = gate().await;
        let requests = vec![
            ToolCallRequest::new("echo").param("n", 1),
            ToolCallRequest::new("echo").param("n", 2),
            ToolCallRequest::new("echo").param("n", 3),
        ];

        let results = gate
            .execute_batch(&requests, "analyst", Parameters::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
        let denied: Vec<_> = results.iter().filter(|r| !r.success).collect();
        assert_eq!(denied[0].error_type(), Some("RateLimitExceeded"));
        assert!(!gate.check_rate_limit("analyst", "limited", "echo"));

        let quota = gate.get_remaining_quota("analyst", "limited", "echo");
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.total, 2);

        let usage = gate.get_usage_statistics();
        assert_eq!(usage["limited"]["analyst"]["echo"].total_calls, 2);

        gate.shutdown().await;
    }

    #[tokio::test]
    async fn test_submitted_execution_runs_on_the_runner() {
        let gate = gate().await;
        let id = gate
            .submit_execution(
                vec![ToolCallRequest::new("echo").param("msg", "hi")],
                "analyst",
                Parameters::new(),
                Priority::default(),
            )
            .unwrap();
        assert!(id.starts_with("exec_"));

        let record = gate
            .wait_for_execution(&id, Some(Duration::from_secs(5)))
            .await
            .expect("execution should be tracked");
        assert_eq!(record.status, ExecutionStatus::Completed);
        let results = record.results.expect("completed executions carry results");
        assert_eq!(results[0].output, Some(serde_json::json!({"msg": "hi"})));

        let stats = gate.get_execution_stats();
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.successful_tools, 1);
        assert!(gate.get_execution_status(&id).is_some());

        gate.shutdown().await;
    }

    #[tokio::test]
    async fn test_plan_strategy_delegates_to_planner() {
        let gate = gate().await;
        let requests = vec![
            ToolCallRequest::new("a"),
            ToolCallRequest::new("b").depends_on("a"),
        ];
        assert_eq!(gate.plan_strategy(&requests).kind, StrategyKind::Mixed);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_submissions() {
        let gate = gate().await;
        gate.shutdown().await;
        gate.shutdown().await;

        let result = gate.submit_execution(
            vec![ToolCallRequest::new("echo")],
            "analyst",
            Parameters::new(),
            Priority::default(),
        );
        match result {
            Err(GovernorError::ShuttingDown) => {}
            other => panic!("Expected ShuttingDown, got {:?}", other),
        }
        assert!(gate.get_coordinator_status().shutting_down);
        assert!(!gate.cancel_execution("exec_missing"));
    }

    #[test]
    fn test_config_sections_default_when_absent() {
        let config: GateConfig = serde_json::from_str(
            r#"{"runner": {"history_limit": 5, "batch_history_limit": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.runner.history_limit, 5);
        assert_eq!(config.coordinator, CoordinatorConfig::default());
        assert_eq!(config.rate, RateGovernorConfig::default());
    }
}
