// ABOUTME: The ExecutionRunner - executes tool calls against a ToolBackend with
// ABOUTME: deadlines, optional rate gating, result normalization, history, and stats.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::planner::split_by_dependencies;
use super::{
    CallContext, ExecutionPlanner, ExecutionResult, StrategyKind, ToolCallRequest, ToolExecutor,
};
use crate::coordinator::{RateGovernor, TrackingKey};
use crate::error::{GovernorError, Result, ToolError, panic_message};
use crate::tool::{Parameters, ToolBackend, ToolOutput};

/// Configuration for an [`ExecutionRunner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Per-call records kept; oldest evicted first.
    pub history_limit: usize,

    /// Batch records kept; oldest evicted first.
    pub batch_history_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            batch_history_limit: 100,
        }
    }
}

impl RunnerConfig {
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn batch_history_limit(mut self, limit: usize) -> Self {
        self.batch_history_limit = limit;
        self
    }
}

/// Running counters for one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Seconds spent across all calls.
    pub total_time: f64,
    pub avg_time: f64,
    pub last_called_at: Option<DateTime<Utc>>,
}

impl ToolStats {
    fn record(&mut self, result: &ExecutionResult, at: DateTime<Utc>) {
        self.total_calls += 1;
        if result.success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.total_time += result.duration_seconds;
        self.avg_time = self.total_time / self.total_calls as f64;
        self.last_called_at = Some(at);
    }
}

/// One entry of the per-call history.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub tool_name: String,
    pub role: String,
    pub success: bool,
    pub error_type: Option<String>,
    pub duration_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Totals for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Wall time of the whole batch in seconds.
    pub total_time: f64,
}

impl BatchSummary {
    fn from_results(results: &[ExecutionResult], total_time: f64) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            total_time,
        }
    }
}

/// One entry of the batch history.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub role: String,
    pub strategy: StrategyKind,
    pub requests: Vec<ToolCallRequest>,
    pub results: Vec<ExecutionResult>,
    pub summary: BatchSummary,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate view over everything the runner has executed.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_batches: u64,
    pub total_tools_executed: u64,
    pub successful_tools: u64,
    pub failed_tools: u64,
    pub success_rate: f64,
    /// Mean seconds per call.
    pub average_execution_time: f64,
    pub tool_stats: HashMap<String, ToolStats>,
    /// Summaries of the most recent batches, oldest first.
    pub recent_batches: Vec<BatchSummary>,
}

const RECENT_BATCHES: usize = 10;

#[derive(Default)]
struct RunnerState {
    history: VecDeque<CallRecord>,
    batches: VecDeque<BatchRecord>,
    tool_stats: HashMap<String, ToolStats>,
    total_batches: u64,
}

/// Why a call did not produce backend output.
struct CallFailure {
    error_type: &'static str,
    message: String,
}

impl CallFailure {
    /// Classify a backend error by its concrete type.
    fn classify(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ToolError>() {
            return Self {
                error_type: e.kind(),
                message: e.to_string(),
            };
        }
        if let Some(e) = err.downcast_ref::<GovernorError>() {
            return e.into();
        }
        Self {
            error_type: "ExecutionFailure",
            message: format!("{:#}", err),
        }
    }
}

impl From<&GovernorError> for CallFailure {
    fn from(err: &GovernorError) -> Self {
        Self {
            error_type: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<GovernorError> for CallFailure {
    fn from(err: GovernorError) -> Self {
        (&err).into()
    }
}

/// Executes tool calls through a [`ToolBackend`].
///
/// Every call produces exactly one [`ExecutionResult`]; backend errors,
/// panics, deadline misses, and rate-limit denials are all captured in the
/// result rather than returned.
pub struct ExecutionRunner {
    backend: Arc<dyn ToolBackend>,
    planner: ExecutionPlanner,
    rate_governor: Option<Arc<RateGovernor>>,
    config: RunnerConfig,
    state: Mutex<RunnerState>,
}

impl ExecutionRunner {
    /// Create a runner over the given backend.
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend,
            planner: ExecutionPlanner::new(),
            rate_governor: None,
            config: RunnerConfig::default(),
            state: Mutex::new(RunnerState::default()),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Consult `governor` before every call.
    pub fn with_rate_governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.rate_governor = Some(governor);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn planner(&self) -> &ExecutionPlanner {
        &self.planner
    }

    /// Execute one tool with default request settings.
    pub async fn execute_one(
        &self,
        tool_name: &str,
        parameters: Parameters,
        context: &CallContext,
    ) -> ExecutionResult {
        let request = ToolCallRequest::new(tool_name).parameters(parameters);
        self.run_call(&request, context).await
    }

    /// Execute a batch according to its planned strategy.
    ///
    /// Results of a mixed batch list the dependent calls first, in input
    /// order, followed by the independent ones.
    pub async fn execute_batch(
        &self,
        requests: &[ToolCallRequest],
        context: &CallContext,
    ) -> Result<Vec<ExecutionResult>> {
        self.run_batch(requests, context).await
    }

    async fn run_batch(
        &self,
        requests: &[ToolCallRequest],
        context: &CallContext,
    ) -> Result<Vec<ExecutionResult>> {
        self.planner.validate(requests)?;
        let strategy = self.planner.plan(requests);
        info!(
            role = %context.role,
            strategy = %strategy.kind,
            calls = requests.len(),
            "Executing tool batch"
        );

        let started = Instant::now();
        let results = match strategy.kind {
            StrategyKind::Parallel => {
                let all: Vec<_> = requests.iter().collect();
                self.run_parallel(&all, context).await
            }
            StrategyKind::Sequential => {
                let all: Vec<_> = requests.iter().collect();
                self.run_sequential(&all, context).await
            }
            StrategyKind::Mixed => {
                let (sequential, parallel) = split_by_dependencies(requests);
                let mut results = self.run_sequential(&sequential, context).await;
                results.extend(self.run_parallel(&parallel, context).await);
                results
            }
        };

        let summary = BatchSummary::from_results(&results, started.elapsed().as_secs_f64());
        info!(
            role = %context.role,
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            "Tool batch finished"
        );
        self.record_batch(BatchRecord {
            batch_id: format!("batch_{}", uuid::Uuid::new_v4().simple()),
            role: context.role.clone(),
            strategy: strategy.kind,
            requests: requests.to_vec(),
            results: results.clone(),
            summary,
            recorded_at: Utc::now(),
        });

        Ok(results)
    }

    async fn run_sequential(
        &self,
        requests: &[&ToolCallRequest],
        context: &CallContext,
    ) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.run_call(request, context).await);
        }
        results
    }

    async fn run_parallel(
        &self,
        requests: &[&ToolCallRequest],
        context: &CallContext,
    ) -> Vec<ExecutionResult> {
        join_all(requests.iter().map(|r| self.run_call(r, context))).await
    }

    async fn run_call(&self, request: &ToolCallRequest, context: &CallContext) -> ExecutionResult {
        let started = Instant::now();
        let result = match self.dispatch(request, context).await {
            Ok(output) => {
                ExecutionResult::from_output(&request.tool_name, output, started.elapsed())
            }
            Err(failure) => ExecutionResult::failure(
                &request.tool_name,
                failure.error_type,
                failure.message,
                started.elapsed(),
            ),
        };
        let result = annotate(result, request);

        if !result.success {
            debug!(
                tool = %request.tool_name,
                role = %context.role,
                error_type = result.error_type().unwrap_or("unknown"),
                "Tool call failed"
            );
        }
        self.record_call(&result, &context.role);
        result
    }

    async fn dispatch(
        &self,
        request: &ToolCallRequest,
        context: &CallContext,
    ) -> std::result::Result<ToolOutput, CallFailure> {
        let limit = request.deadline()?;

        if let Some(governor) = &self.rate_governor {
            let category = self.backend.category_of(&request.tool_name).await;
            if !governor.check_rate_limit(&context.role, &category, &request.tool_name) {
                let key = TrackingKey::new(&context.role, &category, &request.tool_name);
                return Err(GovernorError::RateLimitExceeded {
                    key: key.to_string(),
                }
                .into());
            }
        }

        let call = AssertUnwindSafe(
            self.backend
                .execute_tool(&request.tool_name, &request.parameters),
        )
        .catch_unwind();

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(err))) => Err(CallFailure::classify(err)),
            Ok(Err(panic)) => Err(CallFailure {
                error_type: "ExecutionFailure",
                message: format!("tool panicked: {}", panic_message(panic.as_ref())),
            }),
            Err(_) => {
                warn!(
                    tool = %request.tool_name,
                    timeout_secs = limit.as_secs_f64(),
                    "Tool call timed out"
                );
                Err(GovernorError::ExecutionTimeout(limit).into())
            }
        }
    }

    fn record_call(&self, result: &ExecutionResult, role: &str) {
        let now = Utc::now();
        let mut state = self.state.lock();

        state.history.push_back(CallRecord {
            tool_name: result.tool_name.clone(),
            role: role.to_string(),
            success: result.success,
            error_type: result.error_type().map(str::to_string),
            duration_seconds: result.duration_seconds,
            recorded_at: now,
        });
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }

        state
            .tool_stats
            .entry(result.tool_name.clone())
            .or_default()
            .record(result, now);
    }

    fn record_batch(&self, record: BatchRecord) {
        let mut state = self.state.lock();
        state.total_batches += 1;
        state.batches.push_back(record);
        while state.batches.len() > self.config.batch_history_limit {
            state.batches.pop_front();
        }
    }

    /// Most recent per-call records, oldest first.
    pub fn get_execution_history(&self, limit: Option<usize>) -> Vec<CallRecord> {
        let state = self.state.lock();
        let skip = limit.map_or(0, |n| state.history.len().saturating_sub(n));
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Most recent batch records, oldest first.
    pub fn get_batch_history(&self, limit: Option<usize>) -> Vec<BatchRecord> {
        let state = self.state.lock();
        let skip = limit.map_or(0, |n| state.batches.len().saturating_sub(n));
        state.batches.iter().skip(skip).cloned().collect()
    }

    /// Counters for one tool, if it has been called.
    pub fn tool_stats(&self, tool_name: &str) -> Option<ToolStats> {
        self.state.lock().tool_stats.get(tool_name).cloned()
    }

    pub fn get_execution_stats(&self) -> ExecutionStats {
        let state = self.state.lock();

        let mut total = 0u64;
        let mut successful = 0u64;
        let mut total_time = 0.0;
        for stats in state.tool_stats.values() {
            total += stats.total_calls;
            successful += stats.successful_calls;
            total_time += stats.total_time;
        }

        let skip = state.batches.len().saturating_sub(RECENT_BATCHES);
        ExecutionStats {
            total_batches: state.total_batches,
            total_tools_executed: total,
            successful_tools: successful,
            failed_tools: total - successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            average_execution_time: if total > 0 {
                total_time / total as f64
            } else {
                0.0
            },
            tool_stats: state.tool_stats.clone(),
            recent_batches: state
                .batches
                .iter()
                .skip(skip)
                .map(|b| b.summary.clone())
                .collect(),
        }
    }

    /// Drop all history and counters.
    pub fn clear_history(&self) {
        *self.state.lock() = RunnerState::default();
    }
}

/// Attach the request's scheduling fields so callers can drive their own retries.
fn annotate(mut result: ExecutionResult, request: &ToolCallRequest) -> ExecutionResult {
    let metadata = &mut result.metadata;
    metadata.insert("priority".to_string(), request.priority.0.into());
    metadata.insert(
        "dependencies".to_string(),
        serde_json::Value::from(request.dependencies.clone()),
    );
    metadata.insert("retry_count".to_string(), request.retry_count.into());
    metadata.insert("max_retries".to_string(), request.max_retries.into());
    result
}

#[async_trait]
impl ToolExecutor for ExecutionRunner {
    async fn execute_call(
        &self,
        request: &ToolCallRequest,
        context: &CallContext,
    ) -> ExecutionResult {
        self.run_call(request, context).await
    }

    async fn execute_batch(
        &self,
        requests: &[ToolCallRequest],
        context: &CallContext,
    ) -> Result<Vec<ExecutionResult>> {
        self.run_batch(requests, context).await
    }
}
