// ABOUTME: The ExecutionPlanner - classifies a batch of tool calls into a
// ABOUTME: parallel, sequential, or mixed strategy and validates request shape.

use super::{ExecutionStrategy, StrategyKind, ToolCallRequest};
use crate::error::{GovernorError, Result};

/// Decides how a batch of tool calls should be scheduled.
///
/// Only the presence of declared dependencies matters. Dependency names are
/// neither resolved nor topologically ordered.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionPlanner;

impl ExecutionPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Classify `requests` into an [`ExecutionStrategy`].
    pub fn plan(&self, requests: &[ToolCallRequest]) -> ExecutionStrategy {
        let (sequential, parallel): (Vec<_>, Vec<_>) =
            requests.iter().partition(|r| r.has_dependencies());

        let kind = if sequential.is_empty() {
            StrategyKind::Parallel
        } else if parallel.is_empty() {
            StrategyKind::Sequential
        } else {
            StrategyKind::Mixed
        };

        ExecutionStrategy {
            kind,
            parallel_tools: parallel.iter().map(|r| r.tool_name.clone()).collect(),
            sequential_tools: sequential.iter().map(|r| r.tool_name.clone()).collect(),
            execution_order: requests.iter().map(|r| r.tool_name.clone()).collect(),
        }
    }

    /// Reject structurally malformed requests.
    pub fn validate(&self, requests: &[ToolCallRequest]) -> Result<()> {
        for (index, request) in requests.iter().enumerate() {
            if request.tool_name.trim().is_empty() {
                return Err(GovernorError::Validation(format!(
                    "request {} has an empty tool name",
                    index
                )));
            }
            request.deadline()?;
            if request.retry_count > request.max_retries {
                return Err(GovernorError::Validation(format!(
                    "tool '{}' has retry_count {} above max_retries {}",
                    request.tool_name, request.retry_count, request.max_retries
                )));
            }
        }
        Ok(())
    }
}

/// Split a batch the same way [`ExecutionPlanner::plan`] does, keeping the
/// requests themselves: `(sequential, parallel)`, each in input order.
pub(crate) fn split_by_dependencies(
    requests: &[ToolCallRequest],
) -> (Vec<&ToolCallRequest>, Vec<&ToolCallRequest>) {
    requests.iter().partition(|r| r.has_dependencies())
}
