// ABOUTME: The ToolExecutor trait - the capability the admission coordinator
// ABOUTME: drives, with a per-call fallback for batch execution.

use async_trait::async_trait;

use super::{CallContext, ExecutionResult, ToolCallRequest};
use crate::error::Result;

/// Something that can run tool calls on behalf of a role.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a single call. Failures are captured in the result.
    async fn execute_call(&self, request: &ToolCallRequest, context: &CallContext)
    -> ExecutionResult;

    /// Execute a batch. The default runs each call in order.
    async fn execute_batch(
        &self,
        requests: &[ToolCallRequest],
        context: &CallContext,
    ) -> Result<Vec<ExecutionResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.execute_call(request, context).await);
        }
        Ok(results)
    }
}
