// ABOUTME: ExecutionRecord - the coordinator's view of one submitted batch,
// ABOUTME: with forward-only status transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::execution::{ExecutionResult, ExecutionStatus, Priority, ToolCallRequest};

/// State of one submitted execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub role: String,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub request: Vec<ToolCallRequest>,
    pub results: Option<Vec<ExecutionResult>>,
    pub error: Option<String>,

    #[serde(skip)]
    pub(crate) finished: Option<Instant>,
}

impl ExecutionRecord {
    pub(crate) fn new(
        execution_id: String,
        role: String,
        priority: Priority,
        request: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Pending,
            role,
            priority,
            submitted_at: Utc::now(),
            start_time: None,
            end_time: None,
            request,
            results: None,
            error: None,
            finished: None,
        }
    }

    /// Seconds between start and end, once both are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            }
            _ => None,
        }
    }

    fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
            self.finished = Some(Instant::now());
        }
        true
    }

    pub(crate) fn mark_running(&mut self) -> bool {
        let moved = self.transition(ExecutionStatus::Running);
        if moved {
            self.start_time = Some(Utc::now());
        }
        moved
    }

    pub(crate) fn mark_completed(&mut self, results: Vec<ExecutionResult>) -> bool {
        let moved = self.transition(ExecutionStatus::Completed);
        if moved {
            self.results = Some(results);
        }
        moved
    }

    pub(crate) fn mark_failed(&mut self, error: String) -> bool {
        let moved = self.transition(ExecutionStatus::Failed);
        if moved {
            self.error = Some(error);
        }
        moved
    }

    pub(crate) fn mark_cancelled(&mut self) -> bool {
        self.transition(ExecutionStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            "exec_1".to_string(),
            "coder".to_string(),
            Priority::default(),
            vec![ToolCallRequest::new("a")],
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut record = record();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert!(record.duration_seconds().is_none());

        assert!(record.mark_running());
        assert!(record.start_time.is_some());

        assert!(record.mark_completed(vec![]));
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.end_time.is_some());
        assert!(record.finished.is_some());
        assert!(record.duration_seconds().unwrap() >= 0.0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut record = record();
        assert!(record.mark_running());
        assert!(record.mark_cancelled());

        assert!(!record.mark_completed(vec![]));
        assert!(!record.mark_failed("late".to_string()));
        assert!(!record.mark_running());
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.results.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_pending_can_be_cancelled() {
        let mut record = record();
        assert!(record.mark_cancelled());
        assert!(record.start_time.is_none());
        assert!(record.end_time.is_some());
    }
}
