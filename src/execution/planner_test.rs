// ABOUTME: Tests for the ExecutionPlanner - strategy classification and
// ABOUTME: request validation.

use super::planner::split_by_dependencies;
use super::*;
use crate::error::GovernorError;

fn call(name: &str) -> ToolCallRequest {
    ToolCallRequest::new(name)
}

#[test]
fn test_no_dependencies_is_parallel() {
    let strategy = ExecutionPlanner::new().plan(&[call("a"), call("b")]);

    assert_eq!(strategy.kind, StrategyKind::Parallel);
    assert_eq!(strategy.parallel_tools, vec!["a", "b"]);
    assert!(strategy.sequential_tools.is_empty());
    assert_eq!(strategy.execution_order, vec!["a", "b"]);
}

#[test]
fn test_all_dependencies_is_sequential() {
    let requests = vec![call("a").depends_on("x"), call("b").depends_on("a")];
    let strategy = ExecutionPlanner::new().plan(&requests);

    assert_eq!(strategy.kind, StrategyKind::Sequential);
    assert_eq!(strategy.sequential_tools, vec!["a", "b"]);
    assert!(strategy.parallel_tools.is_empty());
}

#[test]
fn test_mixed_batch() {
    let requests = vec![call("A"), call("B"), call("C").depends_on("A")];
    let strategy = ExecutionPlanner::new().plan(&requests);

    assert_eq!(strategy.kind, StrategyKind::Mixed);
    assert_eq!(strategy.sequential_tools, vec!["C"]);
    assert_eq!(strategy.parallel_tools, vec!["A", "B"]);
    assert_eq!(strategy.execution_order, vec!["A", "B", "C"]);
}

#[test]
fn test_empty_batch_is_parallel() {
    let strategy = ExecutionPlanner::new().plan(&[]);
    assert_eq!(strategy.kind, StrategyKind::Parallel);
    assert!(strategy.execution_order.is_empty());
}

#[test]
fn test_unknown_dependency_names_are_not_checked() {
    let strategy = ExecutionPlanner::new().plan(&[call("a").depends_on("never_submitted")]);
    assert_eq!(strategy.kind, StrategyKind::Sequential);
}

#[test]
fn test_validate_accepts_defaults() {
    assert!(ExecutionPlanner::new().validate(&[call("a"), call("b")]).is_ok());
}

#[test]
fn test_validate_rejects_empty_name() {
    match ExecutionPlanner::new().validate(&[call("a"), call("  ")]) {
        Err(GovernorError::Validation(msg)) => assert!(msg.contains("request 1")),
        other => panic!("Expected Validation, got {:?}", other),
    }
}

#[test]
fn test_validate_rejects_bad_timeout() {
    let mut request = call("slow");
    request.timeout_seconds = -1.0;

    match ExecutionPlanner::new().validate(&[request]) {
        Err(GovernorError::Validation(msg)) => assert!(msg.contains("slow")),
        other => panic!("Expected Validation, got {:?}", other),
    }
}

#[test]
fn test_validate_rejects_exhausted_retries() {
    let request = call("flaky").max_retries(1).retry_count(2);
    assert!(matches!(
        ExecutionPlanner::new().validate(&[request]),
        Err(GovernorError::Validation(_))
    ));
}

#[test]
fn test_split_matches_plan() {
    let requests = vec![call("A"), call("C").depends_on("A"), call("B")];
    let (sequential, parallel) = split_by_dependencies(&requests);

    let seq: Vec<_> = sequential.iter().map(|r| r.tool_name.as_str()).collect();
    let par: Vec<_> = parallel.iter().map(|r| r.tool_name.as_str()).collect();
    assert_eq!(seq, vec!["C"]);
    assert_eq!(par, vec!["A", "B"]);
}
