// ABOUTME: Tests for the ResourceGovernor - task contexts, limits, cancellation,
// ABOUTME: monitors, sampling, cleanup, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::error::GovernorError;
use crate::execution::{ExecutionStatus, Priority};

fn governor(config: ResourceConfig) -> ResourceGovernor {
    ResourceGovernor::with_probe(config, Arc::new(StaticProbe::new(10.0, 10.0)))
}

fn quiet() -> ResourceConfig {
    ResourceConfig::default().enable_monitoring(false)
}

fn idle(name: &str) -> TaskSpec {
    TaskSpec::cooperative(name, std::future::pending::<TaskResult>())
}

#[tokio::test]
async fn test_cooperative_task_completes() {
    let governor = governor(quiet());

    let id = governor
        .submit(
            TaskSpec::cooperative("answer", async { Ok(serde_json::json!(42)) })
                .priority(Priority(2))
                .metadata("owner", "planner"),
        )
        .unwrap();
    assert!(id.starts_with("task_"));

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Completed);
    assert_eq!(task.output, Some(serde_json::json!(42)));
    assert_eq!(task.execution_context, ExecutionContext::Cooperative);
    assert_eq!(task.priority, Priority(2));
    assert_eq!(task.metadata["owner"], "planner");
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());

    let history = governor.get_task_history(None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_failed_task_keeps_error() {
    let governor = governor(quiet());

    let id = governor
        .submit(TaskSpec::cooperative("broken", async {
            Err(anyhow::anyhow!("index corrupted"))
        }))
        .unwrap();

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Failed);
    assert!(task.error.unwrap().contains("index corrupted"));
    assert!(task.output.is_none());
}

#[tokio::test]
async fn test_panicking_task_is_failed() {
    let governor = governor(quiet());

    let id = governor
        .submit(TaskSpec::cooperative("boom", async {
            panic!("task exploded")
        }))
        .unwrap();

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Failed);
    assert!(task.error.unwrap().contains("task exploded"));
}

#[tokio::test]
async fn test_thread_task_runs_blocking_work() {
    let governor = governor(quiet());

    let id = governor
        .submit(TaskSpec::thread("sum", || {
            let total: u64 = (1..=100).sum();
            Ok(serde_json::json!(total))
        }))
        .unwrap();

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Completed);
    assert_eq!(task.output, Some(serde_json::json!(5050)));
    assert_eq!(task.execution_context, ExecutionContext::Thread);
}

#[tokio::test]
async fn test_thread_pool_is_bounded() {
    let governor = governor(quiet().max_threads(1));

    let slow = || {
        std::thread::sleep(Duration::from_millis(300));
        Ok(serde_json::json!("done"))
    };
    let first = governor.submit(TaskSpec::thread("first", slow)).unwrap();
    let second = governor.submit(TaskSpec::thread("second", slow)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(governor.get_tasks_by_status(ExecutionStatus::Running).len(), 1);
    assert_eq!(governor.get_tasks_by_status(ExecutionStatus::Pending).len(), 1);
    assert_eq!(governor.get_concurrency_statistics().available_threads, 0);

    for id in [first, second] {
        let task = governor.wait_for_task(&id, None).await.unwrap();
        assert_eq!(task.status, ExecutionStatus::Completed);
    }
}

#[tokio::test]
async fn test_process_task() {
    let governor = governor(quiet());

    let id = governor
        .submit(TaskSpec::process("greet", ProcessCommand::shell("echo hello")))
        .unwrap();

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Completed);
    let output = task.output.unwrap();
    assert_eq!(output["exit_code"], 0);
    assert!(output["stdout"].as_str().unwrap().contains("hello"));
    assert_eq!(
        governor
            .get_tasks_by_context(ExecutionContext::Process)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_failing_process_task() {
    let governor = governor(quiet());

    let id = governor
        .submit(TaskSpec::process("fail", ProcessCommand::shell("exit 7")))
        .unwrap();

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Failed);
    assert!(task.error.unwrap().contains("code 7"));
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout() {
    let governor = governor(quiet());

    let id = governor
        .submit(
            TaskSpec::cooperative("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(serde_json::Value::Null)
            })
            .timeout(Duration::from_secs(1)),
        )
        .unwrap();

    let task = governor.wait_for_task(&id, None).await.unwrap();
    assert_eq!(task.status, ExecutionStatus::Failed);
    assert!(task.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_task_count_limit() {
    let governor = governor(quiet().max_concurrent_tasks(2));

    governor.submit(idle("a")).unwrap();
    governor.submit(idle("b")).unwrap();

    match governor.submit(idle("c")) {
        Err(GovernorError::ResourceExhausted(msg)) => assert!(msg.contains("limit is 2")),
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }
    assert!(governor.check_resource_limits().is_err());
    assert_eq!(governor.get_all_tasks().len(), 2);
}

#[tokio::test]
async fn test_finished_tasks_free_capacity() {
    let governor = governor(quiet().max_concurrent_tasks(1));

    let id = governor
        .submit(TaskSpec::cooperative("quick", async { Ok(serde_json::Value::Null) }))
        .unwrap();
    governor.wait_for_task(&id, None).await.unwrap();

    assert!(governor.submit(idle("next")).is_ok());
}

#[tokio::test]
async fn test_cpu_and_memory_limits() {
    let hot = ResourceGovernor::with_probe(quiet(), Arc::new(StaticProbe::new(95.0, 10.0)));
    match hot.submit(idle("x")) {
        Err(GovernorError::ResourceExhausted(msg)) => assert!(msg.contains("CPU")),
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }

    let full = ResourceGovernor::with_probe(quiet(), Arc::new(StaticProbe::new(10.0, 95.0)));
    match full.submit(idle("x")) {
        Err(GovernorError::ResourceExhausted(msg)) => assert!(msg.contains("memory")),
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }

    let unlimited = ResourceGovernor::with_probe(
        quiet().resource_limits(None),
        Arc::new(StaticProbe::new(99.0, 99.0)),
    );
    assert!(unlimited.submit(idle("x")).is_ok());
}

/// Reports whatever CPU reading the test last set.
struct ShiftingCpu {
    cpu: parking_lot::Mutex<f64>,
}

impl SystemProbe for ShiftingCpu {
    fn sample(&self) -> anyhow::Result<SystemSnapshot> {
        Ok(SystemSnapshot {
            cpu_percent: *self.cpu.lock(),
            memory_percent: 10.0,
            ..SystemSnapshot::default()
        })
    }
}

struct OfflineSensor;

impl SystemProbe for OfflineSensor {
    fn sample(&self) -> anyhow::Result<SystemSnapshot> {
        anyhow::bail!("sensor offline")
    }
}

#[tokio::test]
async fn test_limits_follow_the_current_reading() {
    let sensor = Arc::new(ShiftingCpu {
        cpu: parking_lot::Mutex::new(10.0),
    });
    let governor = ResourceGovernor::with_probe(quiet(), sensor.clone());

    assert!(governor.check_resource_limits().is_ok());

    *sensor.cpu.lock() = 99.0;
    match governor.check_resource_limits() {
        Err(GovernorError::ResourceExhausted(msg)) => assert!(msg.contains("CPU")),
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }
    match governor.submit(idle("x")) {
        Err(GovernorError::ResourceExhausted(msg)) => assert!(msg.contains("CPU")),
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }
    let last = governor.get_concurrency_statistics().last_sample.unwrap();
    assert_eq!(last.cpu_percent, 99.0);

    *sensor.cpu.lock() = 20.0;
    assert!(governor.submit(idle("y")).is_ok());
}

#[tokio::test]
async fn test_unreadable_sample_refuses_tasks() {
    let governor = ResourceGovernor::with_probe(quiet(), Arc::new(OfflineSensor));

    match governor.check_resource_limits() {
        Err(GovernorError::ResourceExhausted(msg)) => assert!(msg.contains("sensor offline")),
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }
    match governor.submit(idle("x")) {
        Err(GovernorError::ResourceExhausted(_)) => {}
        other => panic!("Expected ResourceExhausted, got {:?}", other),
    }
    assert!(governor.get_all_tasks().is_empty());

    let unlimited =
        ResourceGovernor::with_probe(quiet().resource_limits(None), Arc::new(OfflineSensor));
    assert!(unlimited.check_resource_limits().is_ok());
    assert!(unlimited.submit(idle("x")).is_ok());
}

#[tokio::test]
async fn test_cancel_task() {
    let governor = governor(quiet());

    let id = governor.submit(idle("forever")).unwrap();
    tokio::task::yield_now().await;

    assert!(governor.cancel(&id));
    let task = governor.get_task_info(&id).unwrap();
    assert_eq!(task.status, ExecutionStatus::Cancelled);
    assert!(task.completed_at.is_some());

    assert!(!governor.cancel(&id));
    assert!(!governor.cancel("task_missing"));
    assert_eq!(governor.get_concurrency_statistics().active_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sampling_attaches_usage_to_running_tasks() {
    let governor = governor(ResourceConfig::default().sample_interval(Duration::from_secs(1)));

    let id = governor.submit(idle("watched")).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let task = governor.get_task_info(&id).unwrap();
    assert_eq!(task.status, ExecutionStatus::Running);
    assert_eq!(task.resource_usage["cpu_usage"], 10.0);
    assert_eq!(task.resource_usage["task_count"]["running"], 1);
    assert!(task.resource_usage.contains_key("sampled_at"));

    governor.shutdown().await;
}

#[tokio::test]
async fn test_sample_now_attaches_usage() {
    let governor = governor(quiet());

    let id = governor.submit(idle("watched")).unwrap();
    let done = governor
        .submit(TaskSpec::cooperative("quick", async { Ok(serde_json::Value::Null) }))
        .unwrap();
    governor.wait_for_task(&done, None).await.unwrap();
    assert!(governor.get_task_info(&id).unwrap().resource_usage.is_empty());

    governor.sample_now();

    let task = governor.get_task_info(&id).unwrap();
    assert_eq!(task.status, ExecutionStatus::Running);
    assert_eq!(task.resource_usage["cpu_usage"], 10.0);
    assert!(task.resource_usage.contains_key("sampled_at"));
    assert!(governor.get_task_info(&done).unwrap().resource_usage.is_empty());
}

#[tokio::test]
async fn test_custom_monitors() {
    let governor = governor(quiet());

    governor.register_resource_monitor(
        "open_files",
        Arc::new(|_ctx: &MonitorContext<'_>| -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!(7))
        }),
    );
    let metrics = governor.get_resource_metrics();
    assert_eq!(metrics["open_files"], 7);
    assert_eq!(metrics["memory_usage"]["percent"], 10.0);

    let stats = governor.get_concurrency_statistics();
    assert_eq!(
        stats.resource_monitors,
        vec!["cpu_usage", "memory_usage", "open_files", "task_count"]
    );

    assert!(governor.unregister_resource_monitor("open_files"));
    assert!(!governor.unregister_resource_monitor("open_files"));
    assert!(!governor.get_resource_metrics().contains_key("open_files"));
}

#[tokio::test]
async fn test_failing_monitor_reports_null() {
    let governor = governor(quiet());

    governor.register_resource_monitor(
        "flaky",
        Arc::new(|_ctx: &MonitorContext<'_>| -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("sensor offline")
        }),
    );
    assert!(governor.get_resource_metrics()["flaky"].is_null());
}

#[tokio::test]
async fn test_statistics_distributions() {
    let governor = governor(quiet());

    governor.submit(idle("a").priority(Priority(1))).unwrap();
    governor.submit(idle("b").priority(Priority(3))).unwrap();
    let done = governor
        .submit(TaskSpec::thread("c", || Ok(serde_json::Value::Null)))
        .unwrap();
    governor.wait_for_task(&done, None).await.unwrap();

    let stats = governor.get_concurrency_statistics();
    assert_eq!(stats.tracked_tasks, 3);
    assert_eq!(stats.active_tasks, 2);
    assert_eq!(stats.history_size, 3);
    assert_eq!(stats.context_distribution["cooperative"], 2);
    assert_eq!(stats.context_distribution["thread"], 1);
    assert_eq!(stats.priority_distribution["3"], 1);
    assert_eq!(stats.status_distribution["completed"], 1);
    assert_eq!(stats.max_processes, 4);
    assert!(stats.last_sample.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_completed_tasks() {
    let governor = governor(quiet());

    let done = governor
        .submit(TaskSpec::cooperative("quick", async { Ok(serde_json::Value::Null) }))
        .unwrap();
    let running = governor
        .submit(TaskSpec::cooperative("long", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }))
        .unwrap();
    governor.wait_for_task(&done, None).await.unwrap();

    assert_eq!(governor.cleanup_completed_tasks(Duration::from_secs(60)), 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(governor.cleanup_completed_tasks(Duration::from_secs(60)), 1);

    assert!(governor.get_task_info(&done).is_none());
    assert!(governor.get_task_info(&running).is_some());
    // History outlives cleanup.
    assert_eq!(governor.get_task_history(None).len(), 2);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let governor = governor(quiet().history_limit(2));

    for name in ["a", "b", "c"] {
        governor.submit(idle(name)).unwrap();
    }
    let history = governor.get_task_history(None);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].name, "b");
    assert_eq!(governor.get_task_history(Some(1))[0].name, "c");
}

#[tokio::test]
async fn test_shutdown_cancels_and_rejects() {
    let governor = governor(ResourceConfig::default());

    let id = governor.submit(idle("forever")).unwrap();
    tokio::task::yield_now().await;

    governor.shutdown().await;
    assert_eq!(
        governor.get_task_info(&id).unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert_eq!(
        governor.get_task_history(None)[0].status,
        ExecutionStatus::Cancelled
    );
    assert!(matches!(
        governor.submit(idle("late")),
        Err(GovernorError::ShuttingDown)
    ));

    governor.shutdown().await;
}
