// ABOUTME: The AdmissionCoordinator - a bounded queue of tool batches drained by a
// ABOUTME: dispatch loop under a concurrency cap, with status, wait, and cancel.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ExecutionRecord;
use crate::error::{GovernorError, Result, panic_message};
use crate::execution::{CallContext, Priority, ToolCallRequest, ToolExecutor};
use crate::tool::Parameters;

/// Configuration for an [`AdmissionCoordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Executions allowed to run at once.
    pub max_concurrent_executions: usize,
    /// Pending executions allowed to wait in the queue.
    pub max_queue_size: usize,
    /// Bound on a whole batch; also how long terminal records are retained.
    pub execution_timeout: Duration,
    /// Dispatch loop period when nothing wakes it earlier.
    pub dispatch_interval: Duration,
    /// Poll period for [`AdmissionCoordinator::wait_for`].
    pub wait_poll_interval: Duration,
    /// Utilization ratio above which a warning is logged.
    pub warning_ratio: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            max_queue_size: 100,
            execution_timeout: Duration::from_secs(300),
            dispatch_interval: Duration::from_millis(100),
            wait_poll_interval: Duration::from_millis(100),
            warning_ratio: 0.8,
        }
    }
}

impl CoordinatorConfig {
    pub fn max_concurrent_executions(mut self, n: usize) -> Self {
        self.max_concurrent_executions = n;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }
}

/// Snapshot of coordinator load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub queue_size: usize,
    pub active_executions: usize,
    /// Records still held, in any state.
    pub tracked_executions: usize,
    pub completed_executions: usize,
    pub max_concurrent_executions: usize,
    pub max_queue_size: usize,
    pub execution_timeout_seconds: f64,
    pub active_ids: Vec<String>,
    pub shutting_down: bool,
}

struct QueuedExecution {
    execution_id: String,
    executor: Arc<dyn ToolExecutor>,
    requests: Vec<ToolCallRequest>,
    context: CallContext,
}

#[derive(Default)]
struct CoordinatorState {
    queue: VecDeque<QueuedExecution>,
    active: HashMap<String, JoinHandle<()>>,
    records: HashMap<String, ExecutionRecord>,
    shutting_down: bool,
    queue_warned: bool,
    active_warned: bool,
}

struct Shared {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    wakeup: Notify,
}

/// Removes an execution from the active set however its task ends.
struct ActiveGuard {
    shared: Arc<Shared>,
    execution_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.state.lock().active.remove(&self.execution_id);
        self.shared.wakeup.notify_one();
    }
}

impl Shared {
    fn tick(self: &Arc<Self>) {
        self.dispatch_ready();
        self.cleanup_expired();
        self.check_utilization();
    }

    fn dispatch_ready(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while !state.shutting_down && state.active.len() < self.config.max_concurrent_executions {
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            let id = job.execution_id.clone();
            let started = state
                .records
                .get_mut(&id)
                .is_some_and(|record| record.mark_running());
            if !started {
                debug!(execution_id = %id, "Skipping execution that is no longer pending");
                continue;
            }
            let handle = tokio::spawn(run_execution(Arc::clone(self), job));
            state.active.insert(id.clone(), handle);
            debug!(execution_id = %id, active = state.active.len(), "Execution dispatched");
        }
    }

    fn cleanup_expired(&self) {
        let retention = self.config.execution_timeout;
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|_, record| {
            !(record.status.is_terminal()
                && record.finished.is_some_and(|t| t.elapsed() > retention))
        });
        let removed = before - state.records.len();
        if removed > 0 {
            debug!(removed, "Removed expired execution records");
        }
    }

    fn check_utilization(&self) {
        let config = &self.config;
        let mut state = self.state.lock();

        let queue_high =
            state.queue.len() as f64 > config.max_queue_size as f64 * config.warning_ratio;
        if queue_high && !state.queue_warned {
            warn!(
                queue_size = state.queue.len(),
                max_queue_size = config.max_queue_size,
                "Execution queue utilization high"
            );
        }
        state.queue_warned = queue_high;

        let active_high = state.active.len() as f64
            > config.max_concurrent_executions as f64 * config.warning_ratio;
        if active_high && !state.active_warned {
            warn!(
                active = state.active.len(),
                max_concurrent = config.max_concurrent_executions,
                "Execution concurrency utilization high"
            );
        }
        state.active_warned = active_high;
    }
}

async fn run_execution(shared: Arc<Shared>, job: QueuedExecution) {
    let QueuedExecution {
        execution_id,
        executor,
        requests,
        context,
    } = job;
    let _guard = ActiveGuard {
        shared: Arc::clone(&shared),
        execution_id: execution_id.clone(),
    };
    info!(execution_id = %execution_id, role = %context.role, calls = requests.len(), "Execution started");

    let limit = shared.config.execution_timeout;
    let work = AssertUnwindSafe(executor.execute_batch(&requests, &context)).catch_unwind();
    let outcome = match tokio::time::timeout(limit, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(GovernorError::ExecutionFailure(format!(
            "executor panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(GovernorError::ExecutionTimeout(limit)),
    };

    let mut state = shared.state.lock();
    state.active.remove(&execution_id);
    let Some(record) = state.records.get_mut(&execution_id) else {
        return;
    };
    match outcome {
        Ok(results) => {
            if record.mark_completed(results) {
                info!(execution_id = %execution_id, "Execution completed");
            }
        }
        Err(err) => {
            if matches!(err, GovernorError::ExecutionTimeout(_)) {
                warn!(execution_id = %execution_id, error = %err, "Execution timed out");
            } else {
                warn!(execution_id = %execution_id, error = %err, "Execution failed");
            }
            record.mark_failed(err.to_string());
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shared.wakeup.notified() => {}
            () = tokio::time::sleep(shared.config.dispatch_interval) => {}
        }
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| shared.tick())) {
            error!(error = %panic_message(panic.as_ref()), "Dispatch tick failed");
        }
    }
    debug!("Dispatch loop stopped");
}

/// Bounded admission queue with a concurrency-limited dispatch loop.
///
/// [`submit`](Self::submit) never blocks: it either enqueues a pending
/// execution or fails with `QueueFull`. The dispatch loop starts queued
/// executions in FIFO order while fewer than `max_concurrent_executions` are
/// running. Priority is recorded but does not affect ordering.
pub struct AdmissionCoordinator {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AdmissionCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl AdmissionCoordinator {
    /// Create a coordinator. Starts the dispatch loop when called inside a tokio runtime.
    pub fn new(config: CoordinatorConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(CoordinatorState::default()),
            wakeup: Notify::new(),
        });
        let cancel = CancellationToken::new();

        let dispatcher = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(dispatch_loop(Arc::clone(&shared), cancel.clone()))),
            Err(_) => {
                warn!("No tokio runtime; admission coordinator will not dispatch");
                None
            }
        };

        Self {
            shared,
            cancel,
            dispatcher: Mutex::new(dispatcher),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Queue a batch for execution and return its id.
    pub fn submit(
        &self,
        executor: Arc<dyn ToolExecutor>,
        requests: Vec<ToolCallRequest>,
        role: &str,
        context: Parameters,
        priority: Priority,
    ) -> Result<String> {
        let execution_id = format!("exec_{}", uuid::Uuid::new_v4().simple());
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Err(GovernorError::ShuttingDown);
            }
            if state.queue.len() >= self.shared.config.max_queue_size {
                warn!(
                    role,
                    capacity = self.shared.config.max_queue_size,
                    "Execution queue full"
                );
                return Err(GovernorError::QueueFull {
                    capacity: self.shared.config.max_queue_size,
                });
            }

            state.records.insert(
                execution_id.clone(),
                ExecutionRecord::new(
                    execution_id.clone(),
                    role.to_string(),
                    priority,
                    requests.clone(),
                ),
            );
            state.queue.push_back(QueuedExecution {
                execution_id: execution_id.clone(),
                executor,
                requests,
                context: CallContext {
                    role: role.to_string(),
                    values: context,
                },
            });
        }

        self.shared.wakeup.notify_one();
        info!(execution_id = %execution_id, role, %priority, "Execution submitted");
        Ok(execution_id)
    }

    /// Current record for an execution.
    pub fn get_status(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.shared.state.lock().records.get(execution_id).cloned()
    }

    /// Wait until the execution is terminal, or `None` once `timeout` elapses.
    ///
    /// `timeout` defaults to the configured `execution_timeout`. Unknown ids
    /// return `None` at once.
    pub async fn wait_for(
        &self,
        execution_id: &str,
        timeout: Option<Duration>,
    ) -> Option<ExecutionRecord> {
        let limit = timeout.unwrap_or(self.shared.config.execution_timeout);
        let poll = self.shared.config.wait_poll_interval;
        let deadline = Instant::now() + limit;

        loop {
            match self.get_status(execution_id) {
                None => return None,
                Some(record) if record.status.is_terminal() => return Some(record),
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(execution_id, "Wait for execution timed out");
                return None;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Cancel a running execution. Pending and finished executions are left alone.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let handle = {
            let mut state = self.shared.state.lock();
            let Some(handle) = state.active.remove(execution_id) else {
                debug!(execution_id, "Cancel ignored; execution not running");
                return false;
            };
            if let Some(record) = state.records.get_mut(execution_id) {
                record.mark_cancelled();
            }
            handle
        };
        handle.abort();
        self.shared.wakeup.notify_one();
        info!(execution_id, "Execution cancelled");
        true
    }

    pub fn get_coordinator_status(&self) -> CoordinatorStatus {
        let config = &self.shared.config;
        let state = self.shared.state.lock();
        let mut active_ids: Vec<_> = state.active.keys().cloned().collect();
        active_ids.sort();

        CoordinatorStatus {
            queue_size: state.queue.len(),
            active_executions: state.active.len(),
            tracked_executions: state.records.len(),
            completed_executions: state
                .records
                .values()
                .filter(|r| r.status.is_terminal())
                .count(),
            max_concurrent_executions: config.max_concurrent_executions,
            max_queue_size: config.max_queue_size,
            execution_timeout_seconds: config.execution_timeout.as_secs_f64(),
            active_ids,
            shutting_down: state.shutting_down,
        }
    }

    /// Stop dispatching, cancel everything queued or running, and wait for it.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            let queued: Vec<_> = state.queue.drain(..).map(|job| job.execution_id).collect();
            let active: Vec<_> = state.active.drain().collect();
            for id in queued.iter().chain(active.iter().map(|(id, _)| id)) {
                if let Some(record) = state.records.get_mut(id) {
                    record.mark_cancelled();
                }
            }
            active.into_iter().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.abort();
        }
        let cancelled = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        info!(cancelled, "Admission coordinator stopped");
    }
}

impl Drop for AdmissionCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
