// ABOUTME: The ResourceGovernor - admits tasks under task-count and CPU/memory
// ABOUTME: limits, runs them in their execution context, and samples resource usage.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ConcurrencyTask, ExecutionContext, MonitorContext, ResourceMonitor, SysinfoProbe,
    SystemProbe, SystemSnapshot, TaskSpec, TaskWork, default_monitors,
};
use crate::error::{GovernorError, Result, panic_message};
use crate::execution::{ExecutionStatus, Priority};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// CPU and memory ceilings, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 90.0,
            max_memory_percent: 90.0,
        }
    }
}

/// Configuration for a [`ResourceGovernor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Non-terminal tasks allowed at once.
    pub max_concurrent_tasks: usize,
    /// Thread tasks allowed to run at once.
    pub max_threads: usize,
    /// Process tasks allowed to run at once.
    pub max_processes: usize,
    /// Default deadline for a task; `None` means unbounded.
    pub task_timeout: Option<Duration>,
    pub enable_monitoring: bool,
    pub sample_interval: Duration,
    /// `None` disables the CPU and memory checks.
    pub resource_limits: Option<ResourceLimits>,
    /// Task history entries kept.
    pub history_limit: usize,
    /// Terminal tasks older than this are dropped by the sampling loop.
    pub task_retention: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            max_threads: 20,
            max_processes: 4,
            task_timeout: Some(Duration::from_secs(300)),
            enable_monitoring: true,
            sample_interval: Duration::from_secs(30),
            resource_limits: Some(ResourceLimits::default()),
            history_limit: 1000,
            task_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ResourceConfig {
    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn max_processes(mut self, n: usize) -> Self {
        self.max_processes = n;
        self
    }

    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn enable_monitoring(mut self, enabled: bool) -> Self {
        self.enable_monitoring = enabled;
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn resource_limits(mut self, limits: Option<ResourceLimits>) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn history_limit(mut self, n: usize) -> Self {
        self.history_limit = n;
        self
    }
}

/// One submission as remembered by the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub name: String,
    pub execution_context: ExecutionContext,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate view of tracked tasks and pool capacity.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyStatistics {
    pub tracked_tasks: usize,
    /// Tasks not yet in a terminal state.
    pub active_tasks: usize,
    pub history_size: usize,
    pub status_distribution: HashMap<String, usize>,
    pub context_distribution: HashMap<String, usize>,
    pub priority_distribution: HashMap<String, usize>,
    pub resource_monitors: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub max_threads: usize,
    pub max_processes: usize,
    pub available_threads: usize,
    pub available_processes: usize,
    pub last_sample: Option<SystemSnapshot>,
}

#[derive(Default)]
struct TaskState {
    tasks: HashMap<String, ConcurrencyTask>,
    handles: HashMap<String, JoinHandle<()>>,
    history: VecDeque<TaskHistoryEntry>,
    last_sample: Option<SystemSnapshot>,
    shutting_down: bool,
}

impl TaskState {
    fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Copy a task's current status into its history entry.
    fn sync_history(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        if let Some(entry) = self
            .history
            .iter_mut()
            .rev()
            .find(|e| e.task_id == task_id)
        {
            entry.status = task.status;
            entry.completed_at = task.completed_at;
        }
    }
}

struct Shared {
    config: ResourceConfig,
    probe: Arc<dyn SystemProbe>,
    state: Mutex<TaskState>,
    monitors: RwLock<BTreeMap<String, Arc<dyn ResourceMonitor>>>,
    thread_slots: Arc<Semaphore>,
    process_slots: Arc<Semaphore>,
}

impl Shared {
    fn check_capacity(&self, state: &TaskState) -> Result<()> {
        let active = state.active_count();
        if active >= self.config.max_concurrent_tasks {
            return Err(GovernorError::ResourceExhausted(format!(
                "{} tasks active, limit is {}",
                active, self.config.max_concurrent_tasks
            )));
        }
        Ok(())
    }

    /// Check CPU and memory against a fresh sample. A failed sample refuses admission.
    fn check_system(&self) -> Result<()> {
        let Some(limits) = self.config.resource_limits else {
            return Ok(());
        };
        let sample = match self.probe.sample() {
            Ok(sample) => sample,
            Err(err) => {
                error!(error = %err, "Resource sample failed; refusing admission");
                return Err(GovernorError::ResourceExhausted(format!(
                    "resource sample failed: {:#}",
                    err
                )));
            }
        };
        self.state.lock().last_sample = Some(sample);

        if sample.cpu_percent > limits.max_cpu_percent {
            return Err(GovernorError::ResourceExhausted(format!(
                "CPU usage {:.1}% above {:.1}%",
                sample.cpu_percent, limits.max_cpu_percent
            )));
        }
        if sample.memory_percent > limits.max_memory_percent {
            return Err(GovernorError::ResourceExhausted(format!(
                "memory usage {:.1}% above {:.1}%",
                sample.memory_percent, limits.max_memory_percent
            )));
        }
        Ok(())
    }

    fn mark_running(&self, task_id: &str) {
        let mut state = self.state.lock();
        let started = state
            .tasks
            .get_mut(task_id)
            .is_some_and(|task| task.mark_running());
        if started {
            state.sync_history(task_id);
            debug!(task_id, "Task started");
        }
    }

    fn finish(&self, task_id: &str, outcome: Result<serde_json::Value>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.handles.remove(task_id);
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };

        let moved = match outcome {
            Ok(output) => task.mark_completed(output),
            Err(err) => {
                warn!(task_id, name = %task.name, error = %err, "Task failed");
                task.mark_failed(err.to_string())
            }
        };
        if moved {
            info!(task_id, status = %task.status, "Task finished");
            state.sync_history(task_id);
        }
    }

    fn measure(&self) -> HashMap<String, serde_json::Value> {
        let snapshot = match self.probe.sample() {
            Ok(sample) => Some(sample),
            Err(err) => {
                warn!(error = %err, "Resource sample failed");
                None
            }
        };

        let (system, counts) = {
            let mut state = self.state.lock();
            if snapshot.is_some() {
                state.last_sample = snapshot;
            }
            (state.last_sample.unwrap_or_default(), state.status_counts())
        };

        let monitors: Vec<_> = self
            .monitors
            .read()
            .iter()
            .map(|(name, m)| (name.clone(), Arc::clone(m)))
            .collect();
        let ctx = MonitorContext {
            system: &system,
            status_counts: &counts,
        };

        let mut readings = HashMap::with_capacity(monitors.len());
        for (name, monitor) in monitors {
            match monitor.measure(&ctx) {
                Ok(value) => {
                    readings.insert(name, value);
                }
                Err(err) => {
                    warn!(monitor = %name, error = %err, "Resource monitor failed");
                    readings.insert(name, serde_json::Value::Null);
                }
            }
        }
        readings
    }

    /// Take a sample and attach it to every running task.
    fn collect_metrics(&self) {
        let readings = self.measure();
        let sampled_at = serde_json::Value::from(Utc::now().to_rfc3339());

        let mut state = self.state.lock();
        let mut running = 0;
        for task in state
            .tasks
            .values_mut()
            .filter(|t| t.status == ExecutionStatus::Running)
        {
            for (name, value) in &readings {
                task.resource_usage.insert(name.clone(), value.clone());
            }
            task.resource_usage
                .insert("sampled_at".to_string(), sampled_at.clone());
            running += 1;
        }
        debug!(running, monitors = readings.len(), "Resource sample recorded");
    }

    fn cleanup(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.expired(max_age));
        before - state.tasks.len()
    }
}

async fn with_deadline<F>(timeout: Option<Duration>, work: F) -> Result<serde_json::Value>
where
    F: Future<Output = Result<serde_json::Value>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or(Err(GovernorError::ExecutionTimeout(limit))),
        None => work.await,
    }
}

async fn execute_work(
    shared: &Shared,
    task_id: &str,
    work: TaskWork,
    timeout: Option<Duration>,
) -> Result<serde_json::Value> {
    match work {
        TaskWork::Cooperative(future) => {
            shared.mark_running(task_id);
            let guarded = AssertUnwindSafe(future).catch_unwind().map(|r| match r {
                Ok(result) => result.map_err(GovernorError::from),
                Err(panic) => Err(GovernorError::ExecutionFailure(format!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            });
            with_deadline(timeout, guarded).await
        }
        TaskWork::Thread(f) => {
            let permit = Arc::clone(&shared.thread_slots)
                .acquire_owned()
                .await
                .map_err(|_| GovernorError::ShuttingDown)?;
            shared.mark_running(task_id);
            // A timed-out thread keeps running and holds its slot until it returns.
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                f()
            })
            .map(|r| match r {
                Ok(result) => result.map_err(GovernorError::from),
                Err(err) if err.is_panic() => Err(GovernorError::ExecutionFailure(format!(
                    "task panicked: {}",
                    panic_message(err.into_panic().as_ref())
                ))),
                Err(err) => Err(GovernorError::ExecutionFailure(err.to_string())),
            });
            with_deadline(timeout, joined).await
        }
        TaskWork::Process(command) => {
            let _permit = Arc::clone(&shared.process_slots)
                .acquire_owned()
                .await
                .map_err(|_| GovernorError::ShuttingDown)?;
            shared.mark_running(task_id);
            with_deadline(timeout, async {
                command.run().await.map_err(GovernorError::from)
            })
            .await
        }
    }
}

async fn run_task(shared: Arc<Shared>, task_id: String, work: TaskWork, timeout: Option<Duration>) {
    let outcome = execute_work(&shared, &task_id, work, timeout).await;
    shared.finish(&task_id, outcome);
}

async fn sampling_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(shared.config.sample_interval) => {}
        }
        let tick = std::panic::catch_unwind(AssertUnwindSafe(|| {
            shared.collect_metrics();
            shared.cleanup(shared.config.task_retention)
        }));
        match tick {
            Ok(removed) if removed > 0 => debug!(removed, "Removed expired tasks"),
            Ok(_) => {}
            Err(panic) => error!(error = %panic_message(panic.as_ref()), "Resource sampling failed"),
        }
    }
    debug!("Resource sampling stopped");
}

/// Runs tasks in cooperative, thread, or process contexts under resource limits.
///
/// A task is refused with `ResourceExhausted` when the number of non-terminal
/// tasks has reached `max_concurrent_tasks`, or when a fresh sample shows
/// CPU or memory above the configured limits. A sample that fails to read
/// also refuses the task. Thread and process tasks also
/// wait for a slot in their bounded pool before they start running.
pub struct ResourceGovernor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new(ResourceConfig::default())
    }
}

impl ResourceGovernor {
    /// Create a governor that samples the host through `sysinfo`.
    pub fn new(config: ResourceConfig) -> Self {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    /// Create a governor with a custom system probe.
    pub fn with_probe(config: ResourceConfig, probe: Arc<dyn SystemProbe>) -> Self {
        let monitors = default_monitors()
            .into_iter()
            .map(|(name, monitor)| (name.to_string(), monitor))
            .collect();
        let shared = Arc::new(Shared {
            thread_slots: Arc::new(Semaphore::new(config.max_threads)),
            process_slots: Arc::new(Semaphore::new(config.max_processes)),
            config,
            probe,
            state: Mutex::new(TaskState::default()),
            monitors: RwLock::new(monitors),
        });
        let cancel = CancellationToken::new();

        let sampler = if shared.config.enable_monitoring {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(sampling_loop(Arc::clone(&shared), cancel.clone()))),
                Err(_) => {
                    debug!("No tokio runtime; resource sampling disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            shared,
            cancel,
            sampler: Mutex::new(sampler),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.shared.config
    }

    /// Admit and start a task, returning its id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, spec: TaskSpec) -> Result<String> {
        let TaskSpec {
            name,
            work,
            priority,
            timeout,
            metadata,
        } = spec;
        let context = work.context();
        let timeout = timeout.or(self.shared.config.task_timeout);
        let task_id = format!("task_{}", uuid::Uuid::new_v4().simple());

        if self.shared.state.lock().shutting_down {
            return Err(GovernorError::ShuttingDown);
        }
        if let Err(err) = self.shared.check_system() {
            warn!(name = %name, error = %err, "Task refused");
            return Err(err);
        }

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return Err(GovernorError::ShuttingDown);
        }
        if let Err(err) = self.shared.check_capacity(state) {
            warn!(name = %name, error = %err, "Task refused");
            return Err(err);
        }

        let task = ConcurrencyTask::new(task_id.clone(), name, context, priority, metadata);
        state.history.push_back(TaskHistoryEntry {
            task_id: task_id.clone(),
            name: task.name.clone(),
            execution_context: context,
            priority,
            status: task.status,
            submitted_at: task.created_at,
            completed_at: None,
        });
        while state.history.len() > self.shared.config.history_limit {
            state.history.pop_front();
        }
        info!(task_id = %task_id, name = %task.name, context = %context, "Task submitted");
        state.tasks.insert(task_id.clone(), task);

        let handle = tokio::spawn(run_task(
            Arc::clone(&self.shared),
            task_id.clone(),
            work,
            timeout,
        ));
        state.handles.insert(task_id.clone(), handle);
        Ok(task_id)
    }

    /// Returns an error if a new task would be refused right now.
    pub fn check_resource_limits(&self) -> Result<()> {
        self.shared.check_capacity(&self.shared.state.lock())?;
        self.shared.check_system()
    }

    /// Cancel a task that has not finished. Returns false otherwise.
    pub fn cancel(&self, task_id: &str) -> bool {
        let handle = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let cancelled = state
                .tasks
                .get_mut(task_id)
                .is_some_and(|task| task.mark_cancelled());
            if !cancelled {
                debug!(task_id, "Cancel ignored; task not active");
                return false;
            }
            state.sync_history(task_id);
            state.handles.remove(task_id)
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        info!(task_id, "Task cancelled");
        true
    }

    /// Wait until the task is terminal, or `None` once `timeout` elapses.
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Option<ConcurrencyTask> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.get_task_info(task_id) {
                None => return None,
                Some(task) if task.status.is_terminal() => return Some(task),
                Some(_) => {}
            }
            let mut wait = WAIT_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                wait = wait.min(deadline - now);
            }
            tokio::time::sleep(wait).await;
        }
    }

    pub fn get_task_info(&self, task_id: &str) -> Option<ConcurrencyTask> {
        self.shared.state.lock().tasks.get(task_id).cloned()
    }

    /// All tracked tasks, oldest first.
    pub fn get_all_tasks(&self) -> Vec<ConcurrencyTask> {
        self.select_tasks(|_| true)
    }

    pub fn get_tasks_by_status(&self, status: ExecutionStatus) -> Vec<ConcurrencyTask> {
        self.select_tasks(|t| t.status == status)
    }

    pub fn get_tasks_by_context(&self, context: ExecutionContext) -> Vec<ConcurrencyTask> {
        self.select_tasks(|t| t.execution_context == context)
    }

    fn select_tasks(&self, keep: impl Fn(&ConcurrencyTask) -> bool) -> Vec<ConcurrencyTask> {
        let state = self.shared.state.lock();
        let mut tasks: Vec<_> = state.tasks.values().filter(|t| keep(t)).cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Submission history, oldest first.
    pub fn get_task_history(&self, limit: Option<usize>) -> Vec<TaskHistoryEntry> {
        let state = self.shared.state.lock();
        let skip = limit.map_or(0, |n| state.history.len().saturating_sub(n));
        state.history.iter().skip(skip).cloned().collect()
    }

    /// A fresh reading from every registered monitor.
    pub fn get_resource_metrics(&self) -> HashMap<String, serde_json::Value> {
        self.shared.measure()
    }

    /// Take a sample now and attach it to running tasks.
    pub fn sample_now(&self) {
        self.shared.collect_metrics();
    }

    pub fn get_concurrency_statistics(&self) -> ConcurrencyStatistics {
        let config = &self.shared.config;
        let resource_monitors = self.shared.monitors.read().keys().cloned().collect();
        let state = self.shared.state.lock();

        let mut context_distribution = HashMap::new();
        let mut priority_distribution = HashMap::new();
        for task in state.tasks.values() {
            *context_distribution
                .entry(task.execution_context.to_string())
                .or_insert(0) += 1;
            *priority_distribution
                .entry(task.priority.to_string())
                .or_insert(0) += 1;
        }

        ConcurrencyStatistics {
            tracked_tasks: state.tasks.len(),
            active_tasks: state.active_count(),
            history_size: state.history.len(),
            status_distribution: state.status_counts(),
            context_distribution,
            priority_distribution,
            resource_monitors,
            max_concurrent_tasks: config.max_concurrent_tasks,
            max_threads: config.max_threads,
            max_processes: config.max_processes,
            available_threads: self.shared.thread_slots.available_permits(),
            available_processes: self.shared.process_slots.available_permits(),
            last_sample: state.last_sample,
        }
    }

    /// Add or replace a named monitor.
    pub fn register_resource_monitor(&self, name: &str, monitor: Arc<dyn ResourceMonitor>) {
        self.shared
            .monitors
            .write()
            .insert(name.to_string(), monitor);
        info!(monitor = name, "Resource monitor registered");
    }

    /// Returns true if a monitor was registered under `name`.
    pub fn unregister_resource_monitor(&self, name: &str) -> bool {
        let removed = self.shared.monitors.write().remove(name).is_some();
        if removed {
            info!(monitor = name, "Resource monitor unregistered");
        }
        removed
    }

    /// Drop terminal tasks finished more than `max_age` ago. Returns how many were dropped.
    pub fn cleanup_completed_tasks(&self, max_age: Duration) -> usize {
        let removed = self.shared.cleanup(max_age);
        if removed > 0 {
            info!(removed, "Cleaned up completed tasks");
        }
        removed
    }

    /// Stop sampling, cancel every unfinished task, and wait for them.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sampler = self.sampler.lock().take();
        if let Some(handle) = sampler {
            let _ = handle.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;

            let unfinished: Vec<String> = state
                .tasks
                .iter_mut()
                .filter_map(|(id, task)| task.mark_cancelled().then(|| id.clone()))
                .collect();
            for id in &unfinished {
                state.sync_history(id);
            }
            state.handles.drain().map(|(_, handle)| handle).collect()
        };

        self.shared.thread_slots.close();
        self.shared.process_slots.close();
        for handle in &handles {
            handle.abort();
        }
        let cancelled = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        info!(cancelled, "Resource governor stopped");
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
