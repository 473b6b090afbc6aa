// ABOUTME: Task model for the resource governor: what a task runs (cooperative,
// ABOUTME: blocking thread, or external process) and its tracked lifecycle.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::execution::{ExecutionStatus, Priority};
use crate::tool::Parameters;

/// What a task produces.
pub type TaskResult = anyhow::Result<serde_json::Value>;

/// Where a task's work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// On the async runtime.
    Cooperative,
    /// On the bounded blocking pool.
    Thread,
    /// As a child process, bounded by the process pool.
    Process,
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionContext::Cooperative => write!(f, "cooperative"),
            ExecutionContext::Thread => write!(f, "thread"),
            ExecutionContext::Process => write!(f, "process"),
        }
    }
}

/// An external command run as a process task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            current_dir: None,
        }
    }

    /// Run `command` through the platform shell.
    /// Uses `bash -c` on Unix and `cmd.exe /C` on Windows.
    pub fn shell(command: impl Into<String>) -> Self {
        if cfg!(target_os = "windows") {
            Self::new("cmd.exe").arg("/C").arg(command)
        } else {
            Self::new("bash").arg("-c").arg(command)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Run to completion. A non-zero exit is an error carrying stderr.
    ///
    /// The child is killed if the returned future is dropped.
    pub(crate) async fn run(&self) -> TaskResult {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run '{}'", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            anyhow::bail!(
                "'{}' exited with code {}: {}",
                self.program,
                code,
                stderr.trim()
            );
        }
        Ok(serde_json::json!({
            "exit_code": code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// The work a task performs. The variant fixes the execution context.
pub enum TaskWork {
    Cooperative(BoxFuture<'static, TaskResult>),
    Thread(Box<dyn FnOnce() -> TaskResult + Send + 'static>),
    Process(ProcessCommand),
}

impl TaskWork {
    pub fn context(&self) -> ExecutionContext {
        match self {
            TaskWork::Cooperative(_) => ExecutionContext::Cooperative,
            TaskWork::Thread(_) => ExecutionContext::Thread,
            TaskWork::Process(_) => ExecutionContext::Process,
        }
    }
}

impl std::fmt::Debug for TaskWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskWork::Process(cmd) => f.debug_tuple("Process").field(cmd).finish(),
            other => write!(f, "{}", other.context()),
        }
    }
}

/// A task submission.
#[derive(Debug)]
pub struct TaskSpec {
    pub name: String,
    pub work: TaskWork,
    pub priority: Priority,
    /// Overrides the governor's default task timeout.
    pub timeout: Option<Duration>,
    pub metadata: Parameters,
}

impl TaskSpec {
    fn with_work(name: impl Into<String>, work: TaskWork) -> Self {
        Self {
            name: name.into(),
            work,
            priority: Priority::default(),
            timeout: None,
            metadata: Parameters::new(),
        }
    }

    /// A task that runs `future` on the async runtime.
    pub fn cooperative<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        Self::with_work(name, TaskWork::Cooperative(Box::pin(future)))
    }

    /// A task that runs blocking `f` on the thread pool.
    pub fn thread<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Self::with_work(name, TaskWork::Thread(Box::new(f)))
    }

    /// A task that runs `command` as a child process.
    pub fn process(name: impl Into<String>, command: ProcessCommand) -> Self {
        Self::with_work(name, TaskWork::Process(command))
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}

/// A tracked task.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyTask {
    pub task_id: String,
    pub name: String,
    pub execution_context: ExecutionContext,
    pub status: ExecutionStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest monitor readings, refreshed while the task runs.
    pub resource_usage: HashMap<String, serde_json::Value>,
    pub metadata: Parameters,
    /// Value produced by a completed task.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,

    #[serde(skip)]
    pub(crate) finished: Option<Instant>,
}

impl ConcurrencyTask {
    pub(crate) fn new(
        task_id: String,
        name: String,
        execution_context: ExecutionContext,
        priority: Priority,
        metadata: Parameters,
    ) -> Self {
        Self {
            task_id,
            name,
            execution_context,
            status: ExecutionStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            resource_usage: HashMap::new(),
            metadata,
            output: None,
            error: None,
            finished: None,
        }
    }

    fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.finished = Some(Instant::now());
        }
        true
    }

    pub(crate) fn mark_running(&mut self) -> bool {
        let moved = self.transition(ExecutionStatus::Running);
        if moved {
            self.started_at = Some(Utc::now());
        }
        moved
    }

    pub(crate) fn mark_completed(&mut self, output: serde_json::Value) -> bool {
        let moved = self.transition(ExecutionStatus::Completed);
        if moved {
            self.output = Some(output);
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

    /// Finished long enough ago to be dropped.
    pub(crate) fn expired(&self, max_age: Duration) -> bool {
        self.status.is_terminal() && self.finished.is_some_and(|t| t.elapsed() > max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builders() {
        let spec = TaskSpec::thread("hash", || Ok(serde_json::json!(1)))
            .priority(Priority(3))
            .timeout(Duration::from_secs(5))
            .metadata("owner", "coder");

        assert_eq!(spec.work.context(), ExecutionContext::Thread);
        assert_eq!(spec.priority, Priority(3));
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert_eq!(spec.metadata["owner"], "coder");

        let spec = TaskSpec::process("ls", ProcessCommand::new("ls").arg("-l"));
        assert_eq!(spec.work.context(), ExecutionContext::Process);
        assert!(format!("{:?}", spec.work).contains("ls"));
    }

    #[test]
    fn test_shell_command() {
        let cmd = ProcessCommand::shell("echo hi");
        assert_eq!(cmd.args.last().map(String::as_str), Some("echo hi"));
    }

    #[test]
    fn test_task_lifecycle() {
        let mut task = ConcurrencyTask::new(
            "task_1".to_string(),
            "t".to_string(),
            ExecutionContext::Cooperative,
            Priority::default(),
            Parameters::new(),
        );

        assert!(!task.expired(Duration::ZERO));
        assert!(task.mark_running());
        assert!(task.mark_completed(serde_json::json!("done")));
        assert!(!task.mark_cancelled());
        assert_eq!(task.status, ExecutionStatus::Completed);
        assert_eq!(task.output, Some(serde_json::json!("done")));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_process_failure_carries_stderr() {
        let err = ProcessCommand::shell("echo oops >&2; exit 3")
            .run()
            .await
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("code 3"), "unexpected error: {}", msg);
        assert!(msg.contains("oops"), "unexpected error: {}", msg);
    }

    #[tokio::test]
    async fn test_process_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let output = ProcessCommand::shell("ls")
            .current_dir(dir.path())
            .run()
            .await
            .unwrap();
        assert_eq!(output["exit_code"], 0);
        assert!(output["stdout"].as_str().unwrap().contains("marker.txt"));
    }
}
