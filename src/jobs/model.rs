//! Job and task data model, plus the wire shapes for job submission.

use std::collections::HashMap;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob::BlobRef;
use crate::error::Error;
use crate::runners::model::RunnerCapabilities;

pub use super::state::{JobStatus, TaskStatus};

/// How a task is executed on the agent. One payload shape per mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run `command` through the platform's default interpreter.
    Shell { command: String },
    /// Run a file from the task directory directly.
    Binary {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run `command` inside `image` with the task directory mounted.
    #[serde(alias = "docker")]
    Container {
        image: String,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        privileged: bool,
    },
}

/// Mode discriminant, used for runner capability matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Shell,
    Binary,
    Container,
}

impl ExecutionMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Self::Shell { .. } => ModeKind::Shell,
            Self::Binary { .. } => ModeKind::Binary,
            Self::Container { .. } => ModeKind::Container,
        }
    }
}

/// Everything the agent needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(flatten)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Subdirectory of the task directory to run in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Zero means no deadline.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Blob ids fetched into the task directory before execution.
    #[serde(default)]
    pub required_file_ids: Vec<Uuid>,
    /// Runner labels this task requires (all must match).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl TaskSpec {
    /// Create a shell task spec.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(ExecutionMode::Shell {
            command: command.into(),
        })
    }

    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: 0,
            required_file_ids: Vec::new(),
            labels: HashMap::new(),
        }
    }

    /// Builder: set the timeout.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Builder: add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builder: set the working subdirectory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Builder: require input files.
    pub fn with_files(mut self, ids: Vec<Uuid>) -> Self {
        self.required_file_ids = ids;
        self
    }

    /// Reject malformed tasks before they reach the queue.
    pub fn validate(&self) -> Result<(), Error> {
        match &self.mode {
            ExecutionMode::Shell { command } => {
                if command.trim().is_empty() {
                    return Err(Error::Validation("shell command must not be empty".into()));
                }
            }
            ExecutionMode::Binary { command, .. } => {
                if command.trim().is_empty() {
                    return Err(Error::Validation("binary command must not be empty".into()));
                }
                ensure_relative("binary command", command)?;
            }
            ExecutionMode::Container { image, .. } => {
                if image.trim().is_empty() {
                    return Err(Error::Validation("container image must not be empty".into()));
                }
            }
        }
        if let Some(dir) = &self.working_dir {
            ensure_relative("working_dir", dir)?;
        }
        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(Error::Validation(
                "environment variable names must be non-empty and contain no '='".into(),
            ));
        }
        Ok(())
    }

    /// Whether a runner with `caps` can run this task.
    pub fn satisfied_by(&self, caps: &RunnerCapabilities) -> bool {
        caps.modes.contains(&self.mode.kind())
            && self
                .labels
                .iter()
                .all(|(k, v)| caps.labels.get(k) == Some(v))
    }
}

/// Reject absolute paths and parent traversal.
fn ensure_relative(field: &str, raw: &str) -> Result<(), Error> {
    let path = Path::new(raw);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::Validation(format!(
            "{field} must be a relative path inside the task directory: {raw}"
        )));
    }
    Ok(())
}

/// What happens to the rest of a job when one task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failed task fails the job and cancels the remainder.
    #[default]
    FailFast,
    /// Keep running; the job fails only once every task is terminal.
    Continue,
}

/// Job submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Overrides the configured reassignment bound for this job.
    #[serde(default)]
    pub max_retries: Option<u32>,
    pub tasks: Vec<TaskSpec>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            failure_policy: FailurePolicy::default(),
            max_retries: None,
            tasks,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("job name must not be empty".into()));
        }
        if self.tasks.is_empty() {
            return Err(Error::Validation("job must contain at least one task".into()));
        }
        for (i, task) in self.tasks.iter().enumerate() {
            task.validate()
                .map_err(|e| Error::Validation(format!("task {i}: {}", strip_prefix(&e))))?;
        }
        Ok(())
    }
}

fn strip_prefix(err: &Error) -> String {
    match err {
        Error::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// A submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: JobStatus,
    pub failure_policy: FailurePolicy,
    pub max_retries: u32,
    /// Task ids in submission order.
    pub task_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Captured process output excerpts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl TaskOutput {
    /// Largest excerpt kept per stream.
    pub const MAX_BYTES: usize = 64 * 1024;

    /// Bytes kept from each end of an over-long stream. The rest of
    /// [`Self::MAX_BYTES`] is left for the truncation marker, so an excerpt
    /// never exceeds the cap and excerpting twice changes nothing.
    pub const KEEP_EACH_END: usize = (Self::MAX_BYTES - 64) / 2;

    /// Keep the head and tail of `s` when it exceeds [`Self::MAX_BYTES`].
    pub fn excerpt(s: &str) -> String {
        if s.len() <= Self::MAX_BYTES {
            return s.to_string();
        }
        let head_end = floor_char_boundary(s, Self::KEEP_EACH_END);
        let tail_start = floor_char_boundary(s, s.len() - Self::KEEP_EACH_END);
        Self::truncated(&s[..head_end], tail_start - head_end, &s[tail_start..])
    }

    /// Join a head and tail around a marker naming the bytes dropped between.
    pub fn truncated(head: &str, dropped: usize, tail: &str) -> String {
        format!("{head}\n\n... [truncated {dropped} bytes] ...\n\n{tail}")
    }
}

/// Largest byte index <= `i` on a char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut end = i;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// The smallest schedulable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Monotonic creation sequence; claims are FIFO on this.
    pub seq: u64,
    pub runner_id: Option<Uuid>,
    pub status: TaskStatus,
    pub spec: TaskSpec,
    /// Times this task went back to Pending after losing its runner.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: TaskOutput,
    #[serde(default)]
    pub artifacts: Vec<BlobRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(job_id: Uuid, seq: u64, spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            seq,
            runner_id: None,
            status: TaskStatus::Pending,
            spec,
            attempts: 0,
            exit_code: None,
            error: None,
            output: TaskOutput::default(),
            artifacts: Vec::new(),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Captured output of one task, as served by the log endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogs {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl From<&Task> for TaskLogs {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            exit_code: task.exit_code,
            error: task.error.clone(),
            stdout: task.output.stdout.clone(),
            stderr: task.output.stderr.clone(),
        }
    }
}

/// What a runner receives when it claims a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub spec: TaskSpec,
}

/// Task status report from a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub runner_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl StatusReport {
    pub fn new(runner_id: Uuid, status: TaskStatus) -> Self {
        Self {
            runner_id,
            status,
            exit_code: None,
            error: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Job plus its tasks, for detail views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub tasks: Vec<Task>,
}

/// One page of the job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Matching jobs before pagination.
    pub total: usize,
}

/// Per-status counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub jobs: HashMap<String, usize>,
    pub tasks: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_is_a_tagged_variant() {
        let spec: TaskSpec = serde_json::from_value(serde_json::json!({
            "mode": "shell",
            "command": "echo hi",
            "timeout_seconds": 5
        }))
        .unwrap();
        assert_eq!(
            spec.mode,
            ExecutionMode::Shell {
                command: "echo hi".into()
            }
        );
        assert_eq!(spec.timeout_seconds, 5);
    }

    #[test]
    fn docker_is_an_alias_for_container() {
        let spec: TaskSpec = serde_json::from_value(serde_json::json!({
            "mode": "docker",
            "image": "alpine:3",
            "command": "ls",
            "privileged": true
        }))
        .unwrap();
        assert_eq!(spec.mode.kind(), ModeKind::Container);
    }

    #[test]
    fn unknown_mode_is_rejected_at_parse_time() {
        let result: Result<TaskSpec, _> = serde_json::from_value(serde_json::json!({
            "mode": "powershell",
            "command": "dir"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_escaping_paths() {
        let spec = TaskSpec::new(ExecutionMode::Binary {
            command: "../evil".into(),
            args: vec![],
        });
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));

        let spec = TaskSpec::shell("ls").with_working_dir("/etc");
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));

        let spec = TaskSpec::shell("ls").with_working_dir("sub/dir");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn job_spec_requires_name_and_tasks() {
        assert!(JobSpec::new("", vec![TaskSpec::shell("ls")]).validate().is_err());
        assert!(JobSpec::new("j", vec![]).validate().is_err());

        let err = JobSpec::new("j", vec![TaskSpec::shell("  ")])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("task 0"));
    }

    #[test]
    fn excerpt_keeps_head_and_tail_on_char_boundaries() {
        let short = "hello";
        assert_eq!(TaskOutput::excerpt(short), short);

        let long = format!("{}{}", "é".repeat(TaskOutput::MAX_BYTES), "END");
        let cut = TaskOutput::excerpt(&long);
        assert!(cut.len() < long.len());
        assert!(cut.contains("[truncated"));
        assert!(cut.ends_with("END"));
        assert!(cut.starts_with('é'));
        assert!(cut.len() <= TaskOutput::MAX_BYTES);
        assert_eq!(TaskOutput::excerpt(&cut), cut);
    }

    #[test]
    fn capability_matching() {
        let mut caps = RunnerCapabilities::default();
        let mut spec = TaskSpec::shell("ls");
        assert!(spec.satisfied_by(&caps));

        spec.labels.insert("gpu".into(), "yes".into());
        assert!(!spec.satisfied_by(&caps));
        caps.labels.insert("gpu".into(), "yes".into());
        assert!(spec.satisfied_by(&caps));

        let container = TaskSpec::new(ExecutionMode::Container {
            image: "alpine".into(),
            command: None,
            args: vec![],
            privileged: false,
        });
        assert!(!container.satisfied_by(&caps));
        caps.modes.push(ModeKind::Container);
        assert!(container.satisfied_by(&caps));
    }
}
