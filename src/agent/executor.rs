//! Task executor: runs one task spec as a child process.
//!
//! Each mode builds a `tokio::process::Command`; the run loop is shared. The
//! child is started in its own process group on unix so a timeout or a
//! cancellation takes down everything it spawned, not just the shell.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::jobs::model::{ExecutionMode, TaskOutput, TaskSpec, TaskStatus};

/// Exit code reported when the task exceeded its timeout.
pub const EXIT_TIMEOUT: i32 = -1;
/// Exit code reported when the task was cancelled.
pub const EXIT_CANCELLED: i32 = -2;
/// Exit code reported when the process died from a signal.
pub const EXIT_SIGNALED: i32 = -3;

/// Mount point of the task directory inside containers.
const CONTAINER_WORKDIR: &str = "/work";

/// How long to wait for output pipes to drain after the process is gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    /// Final task status implied by the exit code.
    pub fn status(&self) -> TaskStatus {
        match self.exit_code {
            0 => TaskStatus::Succeeded,
            EXIT_TIMEOUT => TaskStatus::TimedOut,
            EXIT_CANCELLED => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }
}

/// Triggers cancellation of one execution.
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

/// Observed by the executor; resolves once the handle fires.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

/// Create a linked handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until cancelled. Never resolves if the handle is dropped unfired.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs task specs inside their task directories.
#[derive(Debug, Clone)]
pub struct Executor {
    container_runtime: String,
}

impl Executor {
    pub fn new(container_runtime: impl Into<String>) -> Self {
        Self {
            container_runtime: container_runtime.into(),
        }
    }

    /// Run `spec` in `task_dir` until it exits, times out or is cancelled.
    ///
    /// Launch failures are errors; everything after a successful spawn is
    /// reported through the result's exit code.
    pub async fn execute(
        &self,
        task_id: Uuid,
        spec: &TaskSpec,
        task_dir: &Path,
        mut cancel: CancelSignal,
    ) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        let container_name = format!("borg-task-{}", task_id.simple());
        let mut command = self.build_command(spec, task_dir, &container_name).await?;
        command
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let mut child = command.spawn().map_err(|e| match (&spec.mode, e.kind()) {
            (ExecutionMode::Container { .. }, std::io::ErrorKind::NotFound) => {
                ExecutionError::RuntimeUnavailable(self.container_runtime.clone())
            }
            _ => ExecutionError::LaunchFailed {
                program: program.clone(),
                reason: e.to_string(),
            },
        })?;
        info!(task_id = %task_id, program = %program, pid = ?child.id(), "Task process started");

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s)));

        let timeout = (spec.timeout_seconds > 0).then(|| Duration::from_secs(spec.timeout_seconds));
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = deadline => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let (exit_code, error) = match outcome {
            Outcome::Exited(status) => match status.code() {
                Some(code) => (code, None),
                None => (EXIT_SIGNALED, Some(format!("process terminated: {status}"))),
            },
            Outcome::TimedOut => {
                warn!(task_id = %task_id, timeout = ?timeout, "Task timed out, killing");
                self.terminate(&mut child, spec, &container_name).await;
                (
                    EXIT_TIMEOUT,
                    Some(format!("timed out after {}s", spec.timeout_seconds)),
                )
            }
            Outcome::Cancelled => {
                info!(task_id = %task_id, "Task cancelled, killing");
                self.terminate(&mut child, spec, &container_name).await;
                (EXIT_CANCELLED, Some("cancelled".to_string()))
            }
        };

        let result = ExecutionResult {
            exit_code,
            error,
            stdout: collect_output(stdout).await,
            stderr: collect_output(stderr).await,
            duration: started.elapsed(),
        };
        debug!(task_id = %task_id, exit_code, duration = ?result.duration, "Task process finished");
        Ok(result)
    }

    async fn build_command(
        &self,
        spec: &TaskSpec,
        task_dir: &Path,
        container_name: &str,
    ) -> Result<Command, ExecutionError> {
        let workdir = match &spec.working_dir {
            Some(sub) => task_dir.join(sub),
            None => task_dir.to_path_buf(),
        };

        let mut command = match &spec.mode {
            ExecutionMode::Shell { command } => {
                let mut c = if cfg!(target_os = "windows") {
                    let mut c = Command::new("cmd");
                    c.args(["/C", command.as_str()]);
                    c
                } else {
                    let mut c = Command::new("sh");
                    c.args(["-c", command.as_str()]);
                    c
                };
                c.current_dir(&workdir);
                c
            }
            ExecutionMode::Binary { command, args } => {
                let binary = prepare_binary(task_dir, command).await?;
                let mut c = Command::new(binary);
                c.args(args).current_dir(&workdir);
                c
            }
            ExecutionMode::Container {
                image,
                command,
                args,
                privileged,
            } => {
                if image.trim().is_empty() {
                    return Err(ExecutionError::InvalidSpec("container image is empty".into()));
                }
                let mut c = Command::new(&self.container_runtime);
                c.args(container_args(
                    spec,
                    task_dir,
                    container_name,
                    image,
                    command.as_deref(),
                    args,
                    *privileged,
                ));
                c.current_dir(task_dir);
                c
            }
        };

        if !tokio::fs::metadata(&workdir).await.is_ok_and(|m| m.is_dir()) {
            return Err(ExecutionError::InvalidSpec(format!(
                "working directory does not exist: {}",
                workdir.display()
            )));
        }
        command.env("BORG_TASK_DIR", task_dir);
        Ok(command)
    }

    /// Kill the process tree and, for containers, the container itself.
    async fn terminate(&self, child: &mut Child, spec: &TaskSpec, container_name: &str) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // Negative pid targets the whole process group.
                let group = format!("-{pid}");
                let _ = Command::new("kill")
                    .args(["-s", "KILL", "--", group.as_str()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Child already gone");
        }
        if matches!(spec.mode, ExecutionMode::Container { .. }) {
            let stopped = Command::new(&self.container_runtime)
                .args(["kill", container_name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = stopped {
                warn!(container = container_name, error = %e, "Failed to kill container");
            }
        }
    }
}

/// Resolve a binary inside the task directory and make it executable.
async fn prepare_binary(task_dir: &Path, command: &str) -> Result<PathBuf, ExecutionError> {
    let path = task_dir.join(command);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(ExecutionError::BinaryNotFound(path)),
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(path)
}

fn container_args(
    spec: &TaskSpec,
    task_dir: &Path,
    container_name: &str,
    image: &str,
    command: Option<&str>,
    args: &[String],
    privileged: bool,
) -> Vec<String> {
    let workdir = match &spec.working_dir {
        Some(sub) => format!("{CONTAINER_WORKDIR}/{}", sub.trim_start_matches("./")),
        None => CONTAINER_WORKDIR.to_string(),
    };
    let mut out = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "-v".to_string(),
        format!("{}:{CONTAINER_WORKDIR}", task_dir.display()),
        "-w".to_string(),
        workdir,
    ];
    let mut env: Vec<_> = spec.env.iter().collect();
    env.sort();
    for (key, value) in env {
        out.push("-e".to_string());
        out.push(format!("{key}={value}"));
    }
    if privileged {
        out.push("--privileged".to_string());
    }
    out.push(image.to_string());
    if let Some(command) = command.filter(|c| !c.is_empty()) {
        out.push(command.to_string());
    }
    out.extend(args.iter().cloned());
    out
}

/// Read a pipe to the end, keeping its first and last
/// `TaskOutput::KEEP_EACH_END` bytes. The middle of a longer stream is
/// replaced by a truncation marker, so the final lines always survive.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let keep = TaskOutput::KEEP_EACH_END;
    let mut head = Vec::new();
    let mut tail = VecDeque::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let to_head = n.min(keep - head.len());
                head.extend_from_slice(&buf[..to_head]);
                tail.extend(&buf[to_head..n]);
                let overflow = tail.len().saturating_sub(keep);
                tail.drain(..overflow);
                dropped += overflow;
            }
        }
    }
    let tail: Vec<u8> = tail.into();
    if dropped == 0 {
        head.extend_from_slice(&tail);
        return String::from_utf8_lossy(&head).into_owned();
    }
    TaskOutput::truncated(
        &String::from_utf8_lossy(&head),
        dropped,
        &String::from_utf8_lossy(&tail),
    )
}

async fn collect_output(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_GRACE, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild outside the process group still holds the pipe.
            handle.abort();
            String::new()
        }
    }
}
