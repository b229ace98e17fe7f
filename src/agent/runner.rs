//! The agent poll loop: claim, prepare, execute, report.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::MothershipClient;
use super::downloader::Downloader;
use super::executor::{CancelHandle, CancelSignal, ExecutionResult, Executor, cancel_pair};
use super::resources::ResourceDetector;
use super::uploader::Uploader;
use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::jobs::model::{ModeKind, StatusReport, TaskAssignment, TaskStatus};
use crate::runners::model::{
    RegisterRequest, RegisterResponse, RunnerCapabilities, RunnerResources,
};

/// How long shutdown waits for cancelled tasks to report.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Attempts at delivering a final status.
const FINAL_REPORT_ATTEMPTS: u32 = 3;

/// Cancel handles of the tasks currently executing on this agent.
#[derive(Default)]
pub struct ActiveTasks {
    tasks: RwLock<HashMap<Uuid, CancelHandle>>,
}

impl ActiveTasks {
    pub async fn insert(&self, task_id: Uuid, handle: CancelHandle) {
        self.tasks.write().await.insert(task_id, handle);
    }

    pub async fn remove(&self, task_id: Uuid) {
        self.tasks.write().await.remove(&task_id);
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Fire the cancel handle of `task_id`. False if it is not running here.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        match self.tasks.read().await.get(&task_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let tasks = self.tasks.read().await;
        for handle in tasks.values() {
            handle.cancel();
        }
        tasks.len()
    }
}

/// A registered agent and everything it needs to run tasks.
pub struct Agent {
    config: AgentConfig,
    client: Arc<MothershipClient>,
    executor: Executor,
    downloader: Downloader,
    uploader: Uploader,
    resources: Arc<ResourceDetector>,
    active: Arc<ActiveTasks>,
    slots: Arc<Semaphore>,
}

impl Agent {
    pub fn new(config: AgentConfig, client: Arc<MothershipClient>) -> Self {
        Self {
            executor: Executor::new(config.container_runtime.clone()),
            downloader: Downloader::new(client.clone(), config.download_timeout),
            uploader: Uploader::new(client.clone()),
            resources: Arc::new(ResourceDetector::new(
                config.work_dir.clone(),
                config.public_ip_urls.clone(),
            )),
            active: Arc::new(ActiveTasks::default()),
            slots: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            client,
            config,
        }
    }

    pub fn active(&self) -> Arc<ActiveTasks> {
        self.active.clone()
    }

    pub fn client(&self) -> Arc<MothershipClient> {
        self.client.clone()
    }

    pub fn resources(&self) -> Arc<ResourceDetector> {
        self.resources.clone()
    }

    /// The registration body describing this machine. Resources are filled
    /// in by [`Agent::register`].
    pub fn registration(&self) -> RegisterRequest {
        let mut modes = vec![ModeKind::Shell, ModeKind::Binary];
        if !self.config.container_runtime.trim().is_empty() {
            modes.push(ModeKind::Container);
        }
        RegisterRequest {
            name: self.config.name.clone(),
            token: self.config.token.expose_secret().to_string(),
            device_id: Some(
                self.config
                    .device_id
                    .clone()
                    .unwrap_or_else(|| detect_device_id(&self.config.name)),
            ),
            hostname: crate::config::hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            capabilities: RunnerCapabilities {
                modes,
                labels: self.config.labels.clone(),
                max_concurrent_tasks: self.config.max_concurrent_tasks,
            },
            resources: RunnerResources::default(),
        }
    }

    pub async fn register(&self) -> Result<RegisterResponse, TransportError> {
        let mut request = self.registration();
        request.resources = self.resources.detect().await;
        let resp = self.client.register(&request).await?;
        info!(
            runner_id = %resp.runner_id,
            name = %self.config.name,
            slots = self.config.max_concurrent_tasks,
            "Registered with mothership"
        );
        Ok(resp)
    }

    /// Poll for work until `shutdown` fires, then cancel what is running and
    /// wait for it to report.
    pub async fn run(self: Arc<Self>, runner_id: Uuid, mut shutdown: watch::Receiver<bool>) {
        fs_prepare(&self.config.work_dir).await;
        let mut running = JoinSet::new();

        loop {
            // Reap finished units so the set does not grow unbounded.
            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Task unit panicked");
                }
            }

            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let claimed = self.client.next_task(runner_id).await;
            let assignment = match claimed {
                Ok(Some(assignment)) => assignment,
                Ok(None) => {
                    drop(permit);
                    if wait_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!(runner_id = %runner_id, error = %e, "Polling for work failed");
                    if wait_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            info!(
                task_id = %assignment.task_id,
                job = %assignment.job_name,
                mode = ?assignment.spec.mode.kind(),
                "Task claimed"
            );
            let agent = self.clone();
            running.spawn(async move {
                agent.run_task(runner_id, assignment).await;
                drop(permit);
            });
        }

        let cancelled = self.active.cancel_all().await;
        info!(cancelled, "Shutting down; waiting for running tasks");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = running.len(), "Tasks did not finish within the shutdown grace period");
            running.abort_all();
        }
    }

    /// One task, start to finish. Never returns an error: every failure is
    /// reported to the control plane as the task's outcome.
    pub async fn run_task(&self, runner_id: Uuid, assignment: TaskAssignment) {
        let task_id = assignment.task_id;
        let task_dir = self.config.work_dir.join(task_id.to_string());
        let (handle, signal) = cancel_pair();
        self.active.insert(task_id, handle).await;

        let outcome = self.prepare_and_execute(runner_id, &assignment, &task_dir, signal).await;
        if let Some(report) = outcome {
            self.report_final(task_id, report).await;
        }

        self.active.remove(task_id).await;
        if !self.config.keep_task_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&task_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task_id = %task_id, dir = %task_dir.display(), error = %e, "Failed to clean task directory");
                }
            }
        }
    }

    /// Returns the final report to send, or `None` when the control plane
    /// no longer considers this runner the owner.
    async fn prepare_and_execute(
        &self,
        runner_id: Uuid,
        assignment: &TaskAssignment,
        task_dir: &Path,
        signal: CancelSignal,
    ) -> Option<StatusReport> {
        let task_id = assignment.task_id;
        let spec = &assignment.spec;

        if let Err(e) = tokio::fs::create_dir_all(task_dir).await {
            return Some(
                StatusReport::new(runner_id, TaskStatus::Failed)
                    .with_error(format!("cannot create task directory: {e}")),
            );
        }

        if let Err(e) = self
            .downloader
            .fetch_all(task_id, &spec.required_file_ids, task_dir)
            .await
        {
            return Some(
                StatusReport::new(runner_id, TaskStatus::Failed)
                    .with_error(format!("input download failed: {e}")),
            );
        }

        match self
            .client
            .report_status(task_id, &StatusReport::new(runner_id, TaskStatus::Running))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() || e.is_not_found() => {
                warn!(task_id = %task_id, error = %e, "Task no longer ours; abandoning");
                return None;
            }
            // The final report still goes out; the control plane accepts
            // Assigned -> terminal.
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to report running"),
        }

        let result = match self.executor.execute(task_id, spec, task_dir, signal).await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Task could not be launched");
                return Some(
                    StatusReport::new(runner_id, TaskStatus::Failed).with_error(e.to_string()),
                );
            }
        };
        log_result(task_id, &result);

        let artifacts = self.uploader.upload_all(task_id, task_dir).await;
        if !artifacts.is_empty() {
            debug!(task_id = %task_id, count = artifacts.len(), "Artifacts attached");
        }

        let mut report = StatusReport::new(runner_id, result.status()).with_exit_code(result.exit_code);
        report.stdout = Some(result.stdout);
        report.stderr = Some(result.stderr);
        if let Some(error) = result.error {
            report = report.with_error(error);
        }
        Some(report)
    }

    async fn report_final(&self, task_id: Uuid, report: StatusReport) {
        for attempt in 1..=FINAL_REPORT_ATTEMPTS {
            match self.client.report_status(task_id, &report).await {
                Ok(()) => {
                    debug!(task_id = %task_id, status = %report.status, "Final status reported");
                    return;
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    warn!(task_id = %task_id, error = %e, "Final status rejected");
                    return;
                }
                Err(e) => {
                    warn!(task_id = %task_id, attempt, error = %e, "Final status report failed");
                    if attempt < FINAL_REPORT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }
        error!(task_id = %task_id, "Giving up on final status report");
    }
}

fn log_result(task_id: Uuid, result: &ExecutionResult) {
    let status = result.status();
    if status == TaskStatus::Succeeded {
        info!(task_id = %task_id, duration_ms = result.duration.as_millis() as u64, "Task succeeded");
    } else {
        warn!(
            task_id = %task_id,
            status = %status,
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "Task did not succeed"
        );
    }
}

async fn fs_prepare(work_dir: &Path) {
    if let Err(e) = tokio::fs::create_dir_all(work_dir).await {
        warn!(dir = %work_dir.display(), error = %e, "Cannot create work directory");
    }
}

/// Sleep for `delay`; true if shutdown fired first.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}

/// Stable machine identity: `/etc/machine-id` where present, else `fallback`.
fn detect_device_id(fallback: &str) -> String {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(config: AgentConfig) -> Agent {
        let client = MothershipClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        Agent::new(config, Arc::new(client))
    }

    #[test]
    fn registration_advertises_config() {
        let mut config = AgentConfig {
            name: "rig-7".into(),
            device_id: Some("dev-7".into()),
            max_concurrent_tasks: 3,
            ..AgentConfig::default()
        };
        config.labels.insert("gpu".into(), "a100".into());
        let req = agent(config).registration();

        assert_eq!(req.name, "rig-7");
        assert_eq!(req.device_id.as_deref(), Some("dev-7"));
        assert_eq!(req.capabilities.max_concurrent_tasks, 3);
        assert_eq!(req.capabilities.labels["gpu"], "a100");
        assert!(req.capabilities.modes.contains(&ModeKind::Container));
        assert_eq!(req.os, std::env::consts::OS);
    }

    #[test]
    fn no_runtime_means_no_container_mode() {
        let config = AgentConfig {
            container_runtime: String::new(),
            ..AgentConfig::default()
        };
        let req = agent(config).registration();
        assert!(!req.capabilities.modes.contains(&ModeKind::Container));
        assert!(req.device_id.is_some());
    }

    #[tokio::test]
    async fn active_tasks_cancel() {
        let active = ActiveTasks::default();
        let (handle, signal) = cancel_pair();
        let id = Uuid::new_v4();
        active.insert(id, handle).await;

        assert!(!active.cancel(Uuid::new_v4()).await);
        assert!(active.cancel(id).await);
        assert!(signal.is_cancelled());

        active.remove(id).await;
        assert_eq!(active.len().await, 0);
        assert_eq!(active.cancel_all().await, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_loop() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            work_dir: dir.path().join("work"),
            poll_interval: Duration::from_secs(60),
            ..AgentConfig::default()
        };
        let agent = Arc::new(agent(config));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(Uuid::new_v4(), rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(dir.path().join("work").exists());
    }
}
