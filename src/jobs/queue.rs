//! Job queue: owns every job and task and serializes all state changes.
//!
//! Claims, status reports, pause/resume/cancel and runner release all run
//! inside one write-locked decision section, so a task can never be claimed
//! twice and a stale report can never overwrite a newer owner's state. Every
//! transition is published to the [`EventHub`] before the lock is released,
//! which keeps per-subscriber event order consistent with state order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    FailurePolicy, Job, JobDetail, JobPage, JobSpec, JobStatus, QueueStats, StatusReport, Task,
    TaskAssignment, TaskOutput, TaskStatus,
};
use super::state::derive_job_status;
use crate::blob::BlobRef;
use crate::error::{Error, Result};
use crate::events::{DashboardEvent, EventHub};
use crate::runners::model::RunnerCapabilities;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, Task>,
    /// Claimable tasks ordered by creation sequence.
    pending: BTreeSet<(u64, Uuid)>,
    /// Runner id -> tasks it holds in Assigned or Running.
    held: HashMap<Uuid, HashSet<Uuid>>,
    /// Runner id -> held tasks that were cancelled and must be aborted.
    cancels: HashMap<Uuid, Vec<Uuid>>,
    next_seq: u64,
}

/// In-memory job queue with pull-based task claiming.
pub struct JobQueue {
    state: RwLock<QueueState>,
    events: Arc<EventHub>,
    max_reassignments: u32,
}

impl JobQueue {
    pub fn new(events: Arc<EventHub>, max_reassignments: u32) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            events,
            max_reassignments,
        }
    }

    /// Validate and accept a job. All of its tasks start Pending.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        spec.validate()?;

        let now = Utc::now();
        let job_id = Uuid::new_v4();
        let mut state = self.state.write().await;

        let mut task_ids = Vec::with_capacity(spec.tasks.len());
        for task_spec in spec.tasks {
            let seq = state.next_seq;
            state.next_seq += 1;
            let task = Task::new(job_id, seq, task_spec);
            task_ids.push(task.id);
            state.pending.insert((seq, task.id));
            state.tasks.insert(task.id, task);
        }

        let job = Job {
            id: job_id,
            name: spec.name,
            description: spec.description,
            status: JobStatus::Pending,
            failure_policy: spec.failure_policy,
            max_retries: spec.max_retries.unwrap_or(self.max_reassignments),
            task_ids,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        state.jobs.insert(job_id, job.clone());

        info!(job_id = %job_id, name = %job.name, tasks = job.task_ids.len(), "Job enqueued");
        self.events.publish(DashboardEvent::JobCreated { job: job.clone() });
        Ok(job)
    }

    /// Claim the oldest pending task `runner_id` can run.
    ///
    /// Returns `None` when nothing is claimable, including when the runner is
    /// already at its concurrency limit. Concurrent callers never receive the
    /// same task.
    pub async fn claim_next(
        &self,
        runner_id: Uuid,
        caps: &RunnerCapabilities,
    ) -> Option<TaskAssignment> {
        let mut state = self.state.write().await;

        let held = state.held.get(&runner_id).map_or(0, HashSet::len);
        if held >= caps.max_concurrent_tasks {
            debug!(runner_id = %runner_id, held, "Runner at capacity");
            return None;
        }

        let (seq, task_id) = state
            .pending
            .iter()
            .find(|(_, id)| {
                let Some(task) = state.tasks.get(id) else {
                    return false;
                };
                let claimable_job = state
                    .jobs
                    .get(&task.job_id)
                    .is_some_and(|job| job.status.accepts_claims());
                claimable_job && task.spec.satisfied_by(caps)
            })
            .copied()?;

        state.pending.remove(&(seq, task_id));
        let task = state.tasks.get_mut(&task_id)?;
        debug_assert!(task.status.can_transition_to(TaskStatus::Assigned));
        task.status = TaskStatus::Assigned;
        task.runner_id = Some(runner_id);
        task.assigned_at = Some(Utc::now());
        let job_id = task.job_id;
        let spec = task.spec.clone();
        state.held.entry(runner_id).or_default().insert(task_id);

        info!(task_id = %task_id, job_id = %job_id, runner_id = %runner_id, "Task claimed");
        let mut out = vec![DashboardEvent::TaskUpdated {
            task_id,
            job_id,
            status: TaskStatus::Assigned,
            runner_id: Some(runner_id),
            exit_code: None,
        }];
        state.refresh_job(job_id, &mut out);
        self.publish_all(out);

        let job_name = state.jobs.get(&job_id).map(|j| j.name.clone())?;
        Some(TaskAssignment {
            task_id,
            job_id,
            job_name,
            spec,
        })
    }

    /// Apply a status report from the runner that holds `task_id`.
    pub async fn report_status(&self, task_id: Uuid, report: StatusReport) -> Result<Task> {
        if matches!(report.status, TaskStatus::Pending | TaskStatus::Assigned) {
            return Err(Error::Validation(format!(
                "runners cannot report status {}",
                report.status
            )));
        }

        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;

        if task.runner_id != Some(report.runner_id) || !task.status.is_held() {
            warn!(
                task_id = %task_id,
                runner_id = %report.runner_id,
                owner = ?task.runner_id,
                status = %task.status,
                "Rejected stale status report"
            );
            return Err(Error::Conflict(format!(
                "task {task_id} is not held by runner {}",
                report.runner_id
            )));
        }

        if task.status == TaskStatus::Running && report.status == TaskStatus::Running {
            return Ok(task.clone());
        }
        if !task.status.can_transition_to(report.status) {
            return Err(Error::Conflict(format!(
                "task {task_id} cannot move from {} to {}",
                task.status, report.status
            )));
        }

        let now = Utc::now();
        task.status = report.status;
        if report.status == TaskStatus::Running {
            task.started_at = Some(now);
        } else {
            task.finished_at = Some(now);
            task.exit_code = report.exit_code;
            task.error = report.error;
            task.output = TaskOutput {
                stdout: TaskOutput::excerpt(report.stdout.as_deref().unwrap_or_default()),
                stderr: TaskOutput::excerpt(report.stderr.as_deref().unwrap_or_default()),
            };
        }
        let job_id = task.job_id;
        let status = task.status;
        let exit_code = task.exit_code;
        if status.is_terminal() {
            state.release_hold(report.runner_id, task_id);
        }

        info!(task_id = %task_id, runner_id = %report.runner_id, status = %status, exit_code = ?exit_code, "Task status updated");
        let mut out = vec![DashboardEvent::TaskUpdated {
            task_id,
            job_id,
            status,
            runner_id: Some(report.runner_id),
            exit_code,
        }];
        state.refresh_job(job_id, &mut out);
        self.publish_all(out);

        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    /// Stop handing out this job's tasks. Running tasks are left alone.
    pub async fn pause(&self, job_id: Uuid) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;
        match job.status {
            JobStatus::Paused => return Ok(job.clone()),
            s if s.is_terminal() => {
                return Err(Error::Conflict(format!("job {job_id} is already {s}")));
            }
            _ => {}
        }
        job.status = JobStatus::Paused;
        job.updated_at = Utc::now();
        let job = job.clone();

        info!(job_id = %job_id, "Job paused");
        self.events.publish(DashboardEvent::JobUpdated {
            job_id,
            status: JobStatus::Paused,
        });
        Ok(job)
    }

    /// Allow claims for a paused job again.
    pub async fn resume(&self, job_id: Uuid) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;
        match job.status {
            JobStatus::Paused => {}
            s if s.is_terminal() => {
                return Err(Error::Conflict(format!("job {job_id} is already {s}")));
            }
            _ => return Ok(job.clone()),
        }

        let statuses = state.task_statuses(job_id);
        let policy = job.failure_policy;
        let next = derive_job_status(JobStatus::Pending, policy, &statuses);
        let mut out = Vec::new();
        state.set_job_status(job_id, next, &mut out);
        info!(job_id = %job_id, status = %next, "Job resumed");
        self.publish_all(out);

        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    /// Cancel every non-terminal task of the job.
    ///
    /// Tasks held by a runner are queued for that runner's next heartbeat;
    /// stopping the process is best effort on the agent side.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;
        match job.status {
            JobStatus::Cancelled => return Ok(job.clone()),
            s if s.is_terminal() => {
                return Err(Error::Conflict(format!("job {job_id} is already {s}")));
            }
            _ => {}
        }

        let task_ids = job.task_ids.clone();
        let mut out = Vec::new();
        let mut cancelled = 0;
        for task_id in task_ids {
            if state.cancel_task(task_id, "job cancelled", &mut out) {
                cancelled += 1;
            }
        }
        state.set_job_status(job_id, JobStatus::Cancelled, &mut out);
        info!(job_id = %job_id, cancelled, "Job cancelled");
        self.publish_all(out);

        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    /// Hand back every task held by a lost runner.
    ///
    /// Each task returns to Pending at its original queue position until its
    /// job's retry bound is used up, after which it is marked Failed.
    /// Returns the number of tasks released.
    pub async fn release_runner(&self, runner_id: Uuid) -> usize {
        let mut state = self.state.write().await;
        state.cancels.remove(&runner_id);
        let Some(held) = state.held.remove(&runner_id) else {
            return 0;
        };

        let mut out = Vec::new();
        let mut jobs = HashSet::new();
        let mut held: Vec<Uuid> = held.into_iter().collect();
        held.sort_by_key(|id| state.tasks.get(id).map_or(u64::MAX, |t| t.seq));

        for task_id in &held {
            let Some(task) = state.tasks.get(task_id) else {
                continue;
            };
            let job_id = task.job_id;
            let bound = state.jobs.get(&job_id).map_or(0, |j| j.max_retries);
            let Some(task) = state.tasks.get_mut(task_id) else {
                continue;
            };

            if task.attempts < bound {
                debug_assert!(task.status.can_transition_to(TaskStatus::Pending));
                task.attempts += 1;
                task.status = TaskStatus::Pending;
                task.runner_id = None;
                task.assigned_at = None;
                task.started_at = None;
                let seq = task.seq;
                let attempts = task.attempts;
                state.pending.insert((seq, *task_id));
                info!(task_id = %task_id, runner_id = %runner_id, attempts, "Task re-enqueued after runner loss");
                out.push(DashboardEvent::TaskUpdated {
                    task_id: *task_id,
                    job_id,
                    status: TaskStatus::Pending,
                    runner_id: None,
                    exit_code: None,
                });
            } else {
                task.status = TaskStatus::Failed;
                task.finished_at = Some(Utc::now());
                task.error = Some(format!(
                    "runner {runner_id} lost and retry limit of {bound} reached"
                ));
                warn!(task_id = %task_id, runner_id = %runner_id, "Task failed: retries exhausted");
                out.push(DashboardEvent::TaskUpdated {
                    task_id: *task_id,
                    job_id,
                    status: TaskStatus::Failed,
                    runner_id: Some(runner_id),
                    exit_code: None,
                });
            }
            jobs.insert(job_id);
        }
        for job_id in jobs {
            state.refresh_job(job_id, &mut out);
        }
        self.publish_all(out);
        held.len()
    }

    /// Drain the cancellations queued for a runner.
    pub async fn take_cancellations(&self, runner_id: Uuid) -> Vec<Uuid> {
        self.state
            .write()
            .await
            .cancels
            .remove(&runner_id)
            .unwrap_or_default()
    }

    /// Tasks currently held by a runner, in claim order.
    pub async fn held_by(&self, runner_id: Uuid) -> Vec<Uuid> {
        let state = self.state.read().await;
        let mut ids: Vec<Uuid> = state
            .held
            .get(&runner_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_by_key(|id| state.tasks.get(id).map_or(u64::MAX, |t| t.seq));
        ids
    }

    /// Record an uploaded artifact against its task.
    pub async fn attach_artifact(&self, task_id: Uuid, blob: BlobRef) -> Result<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found("task", task_id))?;
        info!(task_id = %task_id, blob_id = %blob.id, size = blob.size, "Artifact attached");
        task.artifacts.push(blob);
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobDetail> {
        let state = self.state.read().await;
        let job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", job_id))?;
        let tasks = job
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect();
        Ok(JobDetail { job, tasks })
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.state
            .read()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    /// Newest first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> JobPage {
        let state = self.state.read().await;
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = jobs.len();
        JobPage {
            jobs: jobs.into_iter().skip(offset).take(limit).cloned().collect(),
            total,
        }
    }

    /// All jobs, for dashboard snapshots.
    pub async fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.read().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            *stats.jobs.entry(job.status.to_string()).or_default() += 1;
        }
        for task in state.tasks.values() {
            *stats.tasks.entry(task.status.to_string()).or_default() += 1;
        }
        stats
    }

    fn publish_all(&self, events: Vec<DashboardEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }
}

impl QueueState {
    fn task_statuses(&self, job_id: Uuid) -> Vec<TaskStatus> {
        self.jobs
            .get(&job_id)
            .map(|job| {
                job.task_ids
                    .iter()
                    .filter_map(|id| self.tasks.get(id).map(|t| t.status))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn release_hold(&mut self, runner_id: Uuid, task_id: Uuid) {
        if let Some(set) = self.held.get_mut(&runner_id) {
            set.remove(&task_id);
            if set.is_empty() {
                self.held.remove(&runner_id);
            }
        }
    }

    /// Cancel one task if it is not terminal. Returns whether it changed.
    fn cancel_task(&mut self, task_id: Uuid, reason: &str, out: &mut Vec<DashboardEvent>) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        let was = task.status;
        let seq = task.seq;
        let owner = task.runner_id;
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(Utc::now());
        task.error = Some(reason.to_string());
        let job_id = task.job_id;

        if was == TaskStatus::Pending {
            self.pending.remove(&(seq, task_id));
        } else if let Some(runner_id) = owner {
            self.release_hold(runner_id, task_id);
            self.cancels.entry(runner_id).or_default().push(task_id);
        }
        debug!(task_id = %task_id, was = %was, reason, "Task cancelled");
        out.push(DashboardEvent::TaskUpdated {
            task_id,
            job_id,
            status: TaskStatus::Cancelled,
            runner_id: owner,
            exit_code: None,
        });
        true
    }

    fn set_job_status(&mut self, job_id: Uuid, next: JobStatus, out: &mut Vec<DashboardEvent>) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.status == next {
            return;
        }
        debug_assert!(
            job.status.can_transition_to(next),
            "{} -> {next}",
            job.status
        );
        let now = Utc::now();
        job.status = next;
        job.updated_at = now;
        if next.is_terminal() {
            job.finished_at = Some(now);
        }
        info!(job_id = %job_id, status = %next, "Job status changed");
        out.push(DashboardEvent::JobUpdated {
            job_id,
            status: next,
        });
    }

    /// Re-derive a job's status from its tasks. A fail-fast failure cancels
    /// the job's remaining tasks.
    fn refresh_job(&mut self, job_id: Uuid, out: &mut Vec<DashboardEvent>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let current = job.status;
        let policy = job.failure_policy;
        let next = derive_job_status(current, policy, &self.task_statuses(job_id));
        if next == current {
            return;
        }
        if next == JobStatus::Failed && policy == FailurePolicy::FailFast {
            let task_ids = job.task_ids.clone();
            for task_id in task_ids {
                self.cancel_task(task_id, "job failed", out);
            }
        }
        self.set_job_status(job_id, next, out);
    }
}
