//! Dashboard event types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus, TaskStatus};
use crate::runners::model::{Runner, RunnerStatus};

/// A state change pushed to dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    JobCreated {
        job: Job,
    },
    JobUpdated {
        job_id: Uuid,
        status: JobStatus,
    },
    TaskUpdated {
        task_id: Uuid,
        job_id: Uuid,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    RunnerRegistered {
        runner: Runner,
    },
    RunnerUpdated {
        runner_id: Uuid,
        status: RunnerStatus,
        current_load: usize,
    },
    RunnerRenamed {
        runner_id: Uuid,
        name: String,
    },
    RunnerRemoved {
        runner_id: Uuid,
    },
    /// Full current state. Sent on connect and after a subscriber lagged.
    Snapshot {
        jobs: Vec<Job>,
        runners: Vec<Runner>,
    },
}

impl DashboardEvent {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobCreated { .. } => "job_created",
            Self::JobUpdated { .. } => "job_updated",
            Self::TaskUpdated { .. } => "task_updated",
            Self::RunnerRegistered { .. } => "runner_registered",
            Self::RunnerUpdated { .. } => "runner_updated",
            Self::RunnerRenamed { .. } => "runner_renamed",
            Self::RunnerRemoved { .. } => "runner_removed",
            Self::Snapshot { .. } => "snapshot",
        }
    }
}
