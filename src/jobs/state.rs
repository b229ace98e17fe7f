//! Task and job state machines.

use serde::{Deserialize, Serialize};

use super::model::FailurePolicy;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a runner, not yet started.
    Assigned,
    /// Executing on its runner.
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Assigned,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Assigned) | (Pending, Cancelled) |
            // From Assigned
            (Assigned, Running) | (Assigned, Succeeded) | (Assigned, Failed) |
            (Assigned, TimedOut) | (Assigned, Cancelled) |
            // From Running
            (Running, Succeeded) | (Running, Failed) |
            (Running, TimedOut) | (Running, Cancelled) |
            // Runner lost
            (Assigned, Pending) | (Running, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Terminal and not a success.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Cancelled)
    }

    /// Held by a runner.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// State of a job. Derived from its tasks except for Paused and Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    /// New claims are blocked; running tasks continue.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Paused) | (Pending, Cancelled) | (Pending, Failed) |
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            (Paused, Pending) | (Paused, Running) | (Paused, Completed) |
            (Paused, Failed) | (Paused, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether tasks of a job in this state may be claimed.
    pub fn accepts_claims(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Compute a job's status from the statuses of its tasks.
///
/// Terminal job states are sticky. A paused job stays paused until every task
/// has finished, since pausing never interrupts running work.
pub fn derive_job_status(
    current: JobStatus,
    policy: FailurePolicy,
    tasks: &[TaskStatus],
) -> JobStatus {
    if current.is_terminal() {
        return current;
    }
    if !tasks.is_empty() && tasks.iter().all(|s| *s == TaskStatus::Succeeded) {
        return JobStatus::Completed;
    }
    let any_unsuccessful = tasks.iter().any(TaskStatus::is_unsuccessful);
    let all_terminal = tasks.iter().all(TaskStatus::is_terminal);
    match policy {
        FailurePolicy::FailFast if any_unsuccessful => return JobStatus::Failed,
        _ if all_terminal => return JobStatus::Failed,
        _ => {}
    }
    if current == JobStatus::Paused {
        return JobStatus::Paused;
    }
    if tasks.iter().any(|s| *s != TaskStatus::Pending) {
        JobStatus::Running
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Assigned));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in TaskStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        for from in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_parses_from_display() {
        assert_eq!("timed_out".parse::<TaskStatus>(), Ok(TaskStatus::TimedOut));
        assert_eq!("paused".parse::<JobStatus>(), Ok(JobStatus::Paused));
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn completed_only_when_every_task_succeeded() {
        use TaskStatus::*;
        let policy = FailurePolicy::FailFast;
        assert_eq!(
            derive_job_status(JobStatus::Running, policy, &[Succeeded, Succeeded]),
            JobStatus::Completed
        );
        assert_eq!(
            derive_job_status(JobStatus::Running, policy, &[Succeeded, Running]),
            JobStatus::Running
        );
        assert_eq!(
            derive_job_status(JobStatus::Pending, policy, &[Pending, Pending]),
            JobStatus::Pending
        );
        assert_eq!(
            derive_job_status(JobStatus::Pending, policy, &[Assigned, Pending]),
            JobStatus::Running
        );
    }

    #[test]
    fn failure_policy_decides_when_the_job_fails() {
        use TaskStatus::*;
        assert_eq!(
            derive_job_status(JobStatus::Running, FailurePolicy::FailFast, &[Failed, Running]),
            JobStatus::Failed
        );
        assert_eq!(
            derive_job_status(JobStatus::Running, FailurePolicy::Continue, &[TimedOut, Running]),
            JobStatus::Running
        );
        assert_eq!(
            derive_job_status(JobStatus::Running, FailurePolicy::Continue, &[TimedOut, Succeeded]),
            JobStatus::Failed
        );
    }

    #[test]
    fn paused_holds_until_all_tasks_finish() {
        use TaskStatus::*;
        let policy = FailurePolicy::Continue;
        assert_eq!(
            derive_job_status(JobStatus::Paused, policy, &[Running, Pending]),
            JobStatus::Paused
        );
        assert_eq!(
            derive_job_status(JobStatus::Paused, policy, &[Succeeded]),
            JobStatus::Completed
        );
        assert_eq!(
            derive_job_status(JobStatus::Cancelled, policy, &[Succeeded]),
            JobStatus::Cancelled
        );
    }
}
