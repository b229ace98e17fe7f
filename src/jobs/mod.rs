//! Jobs, tasks and the claim queue.

pub mod model;
pub mod queue;
pub mod state;

pub use model::{
    ExecutionMode, FailurePolicy, Job, JobDetail, JobPage, JobSpec, ModeKind, StatusReport, Task,
    TaskAssignment, TaskLogs, TaskSpec,
};
pub use queue::JobQueue;
pub use state::{JobStatus, TaskStatus};
