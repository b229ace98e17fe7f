//! Runner identity, heartbeats and liveness.

pub mod model;
pub mod registry;

pub use model::{GpuInfo, Runner, RunnerCapabilities, RunnerResources, RunnerStatus};
pub use registry::{Registration, RunnerRegistry, spawn_liveness_sweep};
