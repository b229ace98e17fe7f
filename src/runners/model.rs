//! Runner data model and the registration/heartbeat wire shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::ModeKind;

/// Liveness state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Registered, no heartbeat yet.
    Online,
    Idle,
    Busy,
    /// Missed heartbeats past the liveness threshold.
    Offline,
}

impl RunnerStatus {
    /// Status implied by a heartbeat carrying `load`.
    pub fn from_load(load: usize) -> Self {
        if load == 0 { Self::Idle } else { Self::Busy }
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// What a runner can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerCapabilities {
    #[serde(default = "default_modes")]
    pub modes: Vec<ModeKind>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_tasks: usize,
}

fn default_modes() -> Vec<ModeKind> {
    vec![ModeKind::Shell, ModeKind::Binary]
}

fn default_concurrency() -> usize {
    1
}

impl Default for RunnerCapabilities {
    fn default() -> Self {
        Self {
            modes: default_modes(),
            labels: HashMap::new(),
            max_concurrent_tasks: default_concurrency(),
        }
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: Uuid,
    pub name: String,
    /// Stable machine identity used to make re-registration idempotent.
    pub device_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    pub capabilities: RunnerCapabilities,
    pub status: RunnerStatus,
    /// Load reported in the last heartbeat.
    pub current_load: usize,
    /// Tasks currently held, filled in by query endpoints.
    #[serde(default)]
    pub current_tasks: Vec<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: RunnerResources,
}

/// Hardware inventory reported by an agent.
///
/// Sent in full at registration; heartbeats periodically carry a partial
/// update in which zero or empty fields mean "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerResources {
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub cpu_frequency_mhz: u32,
    #[serde(default)]
    pub memory_gb: f64,
    /// Free space on the work volume.
    #[serde(default)]
    pub disk_space_gb: f64,
    #[serde(default)]
    pub total_disk_space_gb: f64,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub gpu_info: Vec<GpuInfo>,
    #[serde(default)]
    pub public_ips: Vec<String>,
}

impl RunnerResources {
    /// Overlay the non-empty fields of `update`.
    pub fn merge(&mut self, update: RunnerResources) {
        if update.cpu_cores > 0 {
            self.cpu_cores = update.cpu_cores;
        }
        if !update.cpu_model.is_empty() {
            self.cpu_model = update.cpu_model;
        }
        if update.cpu_frequency_mhz > 0 {
            self.cpu_frequency_mhz = update.cpu_frequency_mhz;
        }
        if update.memory_gb > 0.0 {
            self.memory_gb = update.memory_gb;
        }
        if update.disk_space_gb > 0.0 {
            self.disk_space_gb = update.disk_space_gb;
        }
        if update.total_disk_space_gb > 0.0 {
            self.total_disk_space_gb = update.total_disk_space_gb;
        }
        if !update.os_version.is_empty() {
            self.os_version = update.os_version;
        }
        if !update.gpu_info.is_empty() {
            self.gpu_info = update.gpu_info;
        }
        if !update.public_ips.is_empty() {
            self.public_ips = update.public_ips;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

/// `PATCH /runners/{id}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// `POST /runners/register` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub token: String,
    /// Defaults to the name when absent.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub capabilities: RunnerCapabilities,
    #[serde(default)]
    pub resources: RunnerResources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub runner_id: Uuid,
    pub heartbeat_interval_secs: u64,
}

/// `POST /runners/{id}/heartbeat` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub runner_id: Option<Uuid>,
    #[serde(default, alias = "current_load")]
    pub load: usize,
    /// Partial resource refresh, sent every few beats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<RunnerResources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    /// Seconds until the next expected heartbeat.
    pub next_heartbeat_interval: u64,
    /// Tasks the runner should abort.
    #[serde(default)]
    pub cancel_task_ids: Vec<Uuid>,
}
