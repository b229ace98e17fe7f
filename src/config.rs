//! Configuration types.
//!
//! Every component receives its settings through a value built once at
//! startup; nothing reads the environment after `from_env` returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Control-plane configuration.
#[derive(Debug, Clone)]
pub struct MothershipConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub listen_addr: SocketAddr,
    /// Root directory of the blob store.
    pub storage_dir: PathBuf,
    /// Interval runners are asked to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Liveness threshold as a multiple of the heartbeat interval.
    pub liveness_multiplier: u32,
    /// How often the liveness sweep runs. Must be below the threshold.
    pub sweep_interval: Duration,
    /// How many times a task is re-enqueued after losing its runner.
    pub max_reassignments: u32,
    /// Per-subscriber event buffer length.
    pub event_buffer: usize,
    /// A screen stream is live while its last frame is younger than this.
    pub screen_freshness: Duration,
    /// Tokens accepted at runner registration in addition to issued ones.
    pub runner_tokens: Vec<String>,
    /// Largest accepted multipart upload, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for MothershipConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            storage_dir: PathBuf::from("./data"),
            heartbeat_interval: Duration::from_secs(30),
            liveness_multiplier: 3,
            sweep_interval: Duration::from_secs(10),
            max_reassignments: 3,
            event_buffer: 256,
            screen_freshness: Duration::from_secs(10),
            runner_tokens: Vec::new(),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl MothershipConfig {
    /// Load from `BORG_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            listen_addr: env_or("BORG_LISTEN_ADDR", defaults.listen_addr)?,
            storage_dir: env_or("BORG_STORAGE_DIR", defaults.storage_dir)?,
            heartbeat_interval: env_secs("BORG_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            liveness_multiplier: env_or("BORG_LIVENESS_MULTIPLIER", defaults.liveness_multiplier)?,
            sweep_interval: env_secs("BORG_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            max_reassignments: env_or("BORG_MAX_REASSIGNMENTS", defaults.max_reassignments)?,
            event_buffer: env_or("BORG_EVENT_BUFFER", defaults.event_buffer)?,
            screen_freshness: env_secs("BORG_SCREEN_FRESHNESS_SECS", defaults.screen_freshness)?,
            runner_tokens: std::env::var("BORG_RUNNER_TOKENS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            max_upload_bytes: upload_bytes(env_or(
                "BORG_MAX_UPLOAD_MB",
                defaults.max_upload_bytes >> 20,
            )?)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Maximum allowed gap since the last heartbeat before a runner is Offline.
    ///
    /// Saturates instead of overflowing; `validate` rejects such settings.
    pub fn liveness_threshold(&self) -> Duration {
        self.heartbeat_interval
            .checked_mul(self.liveness_multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Reject combinations that would break liveness detection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BORG_LIVENESS_MULTIPLIER".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.heartbeat_interval.checked_mul(self.liveness_multiplier).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "BORG_LIVENESS_MULTIPLIER".into(),
                message: "liveness threshold overflows".into(),
            });
        }
        if self.sweep_interval.is_zero() || self.sweep_interval >= self.liveness_threshold() {
            return Err(ConfigError::InvalidValue {
                key: "BORG_SWEEP_INTERVAL_SECS".into(),
                message: format!(
                    "must be non-zero and below the liveness threshold ({:?})",
                    self.liveness_threshold()
                ),
            });
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BORG_EVENT_BUFFER".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Agent ("solder") configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. `http://localhost:8080`.
    pub mothership_url: String,
    /// Display name reported at registration.
    pub name: String,
    /// Registration token.
    pub token: SecretString,
    /// Stable identity for idempotent re-registration. Detected when unset.
    pub device_id: Option<String>,
    /// Labels advertised to the control plane for task matching.
    pub labels: HashMap<String, String>,
    /// Root directory for per-task working directories.
    pub work_dir: PathBuf,
    /// Number of execution slots.
    pub max_concurrent_tasks: usize,
    /// Heartbeat period (the control plane may override it).
    pub heartbeat_interval: Duration,
    /// Delay between polls when no task is available.
    pub poll_interval: Duration,
    /// Timeout for control-plane API calls.
    pub request_timeout: Duration,
    /// Timeout for a single input file download.
    pub download_timeout: Duration,
    /// Binary used for container-mode tasks.
    pub container_runtime: String,
    /// Keep task directories after completion (debugging).
    pub keep_task_dirs: bool,
    /// Directory for a daily rolling log file, if any.
    pub log_dir: Option<PathBuf>,
    /// Periodic screen capture.
    pub screen: ScreenCaptureConfig,
    /// Plain-text "what is my IP" endpoints queried for resource reports.
    /// Empty disables public IP detection.
    pub public_ip_urls: Vec<String>,
}

/// Agent screen capture settings.
#[derive(Debug, Clone)]
pub struct ScreenCaptureConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Command that writes one PNG or JPEG image to stdout.
    pub command: Option<String>,
}

impl Default for ScreenCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            command: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mothership_url: "http://localhost:8080".to_string(),
            name: hostname(),
            token: SecretString::from(String::new()),
            device_id: None,
            labels: HashMap::new(),
            work_dir: PathBuf::from("./work"),
            max_concurrent_tasks: 1,
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(300),
            container_runtime: "docker".to_string(),
            keep_task_dirs: false,
            log_dir: None,
            screen: ScreenCaptureConfig::default(),
            public_ip_urls: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load from the environment. `RUNNER_TOKEN` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let token = std::env::var("RUNNER_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("RUNNER_TOKEN".into()))?;
        let config = Self {
            mothership_url: env_or("MOTHERSHIP_ADDR", defaults.mothership_url)?,
            name: std::env::var("RUNNER_NAME")
                .ok()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(defaults.name),
            token: SecretString::from(token),
            device_id: std::env::var("SOLDER_DEVICE_ID").ok().filter(|d| !d.trim().is_empty()),
            labels: match std::env::var("SOLDER_LABELS") {
                Ok(raw) => parse_labels(&raw)?,
                Err(_) => HashMap::new(),
            },
            work_dir: env_or("WORK_DIR", defaults.work_dir)?,
            max_concurrent_tasks: env_or("SOLDER_MAX_CONCURRENT", defaults.max_concurrent_tasks)?,
            heartbeat_interval: env_secs("SOLDER_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            poll_interval: env_secs("SOLDER_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            request_timeout: env_secs("SOLDER_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            download_timeout: env_secs("SOLDER_DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout)?,
            container_runtime: env_or("SOLDER_CONTAINER_RUNTIME", defaults.container_runtime)?,
            keep_task_dirs: env_or("SOLDER_KEEP_TASK_DIRS", defaults.keep_task_dirs)?,
            log_dir: std::env::var("SOLDER_LOG_DIR").ok().map(PathBuf::from),
            screen: ScreenCaptureConfig {
                enabled: env_or("SOLDER_SCREEN_ENABLED", false)?,
                interval: env_secs("SOLDER_SCREEN_INTERVAL_SECS", defaults.screen.interval)?,
                command: std::env::var("SOLDER_SCREEN_COMMAND").ok(),
            },
            public_ip_urls: std::env::var("SOLDER_PUBLIC_IP_URLS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
        };
        if config.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SOLDER_MAX_CONCURRENT".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(config)
    }
}

/// Hostname from the environment, or `solder`.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "solder".to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `k=v,k2=v2` into a label map.
fn parse_labels(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => Err(ConfigError::InvalidValue {
                key: "SOLDER_LABELS".into(),
                message: format!("expected key=value, got {pair:?}"),
            }),
        })
        .collect()
}

/// Parse `key` from the environment, or return `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn upload_bytes(megabytes: usize) -> Result<usize, ConfigError> {
    megabytes
        .checked_mul(1 << 20)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "BORG_MAX_UPLOAD_MB".into(),
            message: format!("{megabytes} MiB is too large"),
        })
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}
