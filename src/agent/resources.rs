//! Hardware inventory of the agent's machine.
//!
//! Detection is best effort: anything that cannot be read is left at its
//! zero value, which the control plane treats as "unknown".

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::runners::model::{GpuInfo, RunnerResources};

/// Upper bound for each helper command and public IP lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Collects [`RunnerResources`] for registration and heartbeats.
pub struct ResourceDetector {
    work_dir: PathBuf,
    public_ip_urls: Vec<String>,
    http: reqwest::Client,
}

impl ResourceDetector {
    pub fn new(work_dir: impl Into<PathBuf>, public_ip_urls: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            work_dir: work_dir.into(),
            public_ip_urls,
            http,
        }
    }

    /// Full inventory, sent at registration.
    pub async fn detect(&self) -> RunnerResources {
        let (cpu_model, cpu_frequency_mhz) = cpu_info().await;
        let mut resources = self.refresh().await;
        resources.cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(0);
        resources.cpu_model = cpu_model;
        resources.cpu_frequency_mhz = cpu_frequency_mhz;
        resources.os_version = os_version().await;
        resources.gpu_info = gpus().await;
        debug!(
            cores = resources.cpu_cores,
            memory_gb = resources.memory_gb,
            gpus = resources.gpu_info.len(),
            "Resources detected"
        );
        resources
    }

    /// The fields that drift while the agent runs: disk, memory and public
    /// addresses. Everything else is left empty so the control plane keeps
    /// what it has.
    pub async fn refresh(&self) -> RunnerResources {
        let (disk_space_gb, total_disk_space_gb) = disk_space(&self.work_dir).await;
        RunnerResources {
            memory_gb: memory_gb().await,
            disk_space_gb,
            total_disk_space_gb,
            public_ips: self.public_ips().await,
            ..RunnerResources::default()
        }
    }

    async fn public_ips(&self) -> Vec<String> {
        let mut ips = BTreeSet::new();
        for url in &self.public_ip_urls {
            let body = match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
                Ok(resp) => {
                    debug!(url = %url, status = %resp.status(), "Public IP lookup refused");
                    None
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Public IP lookup failed");
                    None
                }
            };
            if let Some(ip) = body.as_deref().and_then(parse_ip) {
                ips.insert(ip);
            }
        }
        ips.into_iter().collect()
    }
}

/// Run a helper command, returning its stdout on success.
async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(LOOKUP_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        _ => None,
    }
}

async fn cpu_info() -> (String, u32) {
    if let Ok(text) = tokio::fs::read_to_string("/proc/cpuinfo").await {
        return parse_cpuinfo(&text);
    }
    let model = command_output("sysctl", &["-n", "machdep.cpu.brand_string"])
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let mhz = command_output("sysctl", &["-n", "hw.cpufrequency"])
        .await
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0, |hz| (hz / 1_000_000) as u32);
    (model, mhz)
}

async fn memory_gb() -> f64 {
    if let Ok(text) = tokio::fs::read_to_string("/proc/meminfo").await {
        return parse_meminfo(&text);
    }
    command_output("sysctl", &["-n", "hw.memsize"])
        .await
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0.0, |bytes| round_gb(bytes as f64 / GIB))
}

/// Free and total space of the volume holding `dir`.
async fn disk_space(dir: &Path) -> (f64, f64) {
    let target = if dir.exists() { dir } else { Path::new("/") };
    let Some(target) = target.to_str() else {
        return (0.0, 0.0);
    };
    command_output("df", &["-Pk", target])
        .await
        .and_then(|out| parse_df(&out))
        .unwrap_or((0.0, 0.0))
}

async fn os_version() -> String {
    if let Ok(text) = tokio::fs::read_to_string("/etc/os-release").await {
        if let Some(name) = parse_os_release(&text) {
            return name;
        }
    }
    match command_output("sw_vers", &["-productVersion"]).await {
        Some(version) => format!("macOS {}", version.trim()),
        None => std::env::consts::OS.to_string(),
    }
}

async fn gpus() -> Vec<GpuInfo> {
    command_output(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ],
    )
    .await
    .map(|out| parse_nvidia_smi(&out))
    .unwrap_or_default()
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn round_gb(gb: f64) -> f64 {
    (gb * 10.0).round() / 10.0
}

fn parse_cpuinfo(text: &str) -> (String, u32) {
    let mut model = String::new();
    let mut mhz = 0;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "model name" if model.is_empty() => model = value.trim().to_string(),
            "cpu MHz" if mhz == 0 => {
                mhz = value.trim().parse::<f64>().map_or(0, |m| m.round() as u32);
            }
            _ => {}
        }
    }
    (model, mhz)
}

fn parse_meminfo(text: &str) -> f64 {
    text.lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0.0, |kb| round_gb(kb as f64 * 1024.0 / GIB))
}

/// `df -Pk` output: header, then `fs 1024-blocks used available capacity mount`.
fn parse_df(text: &str) -> Option<(f64, f64)> {
    let fields: Vec<&str> = text.lines().nth(1)?.split_whitespace().collect();
    let total_kb: u64 = fields.get(1)?.parse().ok()?;
    let free_kb: u64 = fields.get(3)?.parse().ok()?;
    let to_gb = |kb: u64| round_gb(kb as f64 * 1024.0 / GIB);
    Some((to_gb(free_kb), to_gb(total_kb)))
}

fn parse_os_release(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// `name, memory MiB, driver` per line.
fn parse_nvidia_smi(text: &str) -> Vec<GpuInfo> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let name = parts.next().filter(|n| !n.is_empty())?;
            let memory_gb = parts
                .next()
                .and_then(|m| m.parse::<f64>().ok())
                .map_or(0.0, |mib| round_gb(mib / 1024.0));
            let driver = parts.next().filter(|d| !d.is_empty()).map(str::to_string);
            Some(GpuInfo {
                name: name.to_string(),
                memory_gb,
                driver,
            })
        })
        .collect()
}

fn parse_ip(body: &str) -> Option<String> {
    body.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
