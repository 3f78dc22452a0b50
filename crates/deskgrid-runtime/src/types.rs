//! Request and response shapes for the container runtime API.
//!
//! The wire structs mirror the Docker Engine API (`PascalCase` fields);
//! the public types are what the rest of deskgrid consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use deskgrid_state::Allocation;

/// What to run for one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerSpec {
    /// Optional container name (must be unique on the daemon).
    #[serde(default)]
    pub name: Option<String>,
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// CPU limit in cores (0 = unlimited).
    #[serde(default)]
    pub cpu_cores: f64,
    /// Memory limit in MiB (0 = unlimited).
    #[serde(default)]
    pub memory_mb: u64,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Apply the placement allocation as runtime limits.
    pub fn with_limits(mut self, allocation: &Allocation) -> Self {
        self.cpu_cores = allocation.cpu_cores;
        self.memory_mb = allocation.memory_mb;
        self
    }

    pub(crate) fn to_create_body(&self) -> CreateContainerBody {
        let mut env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();
        CreateContainerBody {
            image: self.image.clone(),
            cmd: (!self.cmd.is_empty()).then(|| self.cmd.clone()),
            env,
            labels: self.labels.clone(),
            working_dir: self.working_dir.clone(),
            host_config: HostConfig {
                nano_cpus: (self.cpu_cores * 1e9).round() as i64,
                memory: (self.memory_mb * 1024 * 1024) as i64,
            },
        }
    }
}

/// Live state of a container as seen by its daemon.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerStats {
    /// Container exists and its process is running.
    pub running: bool,
    pub cpu_percent: f64,
    pub memory_usage_mb: u64,
    /// Daemon-reported state (`running`, `exited`, `missing`, ...).
    pub state: String,
}

impl ContainerStats {
    /// The daemon does not know the container.
    pub fn missing() -> Self {
        Self {
            state: "missing".to_string(),
            ..Default::default()
        }
    }
}

/// Result of a command executed inside a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Daemon-level facts from `GET /info`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DaemonInfo {
    #[serde(default)]
    pub containers: u32,
    #[serde(default)]
    pub containers_running: u32,
    #[serde(default, rename = "NCPU")]
    pub ncpu: u32,
    #[serde(default)]
    pub mem_total: u64,
    #[serde(default)]
    pub server_version: Option<String>,
}

impl DaemonInfo {
    pub fn observation(&self) -> deskgrid_state::DaemonObservation {
        deskgrid_state::DaemonObservation {
            containers: self.containers,
            containers_running: self.containers_running,
            cpu_count: self.ncpu,
            memory_total_mb: self.mem_total / (1024 * 1024),
            server_version: self.server_version.clone(),
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CreateContainerBody {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub host_config: HostConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HostConfig {
    pub nano_cpus: i64,
    pub memory: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct IdResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ExecCreateBody {
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub cmd: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ExecStartBody {
    pub detach: bool,
    pub tty: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ExecInspect {
    #[serde(default)]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ContainerInspect {
    pub state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InspectState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StatsResponse {
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MemoryStats {
    #[serde(default)]
    pub usage: Option<u64>,
}

impl StatsResponse {
    /// CPU usage since the previous sample, as a percentage of one core
    /// times the number of online CPUs (the `docker stats` convention).
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(self.precpu_stats.system_cpu_usage.unwrap_or(0));
        if cpu_delta == 0 || system_delta == 0 {
            return 0.0;
        }
        let online = self.cpu_stats.online_cpus.unwrap_or_else(|| {
            self.cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map_or(1, |v| v.len().max(1) as u32)
        });
        cpu_delta as f64 / system_delta as f64 * f64::from(online) * 100.0
    }

    pub fn memory_usage_mb(&self) -> u64 {
        self.memory_stats.usage.unwrap_or(0) / (1024 * 1024)
    }
}
