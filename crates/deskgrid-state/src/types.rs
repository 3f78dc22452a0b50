//! Domain types for the deskgrid registry and state store.
//!
//! These types describe configured workspace servers, the capacity they
//! declare, the usage placed onto them, and the per-container health view.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Stable, unique identifier of a workspace server.
pub type ServerId = String;

/// Identifier of a workspace container as reported by the runtime daemon.
pub type ContainerId = String;

/// Float tolerance for CPU-core bookkeeping.
pub const CPU_EPSILON: f64 = 1e-9;

// ── Server ────────────────────────────────────────────────────────

/// Conventional file names inside a TLS `cert_dir`.
pub const CA_FILE: &str = "ca.pem";
pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";

/// How the pool talks to a server's runtime API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// Unauthenticated HTTP (local development).
    #[default]
    Plain,
    /// Mutually-authenticated TLS.
    MutualTls {
        #[serde(flatten)]
        files: TlsFiles,
    },
}

/// Where the PEM files for a mutual-TLS server live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TlsFiles {
    /// A directory holding `ca.pem`, `cert.pem` and `key.pem`.
    Dir { cert_dir: PathBuf },
    /// Explicit file paths.
    Paths {
        ca_path: PathBuf,
        cert_path: PathBuf,
        key_path: PathBuf,
    },
}

impl TlsFiles {
    /// CA bundle used to verify the daemon.
    pub fn ca_path(&self) -> PathBuf {
        match self {
            TlsFiles::Dir { cert_dir } => cert_dir.join(CA_FILE),
            TlsFiles::Paths { ca_path, .. } => ca_path.clone(),
        }
    }

    /// Client certificate presented to the daemon.
    pub fn cert_path(&self) -> PathBuf {
        match self {
            TlsFiles::Dir { cert_dir } => cert_dir.join(CERT_FILE),
            TlsFiles::Paths { cert_path, .. } => cert_path.clone(),
        }
    }

    pub fn key_path(&self) -> PathBuf {
        match self {
            TlsFiles::Dir { cert_dir } => cert_dir.join(KEY_FILE),
            TlsFiles::Paths { key_path, .. } => key_path.clone(),
        }
    }
}

impl Transport {
    /// Mutual TLS with the conventional files under `dir`.
    pub fn mutual_tls_dir(dir: impl Into<PathBuf>) -> Self {
        Transport::MutualTls {
            files: TlsFiles::Dir {
                cert_dir: dir.into(),
            },
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::MutualTls { .. } => "https",
        }
    }

    /// PEM file locations, if this transport needs them.
    pub fn tls_files(&self) -> Option<&TlsFiles> {
        match self {
            Transport::Plain => None,
            Transport::MutualTls { files } => Some(files),
        }
    }
}

/// A label value used for affinity filtering (`region = "eu"`, `gpu = true`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LabelValue {
    Bool(bool),
    Text(String),
}

impl From<&str> for LabelValue {
    fn from(value: &str) -> Self {
        LabelValue::Text(value.to_string())
    }
}

impl From<bool> for LabelValue {
    fn from(value: bool) -> Self {
        LabelValue::Bool(value)
    }
}

impl std::fmt::Display for LabelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelValue::Bool(b) => write!(f, "{b}"),
            LabelValue::Text(s) => f.write_str(s),
        }
    }
}

/// Monitor-driven server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Healthy,
    Unhealthy,
    Offline,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServerStatus::Healthy => "healthy",
            ServerStatus::Unhealthy => "unhealthy",
            ServerStatus::Offline => "offline",
        })
    }
}

/// Registration payload for a server (from configuration or an admin surface).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub server_id: ServerId,
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
    pub total_cpu_cores: f64,
    pub total_memory_mb: u64,
    pub total_disk_gb: u64,
    pub max_workspaces: u32,
    #[serde(default)]
    pub labels: HashMap<String, LabelValue>,
}

/// What a runtime daemon reported about itself on the last successful check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonObservation {
    pub containers: u32,
    pub containers_running: u32,
    pub cpu_count: u32,
    pub memory_total_mb: u64,
    pub server_version: Option<String>,
}

/// One configured workspace server: identity, declared capacity, observed
/// status and live usage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRecord {
    pub server_id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,

    pub total_cpu_cores: f64,
    pub total_memory_mb: u64,
    pub total_disk_gb: u64,
    /// Soft cap on concurrently hosted workspaces.
    pub max_workspaces: u32,

    pub labels: HashMap<String, LabelValue>,

    pub status: ServerStatus,
    /// Unix timestamp (seconds) of the last daemon check.
    pub last_health_check_at: Option<u64>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub observed: Option<DaemonObservation>,

    pub current_cpu_used: f64,
    pub current_memory_used_mb: u64,
    pub current_disk_used_gb: u64,
    pub current_workspace_count: u32,
}

impl ServerRecord {
    /// Build a freshly registered record. New servers stay `unhealthy`
    /// until the monitor's first successful daemon check.
    pub fn from_config(config: ServerConfig) -> Self {
        let name = if config.name.is_empty() {
            config.server_id.clone()
        } else {
            config.name
        };
        Self {
            server_id: config.server_id,
            name,
            host: config.host,
            port: config.port,
            transport: config.transport,
            total_cpu_cores: config.total_cpu_cores,
            total_memory_mb: config.total_memory_mb,
            total_disk_gb: config.total_disk_gb,
            max_workspaces: config.max_workspaces,
            labels: config.labels,
            status: ServerStatus::Unhealthy,
            last_health_check_at: None,
            last_error: None,
            consecutive_failures: 0,
            observed: None,
            current_cpu_used: 0.0,
            current_memory_used_mb: 0,
            current_disk_used_gb: 0,
            current_workspace_count: 0,
        }
    }

    /// `scheme://host:port` for the runtime API.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.transport.scheme(), self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServerStatus::Healthy
    }

    pub fn free_cpu(&self) -> f64 {
        (self.total_cpu_cores - self.current_cpu_used).max(0.0)
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.total_memory_mb.saturating_sub(self.current_memory_used_mb)
    }

    pub fn free_disk_gb(&self) -> u64 {
        self.total_disk_gb.saturating_sub(self.current_disk_used_gb)
    }

    /// Residual-capacity check: every dimension fits and the workspace
    /// cap is not reached.
    pub fn fits(&self, allocation: &Allocation) -> bool {
        self.total_cpu_cores - self.current_cpu_used + CPU_EPSILON >= allocation.cpu_cores
            && self.free_memory_mb() >= allocation.memory_mb
            && self.free_disk_gb() >= allocation.disk_gb
            && self.current_workspace_count < self.max_workspaces
    }

    /// CPU utilization in `0.0..=1.0` (a server declaring no CPU counts as full).
    pub fn cpu_utilization(&self) -> f64 {
        ratio(self.current_cpu_used, self.total_cpu_cores)
    }

    pub fn memory_utilization(&self) -> f64 {
        ratio(self.current_memory_used_mb as f64, self.total_memory_mb as f64)
    }

    /// Add one workspace's allocation to the live counters.
    pub fn apply(&mut self, allocation: &Allocation) {
        self.current_cpu_used += allocation.cpu_cores;
        self.current_memory_used_mb += allocation.memory_mb;
        self.current_disk_used_gb += allocation.disk_gb;
        self.current_workspace_count += 1;
    }

    /// Remove one workspace's allocation from the live counters.
    ///
    /// Counters are clamped at zero. Returns the name of the first counter
    /// that would have gone negative, if any.
    pub fn retract(&mut self, allocation: &Allocation) -> Option<&'static str> {
        let mut underflow = None;

        if self.current_workspace_count == 0 {
            underflow.get_or_insert("current_workspace_count");
        }
        self.current_workspace_count = self.current_workspace_count.saturating_sub(1);

        if self.current_cpu_used + CPU_EPSILON < allocation.cpu_cores {
            underflow.get_or_insert("current_cpu_used");
        }
        self.current_cpu_used = (self.current_cpu_used - allocation.cpu_cores).max(0.0);

        if self.current_memory_used_mb < allocation.memory_mb {
            underflow.get_or_insert("current_memory_used_mb");
        }
        self.current_memory_used_mb = self.current_memory_used_mb.saturating_sub(allocation.memory_mb);

        if self.current_disk_used_gb < allocation.disk_gb {
            underflow.get_or_insert("current_disk_used_gb");
        }
        self.current_disk_used_gb = self.current_disk_used_gb.saturating_sub(allocation.disk_gb);

        underflow
    }

    pub fn health_snapshot(&self) -> ServerHealthSnapshot {
        ServerHealthSnapshot {
            server_id: self.server_id.clone(),
            status: self.status,
            last_health_check_at: self.last_health_check_at,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            current_workspace_count: self.current_workspace_count,
            max_workspaces: self.max_workspaces,
            cpu_utilization: self.cpu_utilization(),
            memory_utilization: self.memory_utilization(),
            observed: self.observed.clone(),
        }
    }
}

fn ratio(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        1.0
    } else {
        (used / total).clamp(0.0, 1.0)
    }
}

/// Read-only health view of a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerHealthSnapshot {
    pub server_id: ServerId,
    pub status: ServerStatus,
    pub last_health_check_at: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub current_workspace_count: u32,
    pub max_workspaces: u32,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub observed: Option<DaemonObservation>,
}

// ── Requirements & reservations ───────────────────────────────────

/// Resources one workspace consumes on its server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Allocation {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// Per-request placement input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    /// Hard pin to one server.
    #[serde(default)]
    pub affinity_server_id: Option<ServerId>,
    /// Every pair must match the server's labels.
    #[serde(default)]
    pub required_labels: HashMap<String, LabelValue>,
}

impl ResourceRequirements {
    pub fn new(cpu_cores: f64, memory_mb: u64, disk_gb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_gb,
            ..Default::default()
        }
    }

    pub fn with_affinity(mut self, server_id: impl Into<ServerId>) -> Self {
        self.affinity_server_id = Some(server_id.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<LabelValue>) -> Self {
        self.required_labels.insert(key.into(), value.into());
        self
    }

    pub fn allocation(&self) -> Allocation {
        Allocation {
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
        }
    }
}

/// A capacity hold taken between placement and container creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: u64,
    pub server_id: ServerId,
    pub allocation: Allocation,
}

// ── Workspace health ──────────────────────────────────────────────

/// Health view of one running workspace container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceHealthRecord {
    pub container_id: ContainerId,
    pub server_id: ServerId,
    /// Container process present.
    pub running: bool,
    /// Running and the in-container supervisor responds.
    pub healthy: bool,
    pub cpu_percent: f64,
    pub memory_usage_mb: u64,
    pub started_at: u64,
    pub last_check_at: Option<u64>,
    pub last_error: Option<String>,
    pub allocation: Allocation,
    #[serde(default)]
    pub consecutive_probe_failures: u32,
}

impl WorkspaceHealthRecord {
    pub fn snapshot(&self) -> WorkspaceHealthSnapshot {
        WorkspaceHealthSnapshot {
            container_id: self.container_id.clone(),
            server_id: self.server_id.clone(),
            running: self.running,
            healthy: self.healthy,
            cpu_percent: self.cpu_percent,
            memory_usage_mb: self.memory_usage_mb,
            started_at: self.started_at,
            last_check_at: self.last_check_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only health view of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceHealthSnapshot {
    pub container_id: ContainerId,
    pub server_id: ServerId,
    pub running: bool,
    pub healthy: bool,
    pub cpu_percent: f64,
    pub memory_usage_mb: u64,
    pub started_at: u64,
    pub last_check_at: Option<u64>,
    pub last_error: Option<String>,
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
