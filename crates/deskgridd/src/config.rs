//! deskgrid.toml configuration.
//!
//! ```toml
//! data_dir = "/var/lib/deskgrid"
//!
//! [monitor]
//! server_interval = "15s"
//! probe_command = ["supervisorctl", "status"]
//!
//! [pool]
//! call_timeout = "10s"
//!
//! [[servers]]
//! server_id = "ws-eu-1"
//! host = "10.0.0.11"
//! port = 2376
//! total_cpu_cores = 32.0
//! total_memory_mb = 131072
//! total_disk_gb = 2000
//! max_workspaces = 24
//! transport = { type = "mutual_tls", cert_dir = "/etc/deskgrid/certs/ws-eu-1" }
//! labels = { region = "eu", gpu = true }
//!
//! [[servers]]
//! server_id = "ws-eu-2"
//! # ...
//! transport = { type = "mutual_tls", ca_path = "/etc/pki/daemon-ca.pem", cert_path = "/etc/pki/client.crt", key_path = "/etc/pki/client.key" }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use deskgrid_health::MonitorConfig;
use deskgrid_runtime::PoolConfig;
use deskgrid_state::ServerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Directory for the state database. `--data-dir` overrides it.
    pub data_dir: Option<PathBuf>,
    pub monitor: MonitorConfig,
    pub pool: PoolConfig,
    pub servers: Vec<ServerConfig>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.monitor
            .validate()
            .map_err(|e| anyhow::anyhow!("[monitor]: {e}"))?;
        if self.pool.max_concurrent_per_server == 0 {
            bail!("[pool]: max_concurrent_per_server must be at least 1");
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.server_id.is_empty() {
                bail!("[[servers]]: server_id must not be empty");
            }
            if !seen.insert(server.server_id.as_str()) {
                bail!("[[servers]]: duplicate server_id {}", server.server_id);
            }
            if server.host.is_empty() {
                bail!("server {}: host must not be empty", server.server_id);
            }
            if server.total_cpu_cores <= 0.0
                || server.total_memory_mb == 0
                || server.max_workspaces == 0
            {
                bail!(
                    "server {}: declared capacity must be greater than zero",
                    server.server_id
                );
            }
        }
        Ok(())
    }
}
