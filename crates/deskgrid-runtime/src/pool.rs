//! ClientPool — exactly one runtime backend per registered server.
//!
//! Operations are addressed by server id. An id the pool does not know is a
//! configuration problem and never reaches the network.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use deskgrid_state::{ContainerId, ServerId, ServerRecord};

use crate::client::{DockerClient, RuntimeBackend};
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::*;

/// Per-server client tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Deadline for a single remote call (connect included).
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
    /// Calls in flight against one daemon before further calls wait.
    pub max_concurrent_per_server: usize,
    /// Idle keep-alive connections retained per daemon.
    pub keepalive_idle_per_server: usize,
    /// Seconds a container gets to exit before the daemon kills it.
    pub stop_grace_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_concurrent_per_server: 4,
            keepalive_idle_per_server: 2,
            stop_grace_secs: 10,
        }
    }
}

/// Thread-safe map from server id to its backend.
pub struct ClientPool {
    config: PoolConfig,
    backends: RwLock<HashMap<ServerId, Arc<dyn RuntimeBackend>>>,
}

impl ClientPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Build clients for every server. Any bad server config fails the
    /// whole construction.
    pub fn from_servers<'a>(
        servers: impl IntoIterator<Item = &'a ServerRecord>,
        config: PoolConfig,
    ) -> RuntimeResult<Self> {
        let pool = Self::new(config);
        for server in servers {
            pool.add_server(server)?;
        }
        info!(servers = pool.len(), "client pool built");
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Build and register a client for `server`, replacing any existing one.
    pub fn add_server(&self, server: &ServerRecord) -> RuntimeResult<()> {
        let client = DockerClient::connect(server, &self.config)?;
        self.insert_backend(server.server_id.clone(), Arc::new(client));
        Ok(())
    }

    /// Register an already-built backend under `server_id`.
    pub fn insert_backend(&self, server_id: impl Into<ServerId>, backend: Arc<dyn RuntimeBackend>) {
        let server_id = server_id.into();
        let replaced = self
            .backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server_id.clone(), backend)
            .is_some();
        info!(%server_id, replaced, "runtime client registered");
    }

    /// Drop the client for `server_id`. In-flight calls keep their handle.
    pub fn remove_server(&self, server_id: &str) -> bool {
        let removed = self
            .backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(server_id)
            .is_some();
        if removed {
            info!(%server_id, "runtime client removed");
        }
        removed
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(server_id)
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.backends.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend handle for `server_id`. The lock is not held across calls.
    pub fn client(&self, server_id: &str) -> RuntimeResult<Arc<dyn RuntimeBackend>> {
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::Configuration(format!("no runtime client for server {server_id}"))
            })
    }

    // ── Forwarding operations ──────────────────────────────────────

    pub async fn create_container(
        &self,
        server_id: &str,
        spec: &ContainerSpec,
    ) -> RuntimeResult<ContainerId> {
        self.client(server_id)?.create_container(spec).await
    }

    pub async fn start_container(&self, server_id: &str, container_id: &str) -> RuntimeResult<()> {
        self.client(server_id)?.start_container(container_id).await
    }

    pub async fn stop_container(&self, server_id: &str, container_id: &str) -> RuntimeResult<()> {
        self.client(server_id)?.stop_container(container_id).await
    }

    pub async fn remove_container(&self, server_id: &str, container_id: &str) -> RuntimeResult<()> {
        self.client(server_id)?.remove_container(container_id).await
    }

    pub async fn exec_command(
        &self,
        server_id: &str,
        container_id: &str,
        cmd: &[String],
    ) -> RuntimeResult<ExecResult> {
        self.client(server_id)?.exec_command(container_id, cmd).await
    }

    pub async fn get_stats(&self, server_id: &str, container_id: &str) -> RuntimeResult<ContainerStats> {
        self.client(server_id)?.get_stats(container_id).await
    }

    pub async fn check_daemon_info(&self, server_id: &str) -> RuntimeResult<DaemonInfo> {
        self.client(server_id)?.check_daemon_info().await
    }
}

/// Serde helper for `"500ms"` / `"5s"` / `"2m"` duration strings.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Parse a duration string. Bare numbers are seconds.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(i) => s.split_at(i),
            None => (s, "s"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {s:?}"))?;
        let secs = |scale: u64| {
            value
                .checked_mul(scale)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration out of range: {s:?}"))
        };
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => secs(60),
            "h" => secs(3600),
            _ => Err(format!("invalid duration unit in {s:?}")),
        }
    }

    pub fn format(d: &Duration) -> String {
        if d.subsec_millis() != 0 || d.as_secs() == 0 {
            format!("{}ms", d.as_millis())
        } else {
            format!("{}s", d.as_secs())
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}
