//! Monitor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use deskgrid_runtime::duration_str;

/// Cadence, timeouts and thresholds for both polling loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between server-health ticks.
    #[serde(with = "duration_str")]
    pub server_interval: Duration,
    /// Time between workspace-health ticks.
    #[serde(with = "duration_str")]
    pub workspace_interval: Duration,
    /// Deadline for each remote call made by a check.
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
    /// Deadline for a whole tick; unfinished checks count as failed.
    #[serde(with = "duration_str")]
    pub tick_timeout: Duration,
    /// Consecutive failed daemon checks before a server goes offline.
    pub offline_threshold: u32,
    /// Consecutive failed probes before a running workspace is unhealthy.
    pub unresponsive_threshold: u32,
    /// Checks in flight at once, across all servers.
    pub max_concurrent_checks: usize,
    /// Command exec'd inside each workspace; exit code 0 means responsive.
    /// Empty disables the probe.
    pub probe_command: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server_interval: Duration::from_secs(15),
            workspace_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            tick_timeout: Duration::from_secs(20),
            offline_threshold: 3,
            unresponsive_threshold: 3,
            max_concurrent_checks: 8,
            probe_command: vec!["supervisorctl".to_string(), "status".to_string()],
        }
    }
}

impl MonitorConfig {
    /// Reject values that would stall or disable the loops.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_interval.is_zero() || self.workspace_interval.is_zero() {
            return Err("monitor intervals must be greater than zero".to_string());
        }
        if self.call_timeout.is_zero() || self.tick_timeout.is_zero() {
            return Err("monitor timeouts must be greater than zero".to_string());
        }
        if self.offline_threshold == 0 || self.unresponsive_threshold == 0 {
            return Err("monitor thresholds must be at least 1".to_string());
        }
        if self.max_concurrent_checks == 0 {
            return Err("max_concurrent_checks must be at least 1".to_string());
        }
        Ok(())
    }
}
