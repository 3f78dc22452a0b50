//! Health state machines for servers and workspaces.
//!
//! Trackers are rebuilt from the persisted record on every check, so the
//! registry stays the only place the counters live.

use tracing::{debug, warn};

use deskgrid_state::{ServerRecord, ServerStatus, WorkspaceHealthRecord};

/// Result of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The check answered successfully.
    Healthy,
    /// The check answered, but negatively (non-zero probe exit).
    Unhealthy,
    /// The check could not be carried out (unreachable, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Consecutive-failure tracking for one server.
///
/// One failure makes a server `unhealthy`; `offline_threshold` consecutive
/// failures make it `offline`. A single success restores `healthy`.
#[derive(Debug)]
pub struct ServerHealthTracker {
    status: ServerStatus,
    consecutive_failures: u32,
    offline_threshold: u32,
}

impl ServerHealthTracker {
    pub fn new(status: ServerStatus, consecutive_failures: u32, offline_threshold: u32) -> Self {
        Self {
            status,
            consecutive_failures,
            offline_threshold: offline_threshold.max(1),
        }
    }

    pub fn from_record(record: &ServerRecord, offline_threshold: u32) -> Self {
        Self::new(record.status, record.consecutive_failures, offline_threshold)
    }

    /// Record a check result and return the new status.
    pub fn record(&mut self, result: ProbeResult) -> ServerStatus {
        if result.is_success() {
            if self.status != ServerStatus::Healthy {
                debug!(
                    previous = %self.status,
                    failures = self.consecutive_failures,
                    "server recovered to healthy"
                );
            }
            self.consecutive_failures = 0;
            self.status = ServerStatus::Healthy;
            return self.status;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let next = if self.consecutive_failures >= self.offline_threshold {
            ServerStatus::Offline
        } else {
            ServerStatus::Unhealthy
        };
        if next != self.status && next == ServerStatus::Offline {
            warn!(
                failures = self.consecutive_failures,
                threshold = self.offline_threshold,
                "server marked offline"
            );
        }
        self.status = next;
        self.status
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Responsiveness tracking for one running workspace.
///
/// A new workspace is unhealthy until its first successful probe. Once
/// healthy, it stays healthy until `unresponsive_threshold` consecutive
/// probes fail.
#[derive(Debug)]
pub struct WorkspaceProbeTracker {
    healthy: bool,
    consecutive_failures: u32,
    unresponsive_threshold: u32,
}

impl WorkspaceProbeTracker {
    pub fn from_record(record: &WorkspaceHealthRecord, unresponsive_threshold: u32) -> Self {
        Self {
            healthy: record.healthy,
            consecutive_failures: record.consecutive_probe_failures,
            unresponsive_threshold: unresponsive_threshold.max(1),
        }
    }

    /// Record a probe result and return whether the workspace is healthy.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        if result.is_success() {
            self.consecutive_failures = 0;
            self.healthy = true;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.unresponsive_threshold {
                self.healthy = false;
            }
        }
        self.healthy
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskgrid_state::Allocation;

    fn workspace(healthy: bool, failures: u32) -> WorkspaceHealthRecord {
        WorkspaceHealthRecord {
            container_id: "c1".to_string(),
            server_id: "srv-1".to_string(),
            running: true,
            healthy,
            cpu_percent: 0.0,
            memory_usage_mb: 0,
            started_at: 0,
            last_check_at: None,
            last_error: None,
            allocation: Allocation::default(),
            consecutive_probe_failures: failures,
        }
    }

    #[test]
    fn server_degrades_then_goes_offline() {
        let mut tracker = ServerHealthTracker::new(ServerStatus::Healthy, 0, 3);

        assert_eq!(tracker.record(ProbeResult::Failed), ServerStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Failed), ServerStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Failed), ServerStatus::Offline);
        assert_eq!(tracker.consecutive_failures(), 3);

        assert_eq!(tracker.record(ProbeResult::Failed), ServerStatus::Offline);
    }

    #[test]
    fn single_success_recovers_offline_server() {
        let mut tracker = ServerHealthTracker::new(ServerStatus::Offline, 7, 3);
        assert_eq!(tracker.record(ProbeResult::Healthy), ServerStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn threshold_of_one_goes_straight_offline() {
        let mut tracker = ServerHealthTracker::new(ServerStatus::Healthy, 0, 1);
        assert_eq!(tracker.record(ProbeResult::Failed), ServerStatus::Offline);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut tracker = ServerHealthTracker::new(ServerStatus::Healthy, 0, 3);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.record(ProbeResult::Failed), ServerStatus::Unhealthy);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn new_workspace_needs_a_successful_probe() {
        let mut tracker = WorkspaceProbeTracker::from_record(&workspace(false, 0), 3);
        assert!(!tracker.record(ProbeResult::Unhealthy));
        assert!(tracker.record(ProbeResult::Healthy));
    }

    #[test]
    fn healthy_workspace_tolerates_blips() {
        let mut tracker = WorkspaceProbeTracker::from_record(&workspace(true, 0), 3);
        assert!(tracker.record(ProbeResult::Unhealthy));
        assert!(tracker.record(ProbeResult::Failed));
        assert!(!tracker.record(ProbeResult::Unhealthy));
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn workspace_streak_resumes_from_record() {
        let mut tracker = WorkspaceProbeTracker::from_record(&workspace(true, 2), 3);
        assert!(!tracker.record(ProbeResult::Unhealthy));
    }
}
