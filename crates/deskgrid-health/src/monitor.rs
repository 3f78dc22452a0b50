//! Health monitor — two independent polling loops over the fleet.
//!
//! The server loop asks every daemon for `/info` and drives each server
//! through healthy → unhealthy → offline. The workspace loop inspects every
//! running workspace, removes the ones whose container is gone, and probes
//! the rest for responsiveness.
//!
//! Each tick fans out over a shared, bounded set of permits, gives every
//! remote call its own timeout, and gives up on stragglers at the tick
//! deadline. A loop never starts a tick before the previous one finished.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use deskgrid_runtime::{ClientPool, ContainerStats, DaemonInfo};
use deskgrid_state::*;

use crate::checker::{ProbeResult, ServerHealthTracker, WorkspaceProbeTracker};
use crate::config::MonitorConfig;

const EVENT_CAPACITY: usize = 256;

pub const SERVER_OFFLINE: &str = "server offline";

/// Something the monitor changed in the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    ServerStatusChanged {
        server_id: ServerId,
        previous: ServerStatus,
        current: ServerStatus,
        last_error: Option<String>,
    },
    /// The container no longer runs; its record was removed.
    WorkspaceGone {
        container_id: ContainerId,
        server_id: ServerId,
        state: String,
    },
    WorkspaceHealthChanged {
        container_id: ContainerId,
        server_id: ServerId,
        healthy: bool,
        last_error: Option<String>,
    },
    UsageCorrected {
        server_id: ServerId,
        previous_workspace_count: u32,
        corrected_workspace_count: u32,
    },
}

/// What one server tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTickSummary {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub transitions: usize,
}

/// What one workspace tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceTickSummary {
    pub checked: usize,
    pub removed: usize,
    /// Not contacted because the owning server is offline.
    pub skipped: usize,
    pub unhealthy: usize,
    pub corrections: usize,
}

enum WorkspaceObservation {
    Gone {
        state: String,
    },
    Running {
        stats: ContainerStats,
        probe: ProbeResult,
        probe_error: Option<String>,
    },
    Unreachable(String),
}

/// Handles for the two spawned loops.
pub struct MonitorHandle {
    pub server: JoinHandle<()>,
    pub workspace: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wait for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.server.await {
            error!(error = %e, "server health loop panicked");
        }
        if let Err(e) = self.workspace.await {
            error!(error = %e, "workspace health loop panicked");
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    pool: Arc<ClientPool>,
    config: MonitorConfig,
    limiter: Arc<Semaphore>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, pool: Arc<ClientPool>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            pool,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_checks.max(1))),
            config,
            events,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: HealthEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Start both loops. They exit when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> MonitorHandle {
        info!(
            server_interval = ?self.config.server_interval,
            workspace_interval = ?self.config.workspace_interval,
            max_concurrent = self.config.max_concurrent_checks,
            "health monitor started"
        );
        MonitorHandle {
            server: tokio::spawn(self.clone().run_server_loop(shutdown.clone())),
            workspace: tokio::spawn(self.clone().run_workspace_loop(shutdown)),
        }
    }

    async fn run_server_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.server_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.server_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("server health loop shutting down");
    }

    async fn run_workspace_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.workspace_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.workspace_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("workspace health loop shutting down");
    }

    /// Run `checks` concurrently under the global limit. Checks still
    /// running at the tick deadline are aborted and reported as `None`.
    async fn fan_out<T, Fut>(&self, checks: Vec<(String, Fut)>) -> BTreeMap<String, Option<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let deadline = Instant::now() + self.config.tick_timeout;
        let mut results: BTreeMap<String, Option<T>> = BTreeMap::new();
        let mut set = JoinSet::new();

        for (key, check) in checks {
            results.insert(key.clone(), None);
            let limiter = self.limiter.clone();
            set.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                (key, check.await)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((key, value)))) => {
                    results.insert(key, Some(value));
                }
                Ok(Some(Err(e))) => warn!(error = %e, "health check task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = set.len(), "tick deadline reached, abandoning slow checks");
                    set.abort_all();
                    break;
                }
            }
        }
        results
    }

    // ── Server health ──────────────────────────────────────────────

    /// Check every registered server once.
    pub async fn server_tick(&self) -> ServerTickSummary {
        let call_timeout = self.config.call_timeout;
        let checks: Vec<_> = self
            .registry
            .server_ids()
            .into_iter()
            .map(|server_id| {
                let pool = self.pool.clone();
                let id = server_id.clone();
                let check = async move {
                    match timeout(call_timeout, pool.check_daemon_info(&id)).await {
                        Ok(Ok(info)) => Ok(info),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("daemon info timed out after {call_timeout:?}")),
                    }
                };
                (server_id, check)
            })
            .collect();

        let mut summary = ServerTickSummary::default();
        for (server_id, outcome) in self.fan_out(checks).await {
            let outcome = outcome
                .unwrap_or_else(|| Err("check did not finish before the tick deadline".to_string()));
            summary.checked += 1;
            if outcome.is_ok() {
                summary.healthy += 1;
            } else {
                summary.failed += 1;
            }
            if self.apply_server_check(&server_id, outcome) {
                summary.transitions += 1;
            }
        }

        debug!(
            checked = summary.checked,
            healthy = summary.healthy,
            failed = summary.failed,
            transitions = summary.transitions,
            "server health tick complete"
        );
        summary
    }

    /// Fold one check result into the registry. Returns whether the
    /// server's status changed.
    fn apply_server_check(&self, server_id: &str, outcome: Result<DaemonInfo, String>) -> bool {
        let Some(record) = self.registry.get_server(server_id) else {
            debug!(%server_id, "server removed during health tick");
            return false;
        };

        let mut tracker = ServerHealthTracker::from_record(&record, self.config.offline_threshold);
        let (result, last_error, observed) = match outcome {
            Ok(info) => (ProbeResult::Healthy, None, Some(info.observation())),
            Err(e) => (ProbeResult::Failed, Some(e), None),
        };
        let status = tracker.record(result);

        let check = ServerCheck {
            status,
            consecutive_failures: tracker.consecutive_failures(),
            last_error: last_error.clone(),
            observed,
            checked_at: epoch_secs(),
        };
        let previous = match self.registry.record_server_check(server_id, check) {
            Ok(previous) => previous,
            Err(e) => {
                error!(%server_id, error = %e, "failed to record server check");
                return false;
            }
        };
        if previous == status {
            return false;
        }

        match status {
            ServerStatus::Healthy => info!(%server_id, %previous, "server healthy"),
            ServerStatus::Unhealthy => {
                warn!(%server_id, %previous, error = ?last_error, "server unhealthy")
            }
            ServerStatus::Offline => error!(
                %server_id,
                failures = tracker.consecutive_failures(),
                error = ?last_error,
                "server offline"
            ),
        }
        self.emit(HealthEvent::ServerStatusChanged {
            server_id: server_id.to_string(),
            previous,
            current: status,
            last_error,
        });
        true
    }

    // ── Workspace health ───────────────────────────────────────────

    /// Check every workspace once, then reconcile server counters.
    pub async fn workspace_tick(&self) -> WorkspaceTickSummary {
        let statuses: HashMap<ServerId, ServerStatus> = self
            .registry
            .list_servers()
            .into_iter()
            .map(|s| (s.server_id, s.status))
            .collect();

        let mut summary = WorkspaceTickSummary::default();
        let mut checks = Vec::new();
        for record in self.registry.list_workspaces() {
            match statuses.get(&record.server_id) {
                Some(ServerStatus::Offline) => {
                    summary.skipped += 1;
                    self.mark_unreachable(&record.container_id, SERVER_OFFLINE);
                }
                None => {
                    summary.skipped += 1;
                    self.mark_unreachable(&record.container_id, "server not registered");
                }
                Some(_) => {
                    let check = observe_workspace(
                        self.pool.clone(),
                        record.server_id.clone(),
                        record.container_id.clone(),
                        self.config.probe_command.clone(),
                        self.config.call_timeout,
                    );
                    checks.push((record.container_id, check));
                }
            }
        }

        for (container_id, observation) in self.fan_out(checks).await {
            summary.checked += 1;
            let observation = observation.unwrap_or_else(|| {
                WorkspaceObservation::Unreachable(
                    "check did not finish before the tick deadline".to_string(),
                )
            });
            match observation {
                WorkspaceObservation::Gone { state } => {
                    if self.remove_gone(&container_id, state) {
                        summary.removed += 1;
                    }
                }
                WorkspaceObservation::Running {
                    stats,
                    probe,
                    probe_error,
                } => {
                    if !self.apply_probe(&container_id, probe, probe_error, Some(stats)) {
                        summary.unhealthy += 1;
                    }
                }
                WorkspaceObservation::Unreachable(cause) => {
                    if !self.apply_probe(&container_id, ProbeResult::Failed, Some(cause), None) {
                        summary.unhealthy += 1;
                    }
                }
            }
        }

        match self.registry.reconcile_usage() {
            Ok(corrections) => {
                summary.corrections = corrections.len();
                for c in corrections {
                    self.emit(HealthEvent::UsageCorrected {
                        server_id: c.server_id,
                        previous_workspace_count: c.previous_workspace_count,
                        corrected_workspace_count: c.corrected_workspace_count,
                    });
                }
            }
            Err(e) => error!(error = %e, "usage reconciliation failed"),
        }

        debug!(
            checked = summary.checked,
            removed = summary.removed,
            skipped = summary.skipped,
            unhealthy = summary.unhealthy,
            corrections = summary.corrections,
            "workspace health tick complete"
        );
        summary
    }

    /// Returns true only for the call that actually removed the record.
    fn remove_gone(&self, container_id: &str, state: String) -> bool {
        match self.registry.remove_workspace(container_id) {
            Ok(Some(record)) => {
                info!(%container_id, server_id = %record.server_id, %state, "workspace container gone");
                self.emit(HealthEvent::WorkspaceGone {
                    container_id: container_id.to_string(),
                    server_id: record.server_id,
                    state,
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(%container_id, error = %e, "failed to remove gone workspace");
                false
            }
        }
    }

    /// Fold one probe into the record. Returns the resulting `healthy`
    /// (true if the record no longer exists).
    fn apply_probe(
        &self,
        container_id: &str,
        probe: ProbeResult,
        error: Option<String>,
        stats: Option<ContainerStats>,
    ) -> bool {
        let threshold = self.config.unresponsive_threshold;
        let mut was_healthy = false;
        let updated = self.registry.update_workspace(container_id, |record| {
            was_healthy = record.healthy;
            let mut tracker = WorkspaceProbeTracker::from_record(record, threshold);
            record.healthy = tracker.record(probe);
            record.consecutive_probe_failures = tracker.consecutive_failures();
            record.last_check_at = Some(epoch_secs());
            record.last_error = error;
            if let Some(stats) = stats {
                record.running = true;
                record.cpu_percent = stats.cpu_percent;
                record.memory_usage_mb = stats.memory_usage_mb;
            }
        });
        self.after_update(container_id, was_healthy, updated)
    }

    /// Flag a workspace whose server cannot be contacted. The record is
    /// kept: the container may still exist when the server returns.
    fn mark_unreachable(&self, container_id: &str, reason: &str) {
        let mut was_healthy = false;
        let updated = self.registry.update_workspace(container_id, |record| {
            was_healthy = record.healthy;
            record.healthy = false;
            record.last_error = Some(reason.to_string());
            record.last_check_at = Some(epoch_secs());
        });
        self.after_update(container_id, was_healthy, updated);
    }

    fn after_update(
        &self,
        container_id: &str,
        was_healthy: bool,
        updated: RegistryResult<Option<WorkspaceHealthRecord>>,
    ) -> bool {
        let record = match updated {
            Ok(Some(record)) => record,
            Ok(None) => return true,
            Err(e) => {
                error!(%container_id, error = %e, "failed to update workspace health");
                return true;
            }
        };
        if record.healthy != was_healthy {
            if record.healthy {
                info!(%container_id, server_id = %record.server_id, "workspace healthy");
            } else {
                warn!(
                    %container_id,
                    server_id = %record.server_id,
                    error = ?record.last_error,
                    "workspace unhealthy"
                );
            }
            self.emit(HealthEvent::WorkspaceHealthChanged {
                container_id: container_id.to_string(),
                server_id: record.server_id.clone(),
                healthy: record.healthy,
                last_error: record.last_error.clone(),
            });
        }
        record.healthy
    }
}

async fn observe_workspace(
    pool: Arc<ClientPool>,
    server_id: ServerId,
    container_id: ContainerId,
    probe_command: Vec<String>,
    call_timeout: std::time::Duration,
) -> WorkspaceObservation {
    let stats = match timeout(call_timeout, pool.get_stats(&server_id, &container_id)).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => return WorkspaceObservation::Unreachable(e.to_string()),
        Err(_) => {
            return WorkspaceObservation::Unreachable(format!(
                "stats timed out after {call_timeout:?}"
            ));
        }
    };
    if !stats.running {
        return WorkspaceObservation::Gone { state: stats.state };
    }
    if probe_command.is_empty() {
        return WorkspaceObservation::Running {
            stats,
            probe: ProbeResult::Healthy,
            probe_error: None,
        };
    }

    let exec = timeout(
        call_timeout,
        pool.exec_command(&server_id, &container_id, &probe_command),
    )
    .await;
    let (probe, probe_error) = match exec {
        Ok(Ok(result)) if result.success() => (ProbeResult::Healthy, None),
        Ok(Ok(result)) => (
            ProbeResult::Unhealthy,
            Some(format!(
                "probe exited with {}: {}",
                result.exit_code,
                result.output.trim()
            )),
        ),
        Ok(Err(e)) => (ProbeResult::Failed, Some(e.to_string())),
        Err(_) => (
            ProbeResult::Failed,
            Some(format!("probe timed out after {call_timeout:?}")),
        ),
    };
    WorkspaceObservation::Running {
        stats,
        probe,
        probe_error,
    }
}
