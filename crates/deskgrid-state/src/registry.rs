//! Registry — the single owner of mutable server and workspace state.
//!
//! Every mutation of a [`ServerRecord`]'s live counters or status goes
//! through this type. Readers get cloned snapshots; writers go through
//! short critical sections that never await. When a [`StateStore`] is
//! attached, each mutation is written through to it before the in-memory
//! copy is swapped, so the cache never runs ahead of durable state.
//!
//! Capacity is claimed with [`Registry::reserve_with`], which runs the
//! caller's selection over a snapshot and takes the hold under the same
//! write lock. Two concurrent placements therefore cannot both win the
//! last slot on a server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::store::StateStore;
use crate::types::*;

/// Outcome of one server-health check, as computed by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCheck {
    pub status: ServerStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// New daemon observation; `None` keeps the previous one.
    pub observed: Option<DaemonObservation>,
    pub checked_at: u64,
}

/// A counter correction made by [`Registry::reconcile_usage`].
#[derive(Debug, Clone, PartialEq)]
pub struct UsageCorrection {
    pub server_id: ServerId,
    pub previous_workspace_count: u32,
    pub corrected_workspace_count: u32,
}

#[derive(Default)]
struct Inner {
    servers: BTreeMap<ServerId, ServerRecord>,
    workspaces: HashMap<ContainerId, WorkspaceHealthRecord>,
    /// Capacity holds not yet committed to a container.
    pending: HashMap<u64, Reservation>,
}

/// In-memory, write-through cache of server and workspace state.
pub struct Registry {
    inner: RwLock<Inner>,
    store: Option<StateStore>,
    next_reservation: AtomicU64,
}

impl Registry {
    /// Registry without persistence (tests, ephemeral fleets).
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            store: None,
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Load persisted servers and workspace records, then reconcile the
    /// live counters against them. Holds that were pending when the
    /// previous process died are dropped by that reconciliation.
    ///
    /// A server persisted as `healthy` comes back `unhealthy`: it may have
    /// died while nothing was watching, so it must pass a fresh daemon
    /// check before placement uses it again.
    pub fn open(store: StateStore) -> RegistryResult<Self> {
        let mut inner = Inner::default();
        for mut server in store.list_servers()? {
            if server.status == ServerStatus::Healthy {
                server.status = ServerStatus::Unhealthy;
            }
            inner.servers.insert(server.server_id.clone(), server);
        }
        for workspace in store.list_workspaces()? {
            inner.workspaces.insert(workspace.container_id.clone(), workspace);
        }
        let (servers, workspaces) = (inner.servers.len(), inner.workspaces.len());

        let registry = Self {
            inner: RwLock::new(inner),
            store: Some(store),
            next_reservation: AtomicU64::new(1),
        };
        let corrections = registry.reconcile_usage()?;
        info!(
            servers,
            workspaces,
            corrections = corrections.len(),
            "registry loaded from state store"
        );
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_server(&self, server: &ServerRecord) -> RegistryResult<()> {
        if let Some(store) = &self.store {
            store.put_server(server)?;
        }
        Ok(())
    }

    fn persist_workspace(&self, record: &WorkspaceHealthRecord) -> RegistryResult<()> {
        if let Some(store) = &self.store {
            store.put_workspace(record)?;
        }
        Ok(())
    }

    // ── Servers ────────────────────────────────────────────────────

    /// Register a new server.
    pub fn add_server(&self, record: ServerRecord) -> RegistryResult<()> {
        let mut inner = self.write();
        if inner.servers.contains_key(&record.server_id) {
            return Err(RegistryError::DuplicateServer(record.server_id));
        }
        self.persist_server(&record)?;
        info!(server_id = %record.server_id, url = %record.base_url(), "server registered");
        inner.servers.insert(record.server_id.clone(), record);
        Ok(())
    }

    /// Deregister a server. Refused while it still hosts (or has pending
    /// holds for) any workspace.
    pub fn remove_server(&self, server_id: &str) -> RegistryResult<ServerRecord> {
        let mut inner = self.write();
        let server = inner
            .servers
            .get(server_id)
            .ok_or_else(|| RegistryError::ServerNotFound(server_id.to_string()))?;

        if server.current_workspace_count > 0 {
            return Err(RegistryError::ServerHasWorkspaces {
                server_id: server_id.to_string(),
                count: server.current_workspace_count,
            });
        }

        if let Some(store) = &self.store {
            store.delete_server(server_id)?;
        }
        info!(%server_id, "server deregistered");
        inner
            .servers
            .remove(server_id)
            .ok_or_else(|| RegistryError::ServerNotFound(server_id.to_string()))
    }

    pub fn get_server(&self, server_id: &str) -> Option<ServerRecord> {
        self.read().servers.get(server_id).cloned()
    }

    /// Consistent snapshot of every server, ordered by server id.
    pub fn list_servers(&self) -> Vec<ServerRecord> {
        self.read().servers.values().cloned().collect()
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.read().servers.keys().cloned().collect()
    }

    pub fn server_health(&self, server_id: &str) -> Option<ServerHealthSnapshot> {
        self.read()
            .servers
            .get(server_id)
            .map(ServerRecord::health_snapshot)
    }

    /// Apply a monitor check result. Returns the status the server had
    /// before the update.
    pub fn record_server_check(
        &self,
        server_id: &str,
        check: ServerCheck,
    ) -> RegistryResult<ServerStatus> {
        let mut inner = self.write();
        let current = inner
            .servers
            .get(server_id)
            .ok_or_else(|| RegistryError::ServerNotFound(server_id.to_string()))?;

        let previous = current.status;
        let mut updated = current.clone();
        updated.status = check.status;
        updated.consecutive_failures = check.consecutive_failures;
        updated.last_error = check.last_error;
        updated.last_health_check_at = Some(check.checked_at);
        if check.observed.is_some() {
            updated.observed = check.observed;
        }

        self.persist_server(&updated)?;
        inner.servers.insert(server_id.to_string(), updated);
        Ok(previous)
    }

    // ── Reservations ───────────────────────────────────────────────

    /// Select a server and hold `allocation` on it, atomically with
    /// respect to every other registry mutation.
    ///
    /// `select` sees a snapshot of all servers ordered by id and returns
    /// the chosen server id. Capacity is re-validated on the chosen record
    /// before the hold is taken.
    pub fn reserve_with<F, E>(&self, allocation: Allocation, select: F) -> Result<Reservation, E>
    where
        F: FnOnce(&[ServerRecord]) -> Result<ServerId, E>,
        E: From<RegistryError>,
    {
        let mut inner = self.write();
        let snapshot: Vec<ServerRecord> = inner.servers.values().cloned().collect();
        let server_id = select(&snapshot)?;

        let server = inner
            .servers
            .get(&server_id)
            .ok_or_else(|| RegistryError::ServerNotFound(server_id.clone()))?;
        if !server.fits(&allocation) {
            return Err(RegistryError::CapacityExhausted(server_id).into());
        }

        let mut updated = server.clone();
        updated.apply(&allocation);
        self.persist_server(&updated)?;
        inner.servers.insert(server_id.clone(), updated);

        let reservation = Reservation {
            id: self.next_reservation.fetch_add(1, Ordering::Relaxed),
            server_id,
            allocation,
        };
        inner.pending.insert(reservation.id, reservation.clone());
        debug!(
            reservation = reservation.id,
            server_id = %reservation.server_id,
            cpu = allocation.cpu_cores,
            memory_mb = allocation.memory_mb,
            "capacity reserved"
        );
        Ok(reservation)
    }

    /// Hold `allocation` on a specific server.
    pub fn reserve(&self, server_id: &str, allocation: Allocation) -> RegistryResult<Reservation> {
        self.reserve_with(allocation, |servers| {
            servers
                .iter()
                .find(|s| s.server_id == server_id)
                .map(|s| s.server_id.clone())
                .ok_or_else(|| RegistryError::ServerNotFound(server_id.to_string()))
        })
    }

    /// Roll back a pending hold. Returns `false` if the hold was already
    /// released or committed.
    pub fn release(&self, reservation: &Reservation) -> RegistryResult<bool> {
        let mut inner = self.write();
        let Some(held) = inner.pending.remove(&reservation.id) else {
            return Ok(false);
        };

        let Some(server) = inner.servers.get(&held.server_id) else {
            return Err(RegistryError::ServerNotFound(held.server_id));
        };
        let mut updated = server.clone();
        let underflow = updated.retract(&held.allocation);
        self.persist_server(&updated)?;
        inner.servers.insert(held.server_id.clone(), updated);

        if let Some(field) = underflow {
            return Err(RegistryError::CounterUnderflow {
                server_id: held.server_id,
                field,
            });
        }
        debug!(reservation = held.id, server_id = %held.server_id, "reservation released");
        Ok(true)
    }

    /// Turn a pending hold into a live workspace record. The counters were
    /// already bumped by the reservation, so they are left untouched.
    pub fn commit(
        &self,
        reservation: &Reservation,
        container_id: &str,
        started_at: u64,
    ) -> RegistryResult<WorkspaceHealthRecord> {
        let mut inner = self.write();
        if !inner.pending.contains_key(&reservation.id) {
            return Err(RegistryError::ReservationNotFound(reservation.id));
        }

        let record = WorkspaceHealthRecord {
            container_id: container_id.to_string(),
            server_id: reservation.server_id.clone(),
            running: true,
            healthy: false,
            cpu_percent: 0.0,
            memory_usage_mb: 0,
            started_at,
            last_check_at: None,
            last_error: None,
            allocation: reservation.allocation,
            consecutive_probe_failures: 0,
        };
        self.persist_workspace(&record)?;
        inner.pending.remove(&reservation.id);
        inner
            .workspaces
            .insert(record.container_id.clone(), record.clone());
        info!(%container_id, server_id = %record.server_id, "workspace committed");
        Ok(record)
    }

    pub fn pending_reservations(&self) -> usize {
        self.read().pending.len()
    }

    // ── Workspaces ─────────────────────────────────────────────────

    pub fn get_workspace(&self, container_id: &str) -> Option<WorkspaceHealthRecord> {
        self.read().workspaces.get(container_id).cloned()
    }

    /// All workspace records, ordered by container id.
    pub fn list_workspaces(&self) -> Vec<WorkspaceHealthRecord> {
        let mut records: Vec<_> = self.read().workspaces.values().cloned().collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    pub fn workspace_health(&self, container_id: &str) -> Option<WorkspaceHealthSnapshot> {
        self.read()
            .workspaces
            .get(container_id)
            .map(WorkspaceHealthRecord::snapshot)
    }

    /// Mutate one workspace record in place. Returns the updated record,
    /// or `None` if it has already been removed.
    pub fn update_workspace<F>(
        &self,
        container_id: &str,
        f: F,
    ) -> RegistryResult<Option<WorkspaceHealthRecord>>
    where
        F: FnOnce(&mut WorkspaceHealthRecord),
    {
        let mut inner = self.write();
        let Some(current) = inner.workspaces.get(container_id) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        f(&mut updated);
        self.persist_workspace(&updated)?;
        inner
            .workspaces
            .insert(container_id.to_string(), updated.clone());
        Ok(Some(updated))
    }

    /// Drop a workspace record and release its capacity.
    ///
    /// Idempotent: only the first call for a container returns the record
    /// and decrements the owning server's counters.
    pub fn remove_workspace(
        &self,
        container_id: &str,
    ) -> RegistryResult<Option<WorkspaceHealthRecord>> {
        let mut inner = self.write();
        let Some(record) = inner.workspaces.get(container_id).cloned() else {
            return Ok(None);
        };

        if let Some(store) = &self.store {
            store.delete_workspace(container_id)?;
        }
        inner.workspaces.remove(container_id);

        match inner.servers.get(&record.server_id) {
            Some(server) => {
                let mut updated = server.clone();
                if let Some(field) = updated.retract(&record.allocation) {
                    warn!(
                        server_id = %record.server_id,
                        %container_id,
                        field,
                        "counter underflow on workspace removal; clamped to zero"
                    );
                }
                self.persist_server(&updated)?;
                inner.servers.insert(record.server_id.clone(), updated);
            }
            None => {
                warn!(server_id = %record.server_id, %container_id, "removed workspace of unknown server");
            }
        }

        info!(%container_id, server_id = %record.server_id, "workspace removed");
        Ok(Some(record))
    }

    /// Recompute every server's live counters from its live workspace
    /// records plus its pending holds, correcting any drift.
    pub fn reconcile_usage(&self) -> RegistryResult<Vec<UsageCorrection>> {
        let mut inner = self.write();

        let mut expected: HashMap<&str, (Allocation, u32)> = HashMap::new();
        let allocations = inner
            .workspaces
            .values()
            .map(|w| (w.server_id.as_str(), w.allocation))
            .chain(
                inner
                    .pending
                    .values()
                    .map(|r| (r.server_id.as_str(), r.allocation)),
            );
        for (server_id, alloc) in allocations {
            let entry = expected.entry(server_id).or_default();
            entry.0.cpu_cores += alloc.cpu_cores;
            entry.0.memory_mb += alloc.memory_mb;
            entry.0.disk_gb += alloc.disk_gb;
            entry.1 += 1;
        }

        let mut updates = Vec::new();
        let mut corrections = Vec::new();
        for server in inner.servers.values() {
            let (usage, count) = expected
                .get(server.server_id.as_str())
                .copied()
                .unwrap_or_default();

            let drifted = server.current_workspace_count != count
                || (server.current_cpu_used - usage.cpu_cores).abs() > CPU_EPSILON
                || server.current_memory_used_mb != usage.memory_mb
                || server.current_disk_used_gb != usage.disk_gb;
            if !drifted {
                continue;
            }

            let mut updated = server.clone();
            updated.current_cpu_used = usage.cpu_cores;
            updated.current_memory_used_mb = usage.memory_mb;
            updated.current_disk_used_gb = usage.disk_gb;
            updated.current_workspace_count = count;

            if server.current_workspace_count != count {
                warn!(
                    server_id = %server.server_id,
                    recorded = server.current_workspace_count,
                    actual = count,
                    "workspace count drift corrected"
                );
            }
            corrections.push(UsageCorrection {
                server_id: server.server_id.clone(),
                previous_workspace_count: server.current_workspace_count,
                corrected_workspace_count: count,
            });
            updates.push(updated);
        }

        for updated in updates {
            self.persist_server(&updated)?;
            inner.servers.insert(updated.server_id.clone(), updated);
        }
        Ok(corrections)
    }
}
