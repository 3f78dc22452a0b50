//! The entry point callers use to place, create and destroy workspaces.
//!
//! Placing a workspace runs as one sequence:
//!
//! 1. select a server and hold capacity on it (one registry critical section)
//! 2. create and start the container on that server
//! 3. commit the hold into a workspace record
//!
//! The hold lives in a [`ReservationGuard`], so any failure in step 2, or
//! the caller dropping the future, returns the capacity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use deskgrid_placement::{Placement, PlacementError, PlacementStrategy, Placer};
use deskgrid_runtime::{ClientPool, ContainerSpec, DockerClient, RuntimeError};
use deskgrid_state::{
    ContainerId, Registry, RegistryError, ResourceRequirements, ServerConfig, ServerHealthSnapshot, ServerId,
    ServerRecord, WorkspaceHealthRecord, WorkspaceHealthSnapshot, epoch_secs,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::reservation::ReservationGuard;

/// Where a new workspace ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedWorkspace {
    pub server_id: ServerId,
    pub container_id: ContainerId,
    pub strategy: PlacementStrategy,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    pool: Arc<ClientPool>,
    placer: Placer,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, pool: Arc<ClientPool>) -> Self {
        Self {
            registry,
            pool,
            placer: Placer::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Preview where `requirements` would land. Reserves nothing and does
    /// not move the round-robin cursor.
    pub fn find_placement(
        &self,
        requirements: &ResourceRequirements,
        strategy: PlacementStrategy,
    ) -> OrchestratorResult<Placement> {
        let servers = self.registry.list_servers();
        Ok(self.placer.preview(requirements, strategy, &servers)?)
    }

    /// Choose a server, hold capacity, then create and start the container.
    pub async fn place_workspace(
        &self,
        requirements: &ResourceRequirements,
        strategy: PlacementStrategy,
        spec: &ContainerSpec,
    ) -> OrchestratorResult<PlacedWorkspace> {
        let reservation = self
            .registry
            .reserve_with(requirements.allocation(), |servers| {
                self.placer
                    .place(requirements, strategy, servers)
                    .map(|placement| placement.server_id)
            })
            .map_err(|e: PlacementError| {
                warn!(%strategy, error = %e, "placement failed");
                e
            })?;

        let guard = ReservationGuard::new(self.registry.clone(), reservation);
        let server_id = guard.server_id().to_string();
        debug!(%server_id, %strategy, "capacity held, creating container");

        let container_id = self.launch(guard, spec).await?;
        Ok(PlacedWorkspace {
            server_id,
            container_id,
            strategy,
        })
    }

    /// Create a workspace on a specific server, bypassing strategy
    /// selection. Capacity is still checked and held.
    ///
    /// Naming a server the fleet does not know is a configuration error,
    /// the same one the client pool reports for it.
    pub async fn create_workspace(
        &self,
        server_id: &str,
        requirements: &ResourceRequirements,
        spec: &ContainerSpec,
    ) -> OrchestratorResult<ContainerId> {
        let reservation = self
            .registry
            .reserve(server_id, requirements.allocation())
            .map_err(|e| match e {
                RegistryError::ServerNotFound(id) => OrchestratorError::Runtime(
                    RuntimeError::Configuration(format!("unknown server {id}")),
                ),
                e => OrchestratorError::from(e),
            })?;
        let guard = ReservationGuard::new(self.registry.clone(), reservation);
        self.launch(guard, spec).await
    }

    async fn launch(
        &self,
        guard: ReservationGuard,
        spec: &ContainerSpec,
    ) -> OrchestratorResult<ContainerId> {
        let server_id = guard.server_id().to_string();
        let spec = spec.clone().with_limits(&guard.allocation());

        let container_id = match self.pool.create_container(&server_id, &spec).await {
            Ok(id) => id,
            Err(e) => return Err(fail_with(guard, e.into())),
        };

        if let Err(e) = self.pool.start_container(&server_id, &container_id).await {
            if let Err(cleanup) = self.pool.remove_container(&server_id, &container_id).await {
                warn!(%server_id, %container_id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(fail_with(guard, e.into()));
        }

        // A failed commit drops the guard armed, which releases the hold.
        let record = match guard.commit(&container_id, epoch_secs()) {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = self.pool.remove_container(&server_id, &container_id).await {
                    warn!(%server_id, %container_id, error = %cleanup, "failed to remove unrecorded container");
                }
                return Err(e);
            }
        };
        info!(
            %server_id,
            %container_id,
            image = %spec.image,
            cpu = record.allocation.cpu_cores,
            memory_mb = record.allocation.memory_mb,
            "workspace started"
        );
        Ok(container_id)
    }

    /// Stop and remove a workspace's container, then drop its record.
    ///
    /// Returns `None` if the workspace is already gone. If the daemon
    /// cannot be reached the record is kept and the error returned.
    pub async fn destroy_workspace(
        &self,
        container_id: &str,
    ) -> OrchestratorResult<Option<WorkspaceHealthRecord>> {
        let Some(record) = self.registry.get_workspace(container_id) else {
            debug!(%container_id, "destroy of unknown workspace");
            return Ok(None);
        };
        let server_id = record.server_id.as_str();

        self.pool.stop_container(server_id, container_id).await?;
        self.pool.remove_container(server_id, container_id).await?;

        let removed = self.registry.remove_workspace(container_id)?;
        if removed.is_some() {
            info!(%container_id, %server_id, "workspace destroyed");
        }
        Ok(removed)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_server_health(&self, server_id: &str) -> OrchestratorResult<ServerHealthSnapshot> {
        self.registry
            .server_health(server_id)
            .ok_or_else(|| OrchestratorError::ServerNotFound(server_id.to_string()))
    }

    pub fn get_workspace_health(
        &self,
        container_id: &str,
    ) -> OrchestratorResult<WorkspaceHealthSnapshot> {
        self.registry
            .workspace_health(container_id)
            .ok_or_else(|| OrchestratorError::WorkspaceNotFound(container_id.to_string()))
    }

    /// Every server, ordered by id.
    pub fn list_servers(&self) -> Vec<ServerRecord> {
        self.registry.list_servers()
    }

    pub fn list_workspaces(&self) -> Vec<WorkspaceHealthRecord> {
        self.registry.list_workspaces()
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a server at runtime. The client is built (and its TLS
    /// bundle validated) before the registry learns about the server.
    /// New servers stay out of placement until their first healthy check.
    pub fn add_server(&self, config: ServerConfig) -> OrchestratorResult<ServerRecord> {
        let record = ServerRecord::from_config(config);
        let client = DockerClient::connect(&record, self.pool.config())?;
        self.registry.add_server(record.clone())?;
        self.pool.insert_backend(record.server_id.clone(), Arc::new(client));
        Ok(record)
    }

    /// Deregister a server. Refused while it hosts workspaces or holds.
    pub fn remove_server(&self, server_id: &str) -> OrchestratorResult<ServerRecord> {
        let record = self.registry.remove_server(server_id)?;
        self.pool.remove_server(server_id);
        Ok(record)
    }
}

/// Roll back `guard` after `cause`. A failed rollback takes precedence
/// since it leaves the counters wrong.
fn fail_with(guard: ReservationGuard, cause: OrchestratorError) -> OrchestratorError {
    let server_id = guard.server_id().to_string();
    match guard.release() {
        Ok(()) => {
            warn!(%server_id, error = %cause, "workspace launch failed, capacity released");
            cause
        }
        Err(rollback) => {
            error!(%server_id, error = %cause, "workspace launch failed and rollback failed");
            rollback
        }
    }
}
