//! Orchestrator error types.

use thiserror::Error;

use deskgrid_placement::PlacementError;
use deskgrid_runtime::RuntimeError;
use deskgrid_state::RegistryError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No server could be chosen; the variant says why.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// The chosen server's daemon failed, or its config is unusable.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A capacity hold could not be returned. The server's counters may
    /// now overstate its usage until the next reconciliation.
    #[error("failed to roll back reservation {reservation} on server {server_id}: {cause}")]
    ReservationRollback {
        reservation: u64,
        server_id: String,
        cause: String,
    },

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),
}

impl OrchestratorError {
    /// Worth retrying against another server (caller policy).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_unavailable())
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
