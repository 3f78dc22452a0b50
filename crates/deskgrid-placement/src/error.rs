//! Placement error types.
//!
//! Each variant is a distinct, user-facing reason a workspace could not be
//! placed. Placement never retries with another server or strategy.

use thiserror::Error;

use deskgrid_state::RegistryError;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no healthy servers available")]
    NoHealthyServers,

    /// The pinned server is absent or not healthy.
    #[error("affinity server {0} is unavailable")]
    AffinityServerUnavailable(String),

    /// The `affinity` strategy was requested without a target server.
    #[error("affinity strategy requires an affinity server id")]
    MissingAffinityTarget,

    #[error(
        "insufficient capacity: {healthy} healthy server(s), {label_matched} matching labels, none with room"
    )]
    InsufficientCapacity { healthy: usize, label_matched: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl PlacementError {
    /// Whether the failure is about fleet capacity rather than health.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity { .. } | Self::Registry(RegistryError::CapacityExhausted(_))
        )
    }
}

pub type PlacementResult<T> = Result<T, PlacementError>;
