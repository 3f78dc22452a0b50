//! Scoped capacity holds.
//!
//! A [`ReservationGuard`] owns one pending [`Reservation`]. It is either
//! committed into a workspace record or released; dropping it uncommitted
//! (an error path, or the caller abandoning the future) releases the hold.

use std::sync::Arc;

use tracing::{debug, error};

use deskgrid_state::{Allocation, Registry, Reservation, WorkspaceHealthRecord};

use crate::error::{OrchestratorError, OrchestratorResult};

pub struct ReservationGuard {
    registry: Arc<Registry>,
    reservation: Reservation,
    armed: bool,
}

impl ReservationGuard {
    pub fn new(registry: Arc<Registry>, reservation: Reservation) -> Self {
        Self {
            registry,
            reservation,
            armed: true,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.reservation.server_id
    }

    pub fn allocation(&self) -> Allocation {
        self.reservation.allocation
    }

    /// Turn the hold into a live workspace record. On failure the guard is
    /// dropped still armed, which releases the hold.
    pub fn commit(
        mut self,
        container_id: &str,
        started_at: u64,
    ) -> OrchestratorResult<WorkspaceHealthRecord> {
        let record = self
            .registry
            .commit(&self.reservation, container_id, started_at)?;
        self.armed = false;
        Ok(record)
    }

    /// Return the hold now, surfacing any accounting failure.
    pub fn release(mut self) -> OrchestratorResult<()> {
        self.armed = false;
        rollback(&self.registry, &self.reservation)
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(
            reservation = self.reservation.id,
            server_id = %self.reservation.server_id,
            "uncommitted reservation dropped, rolling back"
        );
        // rollback() logs its own failure.
        let _ = rollback(&self.registry, &self.reservation);
    }
}

fn rollback(registry: &Registry, reservation: &Reservation) -> OrchestratorResult<()> {
    match registry.release(reservation) {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(
                reservation = reservation.id,
                server_id = %reservation.server_id,
                error = %e,
                "reservation rollback failed, capacity may leak"
            );
            Err(OrchestratorError::ReservationRollback {
                reservation: reservation.id,
                server_id: reservation.server_id.clone(),
                cause: e.to_string(),
            })
        }
    }
}
