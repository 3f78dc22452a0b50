//! deskgrid-orchestrator — place, create and destroy workspaces.
//!
//! Ties the registry, the placement engine and the runtime client pool into
//! one cancellable sequence per workspace.
//!
//! # Lifecycle
//!
//! ```text
//! place_workspace
//!   ├── Registry::reserve_with ─▶ Placer::place   (one critical section)
//!   ├── ReservationGuard          (released on error or drop)
//!   ├── create_container ─▶ start_container
//!   └── ReservationGuard::commit ─▶ WorkspaceHealthRecord
//!
//! destroy_workspace
//!   └── stop_container ─▶ remove_container ─▶ Registry::remove_workspace
//! ```
//!
//! Two concurrent placements can never both claim the last slot on a
//! server: selection and the capacity hold happen under the same registry
//! write lock.

pub mod error;
pub mod orchestrator;
pub mod reservation;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{Orchestrator, PlacedWorkspace};
pub use reservation::ReservationGuard;
