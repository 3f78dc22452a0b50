//! deskgrid-state — server registry and embedded state store for deskgrid.
//!
//! Holds the in-memory [`Registry`] of configured workspace servers and
//! running workspaces, backed by a [redb](https://docs.rs/redb)
//! [`StateStore`] that survives process restart.
//!
//! # Architecture
//!
//! ```text
//! Registry (single owner of mutable fleet state)
//!   ├── servers: ServerRecord per configured server
//!   ├── workspaces: WorkspaceHealthRecord per running container
//!   ├── pending: capacity holds between placement and creation
//!   └── write-through → StateStore (redb, JSON values)
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! The `Registry` is shared behind an `Arc` by the orchestrator and the
//! health monitor.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult, StateError, StateResult};
pub use registry::{Registry, ServerCheck, UsageCorrection};
pub use store::StateStore;
pub use types::*;
