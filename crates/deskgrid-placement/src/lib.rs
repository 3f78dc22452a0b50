//! deskgrid-placement — decide which workspace server hosts a new workspace.
//!
//! Placement is a pure decision over a registry snapshot. It never talks to
//! a server and never mutates state; the orchestrator runs it inside the
//! registry's reservation critical section.
//!
//! # Components
//!
//! - **`scorer`** — label matching, residual capacity, post-placement utilization
//! - **`placer`** — the filter pipeline and strategy selection
//! - **`strategy`** — `spread`, `best_fit`, `round_robin`, `affinity`
//!
//! # Pipeline
//!
//! ```text
//! servers ─▶ healthy ─▶ affinity pin ─▶ labels ─▶ has room ─▶ strategy ─▶ server_id
//!              │             │                        │
//!      NoHealthyServers  AffinityServerUnavailable  InsufficientCapacity
//! ```

pub mod error;
pub mod placer;
pub mod scorer;
pub mod strategy;

pub use error::{PlacementError, PlacementResult};
pub use placer::{Placement, Placer, find_placement};
pub use scorer::{ServerScore, labels_match, score_server};
pub use strategy::PlacementStrategy;
