//! deskgrid-health — server and workspace health monitoring.
//!
//! Two independent polling loops keep the [`Registry`](deskgrid_state::Registry)
//! honest about the fleet:
//!
//! ```text
//! HealthMonitor
//!   ├── server loop (every server_interval)
//!   │     check_daemon_info ─▶ ServerHealthTracker ─▶ healthy | unhealthy | offline
//!   ├── workspace loop (every workspace_interval)
//!   │     get_stats ─▶ gone? remove record : exec probe ─▶ WorkspaceProbeTracker
//!   │     reconcile_usage() at the end of every tick
//!   └── broadcast::Sender<HealthEvent>
//! ```
//!
//! A server needs `offline_threshold` consecutive failed checks to go
//! offline, and a single success to come back. Workspaces on an offline
//! server are not contacted; they are flagged unhealthy and kept.

pub mod checker;
pub mod config;
pub mod monitor;

pub use checker::{ProbeResult, ServerHealthTracker, WorkspaceProbeTracker};
pub use config::MonitorConfig;
pub use monitor::{HealthEvent, HealthMonitor, MonitorHandle, ServerTickSummary, WorkspaceTickSummary};
