//! Server scoring for placement decisions.
//!
//! A server is scored by the utilization it would have after hosting the
//! requested workload: `max(cpu_utilization, memory_utilization)`. Spread
//! minimizes that value, best-fit maximizes it.

use std::cmp::Ordering;
use std::collections::HashMap;

use deskgrid_state::{Allocation, LabelValue, ServerId, ServerRecord};

/// Scores closer than this are treated as equal and fall through to the
/// tie-break keys.
pub const SCORE_EPSILON: f64 = 1e-9;

/// Scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerScore {
    pub server_id: ServerId,
    /// Post-placement `max(cpu, memory)` utilization in `0.0..=1.0`.
    pub utilization: f64,
    pub workspace_count: u32,
    pub breakdown: ScoreBreakdown,
}

/// Individual utilization components, for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub cpu: f64,
    pub memory: f64,
}

/// Every required label is present on the server with an equal value.
pub fn labels_match(server: &ServerRecord, required: &HashMap<String, LabelValue>) -> bool {
    required
        .iter()
        .all(|(key, value)| server.labels.get(key).is_some_and(|v| v == value))
}

/// Score `server` for hosting `allocation`, or `None` if it has no room.
pub fn score_server(server: &ServerRecord, allocation: &Allocation) -> Option<ServerScore> {
    if !server.fits(allocation) {
        return None;
    }

    let mut projected = server.clone();
    projected.apply(allocation);
    let cpu = projected.cpu_utilization();
    let memory = projected.memory_utilization();

    Some(ServerScore {
        server_id: server.server_id.clone(),
        utilization: cpu.max(memory),
        workspace_count: server.current_workspace_count,
        breakdown: ScoreBreakdown { cpu, memory },
    })
}

fn cmp_utilization(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= SCORE_EPSILON {
        Ordering::Equal
    } else {
        a.total_cmp(&b)
    }
}

/// Spread order: lowest utilization, then fewest workspaces, then server id
/// ascending. The first element is the preferred server.
pub fn spread_order(a: &ServerScore, b: &ServerScore) -> Ordering {
    cmp_utilization(a.utilization, b.utilization)
        .then(a.workspace_count.cmp(&b.workspace_count))
        .then_with(|| a.server_id.cmp(&b.server_id))
}

/// Best-fit order: the exact reverse of [`spread_order`] on every key.
pub fn best_fit_order(a: &ServerScore, b: &ServerScore) -> Ordering {
    spread_order(b, a)
}
