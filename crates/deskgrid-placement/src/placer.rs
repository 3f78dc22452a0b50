//! Placement engine — picks the server that should host a new workspace.
//!
//! [`find_placement`] is a pure function of its inputs: the same snapshot,
//! requirements, strategy and cursor always produce the same answer.
//! [`Placer`] adds the round-robin cursor that survives between calls.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use deskgrid_state::{ResourceRequirements, ServerId, ServerRecord};

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::{ServerScore, best_fit_order, labels_match, score_server, spread_order};
use crate::strategy::PlacementStrategy;

/// A successful placement decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub server_id: ServerId,
    pub strategy: PlacementStrategy,
    pub requirements: ResourceRequirements,
}

/// Choose a server for `req` among `servers`.
///
/// `cursor` is only read by [`PlacementStrategy::RoundRobin`]; the caller
/// owns advancing it.
pub fn find_placement(
    req: &ResourceRequirements,
    strategy: PlacementStrategy,
    servers: &[ServerRecord],
    cursor: usize,
) -> PlacementResult<Placement> {
    // 1. Healthy only.
    let mut candidates: Vec<&ServerRecord> = servers.iter().filter(|s| s.is_healthy()).collect();
    if candidates.is_empty() {
        return Err(PlacementError::NoHealthyServers);
    }
    let healthy = candidates.len();

    // 2. Affinity is a hard pin.
    match (&req.affinity_server_id, strategy) {
        (Some(target), _) => {
            candidates.retain(|s| &s.server_id == target);
            if candidates.is_empty() {
                return Err(PlacementError::AffinityServerUnavailable(target.clone()));
            }
        }
        (None, PlacementStrategy::Affinity) => return Err(PlacementError::MissingAffinityTarget),
        (None, _) => {}
    }

    // 3. Labels.
    candidates.retain(|s| labels_match(s, &req.required_labels));
    let label_matched = candidates.len();

    // 4. Residual capacity.
    let allocation = req.allocation();
    let mut scored: Vec<ServerScore> = candidates
        .iter()
        .filter_map(|s| score_server(s, &allocation))
        .collect();
    if scored.is_empty() {
        return Err(PlacementError::InsufficientCapacity {
            healthy,
            label_matched,
        });
    }

    // 5. Strategy.
    let chosen = match strategy {
        PlacementStrategy::Spread => scored.into_iter().min_by(spread_order),
        PlacementStrategy::BestFit => scored.into_iter().min_by(best_fit_order),
        PlacementStrategy::RoundRobin => {
            scored.sort_by(|a, b| a.server_id.cmp(&b.server_id));
            let index = cursor % scored.len();
            Some(scored.swap_remove(index))
        }
        // Step 2 already narrowed the set to the pinned server.
        PlacementStrategy::Affinity => scored.into_iter().next(),
    };
    let Some(chosen) = chosen else {
        return Err(PlacementError::InsufficientCapacity {
            healthy,
            label_matched,
        });
    };

    debug!(
        server_id = %chosen.server_id,
        %strategy,
        utilization = chosen.utilization,
        cpu = chosen.breakdown.cpu,
        memory = chosen.breakdown.memory,
        "placement chosen"
    );

    Ok(Placement {
        server_id: chosen.server_id,
        strategy,
        requirements: req.clone(),
    })
}

/// Placement with a persistent round-robin cursor.
///
/// The cursor only moves on [`Placer::place`] success; previews leave it
/// untouched.
pub struct Placer {
    cursor: AtomicUsize,
}

impl Placer {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Decide without side effects.
    pub fn preview(
        &self,
        req: &ResourceRequirements,
        strategy: PlacementStrategy,
        servers: &[ServerRecord],
    ) -> PlacementResult<Placement> {
        find_placement(req, strategy, servers, self.cursor())
    }

    /// Decide and, for round-robin, advance the cursor.
    ///
    /// Callers run this inside the registry's reservation critical section,
    /// so concurrent placements observe distinct cursor values.
    pub fn place(
        &self,
        req: &ResourceRequirements,
        strategy: PlacementStrategy,
        servers: &[ServerRecord],
    ) -> PlacementResult<Placement> {
        let placement = find_placement(req, strategy, servers, self.cursor())?;
        if strategy == PlacementStrategy::RoundRobin {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
        Ok(placement)
    }

    /// Current cursor value (for diagnostics).
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl Default for Placer {
    fn default() -> Self {
        Self::new()
    }
}
