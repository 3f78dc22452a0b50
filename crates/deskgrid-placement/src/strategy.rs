//! Placement strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How to choose among servers that can all host the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Lowest post-placement utilization.
    #[default]
    Spread,
    /// Highest post-placement utilization (pack tightly).
    BestFit,
    /// Rotate over the candidate list, sorted by server id.
    RoundRobin,
    /// The one server named by the request's affinity.
    Affinity,
}

impl PlacementStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spread => "spread",
            Self::BestFit => "best_fit",
            Self::RoundRobin => "round_robin",
            Self::Affinity => "affinity",
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "spread" => Ok(Self::Spread),
            "best_fit" | "bestfit" => Ok(Self::BestFit),
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "affinity" => Ok(Self::Affinity),
            other => Err(format!(
                "unknown placement strategy {other:?} (expected spread, best_fit, round_robin or affinity)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_common_spellings() {
        assert_eq!("spread".parse::<PlacementStrategy>().unwrap(), PlacementStrategy::Spread);
        assert_eq!("best-fit".parse::<PlacementStrategy>().unwrap(), PlacementStrategy::BestFit);
        assert_eq!("ROUND_ROBIN".parse::<PlacementStrategy>().unwrap(), PlacementStrategy::RoundRobin);
        assert!("random".parse::<PlacementStrategy>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&PlacementStrategy::BestFit).unwrap();
        assert_eq!(json, "\"best_fit\"");
        let back: PlacementStrategy = serde_json::from_str("\"round_robin\"").unwrap();
        assert_eq!(back, PlacementStrategy::RoundRobin);
    }

    #[test]
    fn display_matches_serde() {
        for strategy in [
            PlacementStrategy::Spread,
            PlacementStrategy::BestFit,
            PlacementStrategy::RoundRobin,
            PlacementStrategy::Affinity,
        ] {
            assert_eq!(strategy.to_string().parse::<PlacementStrategy>().unwrap(), strategy);
        }
    }
}
