//! Tier labels, per-tier configuration, and the Tier Registry mapping
//! pair-keys to tiers.

use dashmap::{DashMap, DashSet};
use std::fmt;
use std::time::Duration;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum TierLabel {
    T1,
    T2,
    T3,
    T4,
}

impl TierLabel {
    pub const ALL: [Self; 4] = [Self::T1, Self::T2, Self::T3, Self::T4];

    /// Tiers with a scheduled refresh cadence (T4 is on-demand only).
    pub const REFRESHABLE: [Self; 3] = [Self::T1, Self::T2, Self::T3];

    pub fn default_tier() -> Self {
        Self::T4
    }
}

impl fmt::Display for TierLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::T1 => "T1",
            Self::T2 => "T2",
            Self::T3 => "T3",
            Self::T4 => "T4",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TierLabel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "T1" => Ok(Self::T1),
            "T2" => Ok(Self::T2),
            "T3" => Ok(Self::T3),
            "T4" => Ok(Self::T4),
            other => Err(EngineError::BadRequest(format!("unknown tier '{other}'"))),
        }
    }
}

/// TTL and refresh cadence for one tier.
#[derive(Debug, Clone, Copy)]
pub struct TierSettings {
    pub ttl: Duration,
    pub refresh_period: Option<Duration>,
}

/// Per-tier TTL/refresh configuration plus the global stale ceiling.
///
/// Invariant (spec §8.3): for every tier, `ttl <= max_stale_age`.
#[derive(Debug, Clone)]
pub struct TierConfig {
    settings: [TierSettings; 4],
    pub max_stale_age: Duration,
}

impl TierConfig {
    pub fn settings(&self, tier: TierLabel) -> TierSettings {
        self.settings[tier as usize]
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            settings: [
                TierSettings {
                    ttl: Duration::from_secs(10),
                    refresh_period: Some(Duration::from_secs(5)),
                },
                TierSettings {
                    ttl: Duration::from_secs(60),
                    refresh_period: Some(Duration::from_secs(30)),
                },
                TierSettings {
                    ttl: Duration::from_secs(300),
                    refresh_period: Some(Duration::from_secs(180)),
                },
                TierSettings {
                    ttl: Duration::from_secs(600),
                    refresh_period: None,
                },
            ],
            max_stale_age: Duration::from_secs(3600),
        }
    }
}

/// Maps pair-keys to tiers. Reads are lock-free via `dashmap`; `assign`
/// maintains a forward map (pair -> tier) and a reverse index (tier ->
/// members) so `members_of` never observes a pair mid-transition between
/// tiers — the reverse index is updated in the same call that updates the
/// forward map, and a pair can only ever hold one entry in the forward map.
pub struct TierRegistry {
    forward: DashMap<String, TierLabel>,
    reverse: DashMap<TierLabel, DashSet<String>>,
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TierRegistry {
    pub fn new() -> Self {
        let reverse = DashMap::new();
        for tier in TierLabel::ALL {
            reverse.insert(tier, DashSet::new());
        }
        Self {
            forward: DashMap::new(),
            reverse,
        }
    }

    /// Assigns `pair_key` to `tier`. Any prior membership in another tier is
    /// removed — a pair is in at most one tier (spec invariant 5).
    pub fn assign(&self, pair_key: &str, tier: TierLabel) {
        if let Some(prev) = self.forward.insert(pair_key.to_string(), tier) {
            if prev != tier {
                if let Some(set) = self.reverse.get(&prev) {
                    set.remove(pair_key);
                }
            }
        }
        if let Some(set) = self.reverse.get(&tier) {
            set.insert(pair_key.to_string());
        }
    }

    /// Returns the assigned tier, or `T4` if the pair was never assigned.
    pub fn tier_of(&self, pair_key: &str) -> TierLabel {
        self.forward
            .get(pair_key)
            .map_or(TierLabel::default_tier(), |t| *t)
    }

    /// Snapshot of the pairs currently assigned to `tier`.
    pub fn members_of(&self, tier: TierLabel) -> Vec<String> {
        self.reverse
            .get(&tier)
            .map(|set| set.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ttl_never_exceeds_max_stale_age() {
        let config = TierConfig::default();
        for tier in TierLabel::ALL {
            assert!(config.settings(tier).ttl <= config.max_stale_age);
        }
    }

    #[test]
    fn unassigned_pair_defaults_to_t4() {
        let registry = TierRegistry::new();
        assert_eq!(registry.tier_of("ethereum:usdc:weth"), TierLabel::T4);
    }

    #[test]
    fn assign_is_at_most_one_tier() {
        let registry = TierRegistry::new();
        let pair = "ethereum:usdc:weth";

        registry.assign(pair, TierLabel::T1);
        registry.assign(pair, TierLabel::T2);
        registry.assign(pair, TierLabel::T3);

        assert_eq!(registry.tier_of(pair), TierLabel::T3);
        let mut seen = 0;
        for tier in TierLabel::ALL {
            if registry.members_of(tier).contains(&pair.to_string()) {
                seen += 1;
            }
        }
        assert_eq!(seen, 1);
    }

    #[test]
    fn members_of_reflects_assignment() {
        let registry = TierRegistry::new();
        registry.assign("ethereum:usdc:weth", TierLabel::T1);
        registry.assign("ethereum:dai:weth", TierLabel::T1);

        let mut members = registry.members_of(TierLabel::T1);
        members.sort();
        assert_eq!(members, vec!["ethereum:dai:weth", "ethereum:usdc:weth"]);
    }

    #[test]
    fn reassigning_to_same_tier_keeps_single_membership() {
        let registry = TierRegistry::new();
        let pair = "ethereum:usdc:weth";
        registry.assign(pair, TierLabel::T1);
        registry.assign(pair, TierLabel::T1);
        assert_eq!(registry.members_of(TierLabel::T1).len(), 1);
    }

    #[test]
    fn tier_label_parses_and_rejects_unknown() {
        use std::str::FromStr;
        assert_eq!(TierLabel::from_str("t1").unwrap(), TierLabel::T1);
        assert!(TierLabel::from_str("T9").is_err());
    }
}
