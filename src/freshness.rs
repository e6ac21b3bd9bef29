//! Pure freshness decisions over a `CacheEntry`. No I/O, no locks — these
//! are the functions exercised directly by the monotonicity and invariant
//! tests in spec §8.

use std::time::Duration;

use crate::store::CacheEntry;
use crate::tier::TierConfig;

/// `now - entry.inserted_at`, saturating at zero if clocks disagree.
pub fn age(entry: &CacheEntry, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(entry.inserted_at_ms))
}

/// `age <= tier TTL`.
pub fn is_fresh(entry: &CacheEntry, config: &TierConfig, now_ms: u64) -> bool {
    age(entry, now_ms) <= config.settings(entry.tier).ttl
}

/// `age <= maxStaleAge`, orthogonal to tier TTL.
pub fn is_servable_stale(entry: &CacheEntry, config: &TierConfig, now_ms: u64) -> bool {
    age(entry, now_ms) <= config.max_stale_age
}

/// `age > maxStaleAge`.
pub fn is_too_stale(entry: &CacheEntry, config: &TierConfig, now_ms: u64) -> bool {
    !is_servable_stale(entry, config, now_ms)
}
