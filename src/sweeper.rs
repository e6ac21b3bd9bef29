//! Periodic enqueuer: one recurring timer per refreshable tier, scheduling
//! background refreshes for every pair currently in that tier (spec §4.7).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::fingerprint::Direction;
use crate::metrics::Metrics;
use crate::queue::{new_job, Priority, RefreshQueue};
use crate::tier::{TierConfig, TierLabel, TierRegistry};

/// Conventional amount/direction used for proactive warmth, matching the
/// amount common client requests use to maximize hit rate (spec §4.7 step
/// 2, and the Open Question in §9 which preserves this as specified).
pub const SWEEP_AMOUNT: &str = "1000";
pub const SWEEP_DIRECTION: Direction = Direction::ExactIn;

/// Spawns one task per refreshable tier. Each tick snapshots membership and
/// enqueues a Background job per pair; ticks are independent (a slow tick on
/// one tier never delays another tier's timer, since each tier owns its own
/// `tokio::time::interval` loop).
pub fn spawn_sweepers(
    registry: Arc<TierRegistry>,
    queue: Arc<RefreshQueue>,
    metrics: Arc<Metrics>,
    config: TierConfig,
    shutdown: Arc<Notify>,
) -> Vec<tokio::task::JoinHandle<()>> {
    TierLabel::REFRESHABLE
        .iter()
        .filter_map(|&tier| {
            let period = config.settings(tier).refresh_period?;
            let registry = Arc::clone(&registry);
            let queue = Arc::clone(&queue);
            let metrics = Arc::clone(&metrics);
            let shutdown = Arc::clone(&shutdown);

            Some(tokio::spawn(async move {
                sweep_loop(tier, period, registry, queue, metrics, shutdown).await;
            }))
        })
        .collect()
}

async fn sweep_loop(
    tier: TierLabel,
    period: Duration,
    registry: Arc<TierRegistry>,
    queue: Arc<RefreshQueue>,
    metrics: Arc<Metrics>,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown.notified() => return,
        }

        for pair_key in registry.members_of(tier) {
            let Some((chain, token_in, token_out)) = split_pair_key(&pair_key) else {
                continue;
            };

            let job = new_job(
                chain,
                token_in,
                token_out,
                SWEEP_AMOUNT,
                SWEEP_DIRECTION,
                Priority::Background,
            );

            if !queue.enqueue(job, &metrics).await {
                metrics.sweep_dropped();
            }
        }
    }
}

fn split_pair_key(pair_key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = pair_key.splitn(3, ':');
    Some((parts.next()?, parts.next()?, parts.next()?))
}
