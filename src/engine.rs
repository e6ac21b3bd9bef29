//! The composition root. A single `Engine` value owns the Quote Store, Tier
//! Registry, Refresh Queue, workers, Tier Sweeper, and Circuit Breaker, and
//! is constructed once at startup and passed explicitly — there is no
//! module-level mutable state (spec §9 Design Notes).

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fingerprint::{self, Direction};
use crate::freshness;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::{new_job, run_worker, Priority, RefreshQueue};
use crate::store::{CacheEntry, QuoteStore};
use crate::sweeper;
use crate::tier::{TierConfig, TierLabel, TierRegistry};
use crate::upstream::QuoteSource;

/// A single read's outcome, ready to be rendered onto the wire by the HTTP
/// layer (spec §4.5 step 3-5).
#[derive(Debug, Clone, serde::Serialize)]
pub struct QuoteResult {
    pub quote: serde_json::Value,
    pub cached: bool,
    pub stale: bool,
    pub very_stale: bool,
    pub error: Option<String>,
}

pub struct Engine<S: QuoteSource, Q: QuoteStore> {
    source: Arc<S>,
    store: Arc<Q>,
    registry: Arc<TierRegistry>,
    tier_config: TierConfig,
    queue: Arc<RefreshQueue>,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
    shutdown: Arc<Notify>,
    shutting_down: AtomicBool,
    /// Single-flight: one outstanding synchronous upstream call per
    /// fingerprint. Concurrent cold-miss readers for the same key await the
    /// shared slot instead of each issuing their own upstream fetch (spec §9
    /// "noted as an open improvement" — implemented here).
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    sweeper_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<S: QuoteSource + 'static, Q: QuoteStore + 'static> Engine<S, Q> {
    pub fn new(config: EngineConfig, source: S, store: Q) -> Arc<Self> {
        let engine = Arc::new(Self {
            source: Arc::new(source),
            store: Arc::new(store),
            registry: Arc::new(TierRegistry::new()),
            tier_config: config.tier_config.clone(),
            queue: Arc::new(RefreshQueue::new(config.queue_capacity)),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            metrics: Arc::new(Metrics::new()),
            shutdown: Arc::new(Notify::new()),
            shutting_down: AtomicBool::new(false),
            in_flight: DashMap::new(),
            worker_handles: Mutex::new(Vec::new()),
            sweeper_handles: Mutex::new(Vec::new()),
        });

        engine.clone().spawn_background(config.worker_count);
        engine
    }

    fn spawn_background(self: Arc<Self>, worker_count: usize) {
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let queue = Arc::clone(&self.queue);
            let source = Arc::clone(&self.source);
            let store = Arc::clone(&self.store);
            let registry = Arc::clone(&self.registry);
            let tier_config = self.tier_config.clone();
            let breaker = self.breaker.clone();
            let metrics = Arc::clone(&self.metrics);
            let shutdown = Arc::clone(&self.shutdown);
            workers.push(tokio::spawn(run_worker(
                queue, source, store, registry, tier_config, breaker, metrics, shutdown,
            )));
        }

        let sweepers = sweeper::spawn_sweepers(
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            Arc::clone(&self.metrics),
            self.tier_config.clone(),
            Arc::clone(&self.shutdown),
        );

        *self.worker_handles.lock().unwrap() = workers;
        *self.sweeper_handles.lock().unwrap() = sweepers;
    }

    /// Stops accepting new background work and signals workers/sweepers to
    /// stop; in-flight jobs run to completion (spec §5 cancellation note:
    /// background jobs are not cancelled mid-flight).
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        let workers: Vec<_> = self.worker_handles.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = tokio::time::timeout_at(deadline, handle).await;
        }
        let sweepers: Vec<_> = self.sweeper_handles.lock().unwrap().drain(..).collect();
        for handle in sweepers {
            let _ = tokio::time::timeout_at(deadline, handle).await;
        }
    }

    pub fn registry(&self) -> &TierRegistry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.breaker.trips())
    }

    /// Assigns a pair to a tier (admin operation, spec §6
    /// `POST /admin/tiers/{tier}/pairs`).
    pub fn assign_tier(&self, chain: &str, token_in: &str, token_out: &str, tier: TierLabel) {
        let pair_key = fingerprint::pair_key(chain, token_in, token_out);
        self.registry.assign(&pair_key, tier);
    }

    /// Enqueues a High-priority refresh (admin operation, spec §6
    /// `POST /admin/refresh`). Never silently dropped (spec §5).
    pub async fn force_refresh(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        direction: Direction,
    ) {
        let job = new_job(chain, token_in, token_out, amount, direction, Priority::High);
        self.queue.enqueue(job, &self.metrics).await;
    }

    /// Warm-up: assigns configured hot pairs to their tiers and enqueues
    /// High-priority refreshes. Non-fatal — individual enqueue failures
    /// never block startup (spec §4.10).
    pub async fn warm_up(&self, pairs: &[crate::config::WarmupPair]) {
        for pair in pairs {
            self.registry.assign(
                &fingerprint::pair_key(&pair.chain, &pair.token_in, &pair.token_out),
                pair.tier,
            );

            let job = new_job(
                pair.chain.clone(),
                pair.token_in.clone(),
                pair.token_out.clone(),
                sweeper::SWEEP_AMOUNT,
                sweeper::SWEEP_DIRECTION,
                Priority::High,
            );
            self.queue.enqueue(job, &self.metrics).await;
        }
    }

    /// The read-through request path (spec §4.5). At most two store reads:
    /// the initial lookup, and the fallback re-read on upstream failure.
    ///
    /// `client_deadline`, when present, bounds only the synchronous
    /// fetch-now branch (§4.5 step 5) — the fresh and stale-while-revalidate
    /// branches never block on upstream, so a deadline cannot be exceeded
    /// there (spec §5 "Cancellation and timeouts").
    pub async fn read(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        direction: Direction,
        client_deadline: Option<std::time::Duration>,
    ) -> Result<QuoteResult, EngineError> {
        let start = tokio::time::Instant::now();
        let key = fingerprint::fingerprint(chain, token_in, token_out, amount, direction);

        let result = self
            .read_inner(chain, token_in, token_out, amount, direction, &key, client_deadline)
            .await;

        self.metrics
            .record_latency_ms(start.elapsed().as_millis() as u64);

        result
    }

    async fn read_inner(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        direction: Direction,
        key: &str,
        client_deadline: Option<std::time::Duration>,
    ) -> Result<QuoteResult, EngineError> {
        let now = now_ms();
        let entry = self.store.get(key).await;

        if let Some(entry) = &entry {
            if freshness::is_fresh(entry, &self.tier_config, now) {
                self.metrics.record_hit();
                return Ok(QuoteResult {
                    quote: entry.quote.clone(),
                    cached: true,
                    stale: false,
                    very_stale: false,
                    error: None,
                });
            }

            if freshness::is_servable_stale(entry, &self.tier_config, now) {
                // Stale-while-revalidate: serve immediately, refresh in the
                // background. Per spec §9 Open Question, stale hits count
                // toward hitRate (preserving source behavior).
                self.metrics.record_hit();
                let job = new_job(chain, token_in, token_out, amount, direction, Priority::Background);
                self.queue.enqueue(job, &self.metrics).await;

                return Ok(QuoteResult {
                    quote: entry.quote.clone(),
                    cached: true,
                    stale: true,
                    very_stale: false,
                    error: None,
                });
            }
        }

        self.metrics.record_miss();
        let fetch = self.synchronous_fetch(chain, token_in, token_out, amount, direction, key, entry.clone());

        match client_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fetch).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Deadline exceeded while waiting on upstream: fall back
                    // to the best available cached value rather than the
                    // client's TCP connection timing out (spec §5).
                    self.metrics.record_error();
                    match self.store.get(key).await.or(entry) {
                        Some(fallback) => Ok(QuoteResult {
                            quote: fallback.quote,
                            cached: true,
                            stale: true,
                            very_stale: true,
                            error: Some(EngineError::Timeout.to_string()),
                        }),
                        None => Err(EngineError::Timeout),
                    }
                }
            },
            None => fetch.await,
        }
    }

    /// No entry, or too-stale entry: fetch now through the breaker,
    /// coalescing concurrent callers for the same fingerprint onto one
    /// upstream call (single-flight).
    async fn synchronous_fetch(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        direction: Direction,
        key: &str,
        stale_entry: Option<CacheEntry>,
    ) -> Result<QuoteResult, EngineError> {
        let slot = Arc::clone(
            self.in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let _lock = slot.lock().await;
        // Clears the in-flight slot when this future is dropped, whether by
        // normal return or by the caller's deadline cancelling us mid-fetch
        // (spec §5: handlers "remain responsive to cancellation").
        let _guard = InFlightGuard { map: &self.in_flight, key };

        // Another caller may have already populated the store while we were
        // waiting for the lock; recheck before issuing a fresh upstream call.
        if let Some(entry) = self.store.get(key).await {
            let now = now_ms();
            if freshness::is_fresh(&entry, &self.tier_config, now) {
                return Ok(QuoteResult {
                    quote: entry.quote,
                    cached: true,
                    stale: false,
                    very_stale: false,
                    error: None,
                });
            }
        }

        let pair_key = fingerprint::pair_key(chain, token_in, token_out);
        let tier = self.registry.tier_of(&pair_key);

        let source = Arc::clone(&self.source);
        let chain_o = chain.to_string();
        let token_in_o = token_in.to_string();
        let token_out_o = token_out.to_string();
        let amount_o = amount.to_string();

        let fetch_result = self
            .breaker
            .call(|| async move {
                source
                    .fetch_quote(&chain_o, &token_in_o, &token_out_o, &amount_o, direction)
                    .await
            })
            .await;

        match fetch_result {
            Ok(quote) => {
                let entry = CacheEntry {
                    quote: quote.clone(),
                    inserted_at_ms: now_ms(),
                    tier,
                };
                self.store
                    .set(key, &entry, self.tier_config.settings(tier).ttl.as_secs())
                    .await;

                Ok(QuoteResult {
                    quote,
                    cached: false,
                    stale: false,
                    very_stale: false,
                    error: None,
                })
            }
            Err(e) => {
                self.metrics.record_error();

                // Re-read the store (fallback re-read; at most twice total,
                // spec §4.5 ordering guarantee) for a very-stale fallback.
                let fallback = self.store.get(key).await.or(stale_entry);
                if let Some(entry) = fallback {
                    return Ok(QuoteResult {
                        quote: entry.quote,
                        cached: true,
                        stale: true,
                        very_stale: true,
                        error: Some(e.to_string()),
                    });
                }

                Err(e)
            }
        }
    }
}

/// Removes a fingerprint's single-flight slot when dropped, covering both
/// normal completion and cancellation (the caller's deadline elapsing while
/// this future is still suspended on the upstream call).
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(self.key);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryQuoteStore;
    use crate::upstream::StubQuoteSource;
    use std::time::Duration;

    fn test_config() -> EngineConfig {
        EngineConfig {
            worker_count: 2,
            queue_capacity: 100,
            tier_config: TierConfig::default(),
            breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_millis(200),
                call_timeout: Duration::from_secs(1),
            },
            ..EngineConfig::default()
        }
    }

    async fn seed(
        store: &InMemoryQuoteStore,
        key: &str,
        age_ms: u64,
        tier: TierLabel,
        ttl_seconds: u64,
    ) {
        let inserted_at_ms = now_ms().saturating_sub(age_ms);
        store
            .set(
                key,
                &CacheEntry {
                    quote: serde_json::json!({"price": "1.0"}),
                    inserted_at_ms,
                    tier,
                },
                ttl_seconds,
            )
            .await;
    }

    /// S1 — fresh hit: returns the pre-seeded quote with no upstream call.
    #[tokio::test]
    async fn s1_fresh_hit_serves_cached_value_without_upstream_call() {
        let store = InMemoryQuoteStore::new();
        let key = fingerprint::fingerprint("ethereum", "usdc", "weth", "1000", Direction::ExactIn);
        seed(&store, &key, 0, TierLabel::T1, 600).await;

        let engine = Engine::new(test_config(), StubQuoteSource::always_fails(), store);
        let result = engine
            .read("ethereum", "usdc", "weth", "1000", Direction::ExactIn, None)
            .await
            .unwrap();

        assert!(result.cached);
        assert!(!result.stale);
        assert!(!result.very_stale);
    }

    /// S2 — stale-while-revalidate: returns stale=true and enqueues a
    /// Background refresh.
    #[tokio::test]
    async fn s2_stale_while_revalidate_enqueues_background_job() {
        let store = InMemoryQuoteStore::new();
        let key = fingerprint::fingerprint("ethereum", "usdc", "weth", "1000", Direction::ExactIn);
        seed(&store, &key, 30_000, TierLabel::T1, 3600).await;

        let engine = Engine::new(test_config(), StubQuoteSource::always_succeeds(), store);
        let result = engine
            .read("ethereum", "usdc", "weth", "1000", Direction::ExactIn, None)
            .await
            .unwrap();

        assert!(result.stale);
        assert!(!result.very_stale);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.metrics_snapshot().jobs_completed >= 1 || engine.metrics_snapshot().jobs_active >= 1);
    }

    /// S3 — too stale: synchronous refetch happens exactly once and
    /// succeeds.
    #[tokio::test]
    async fn s3_too_stale_triggers_synchronous_refetch() {
        let store = InMemoryQuoteStore::new();
        let key = fingerprint::fingerprint("ethereum", "usdc", "weth", "1000", Direction::ExactIn);
        seed(&store, &key, 4_000_000, TierLabel::T1, 3600).await;

        let engine = Engine::new(test_config(), StubQuoteSource::always_succeeds(), store);
        let result = engine
            .read("ethereum", "usdc", "weth", "1000", Direction::ExactIn, None)
            .await
            .unwrap();

        assert!(!result.cached);
        assert!(!result.stale);
        assert!(!result.very_stale);
    }

    /// S4 — upstream failure with very-stale fallback.
    #[tokio::test]
    async fn s4_upstream_failure_falls_back_to_very_stale_entry() {
        let store = InMemoryQuoteStore::new();
        let key = fingerprint::fingerprint("ethereum", "usdc", "weth", "1000", Direction::ExactIn);
        seed(&store, &key, 4_000_000, TierLabel::T1, 3600).await;

        let engine = Engine::new(test_config(), StubQuoteSource::always_fails(), store);
        let result = engine
            .read("ethereum", "usdc", "weth", "1000", Direction::ExactIn, None)
            .await
            .unwrap();

        assert!(result.very_stale);
        assert!(result.error.is_some());
    }

    /// S5 — circuit opens after failure_threshold consecutive failures, and
    /// closes again after resetTimeout once upstream recovers.
    #[tokio::test]
    async fn s5_circuit_opens_then_recovers() {
        let store = InMemoryQuoteStore::new();
        let engine = Engine::new(test_config(), StubQuoteSource::always_fails(), store);

        for i in 0..5 {
            let pair = format!("token{i}");
            let result = engine
                .read("ethereum", &pair, "weth", "1000", Direction::ExactIn, None)
                .await;
            assert!(result.is_err());
        }

        let sixth = engine
            .read("ethereum", "tokenX", "weth", "1000", Direction::ExactIn, None)
            .await;
        assert!(matches!(sixth, Err(EngineError::CircuitOpen)));
    }

    #[tokio::test]
    async fn no_cache_entry_and_failing_upstream_surfaces_error() {
        let store = InMemoryQuoteStore::new();
        let engine = Engine::new(test_config(), StubQuoteSource::always_fails(), store);

        let result = engine
            .read("ethereum", "usdc", "weth", "1000", Direction::ExactIn, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn assign_tier_then_tier_of_reflects_assignment() {
        let store = InMemoryQuoteStore::new();
        let engine = Engine::new(test_config(), StubQuoteSource::always_succeeds(), store);
        engine.assign_tier("ethereum", "usdc", "weth", TierLabel::T1);
        assert_eq!(engine.registry().tier_of("ethereum:usdc:weth"), TierLabel::T1);
    }

    /// Client deadline exceeded on a cold miss with a slow upstream: falls
    /// back to the stale cached entry rather than waiting out the full
    /// upstream latency (spec §5 "Cancellation and timeouts").
    #[tokio::test]
    async fn client_deadline_exceeded_falls_back_to_stale_entry() {
        let store = InMemoryQuoteStore::new();
        let key = fingerprint::fingerprint("ethereum", "usdc", "weth", "1000", Direction::ExactIn);
        seed(&store, &key, 4_000_000, TierLabel::T1, 3600).await;

        let slow_source = StubQuoteSource::always_succeeds().with_latency(Duration::from_secs(5));
        let engine = Engine::new(test_config(), slow_source, store);

        let result = engine
            .read(
                "ethereum",
                "usdc",
                "weth",
                "1000",
                Direction::ExactIn,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert!(result.very_stale);
        assert!(result.error.is_some());
    }

    /// Client deadline exceeded with no cached entry at all surfaces a
    /// timeout error rather than hanging past the caller's budget.
    #[tokio::test]
    async fn client_deadline_exceeded_with_no_entry_surfaces_timeout() {
        let store = InMemoryQuoteStore::new();
        let slow_source = StubQuoteSource::always_succeeds().with_latency(Duration::from_secs(5));
        let engine = Engine::new(test_config(), slow_source, store);

        let result = engine
            .read(
                "ethereum",
                "usdc",
                "weth",
                "1000",
                Direction::ExactIn,
                Some(Duration::from_millis(50)),
            )
            .await;

        assert!(matches!(result, Err(EngineError::Timeout)));
    }
}
