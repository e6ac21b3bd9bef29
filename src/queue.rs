//! Priority background-refresh queue with bounded concurrent workers.
//!
//! Three strict priority bands (`High > Normal > Background`), FIFO within a
//! band. Workers fetch from upstream through the circuit breaker and write
//! the Quote Store; failures retry with backoff up to a bounded attempt
//! count (spec §4.6).

use dashmap::DashSet;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::circuit_breaker::CircuitBreaker;
use crate::fingerprint::{fingerprint, Direction};
use crate::metrics::Metrics;
use crate::store::{CacheEntry, QuoteStore};
use crate::tier::{TierConfig, TierRegistry};
use crate::upstream::QuoteSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    // Ord is derived in declaration order; declare Background first so that
    // `High > Normal > Background` falls out of the derived ordering once
    // wrapped by `Job`'s reversed `Ord` below.
    Background,
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub chain: String,
    pub token_in: String,
    pub token_out: String,
    pub amount: String,
    pub direction: Direction,
    pub priority: Priority,
    pub attempts_remaining: u32,
    pub submitted_at_seq: u64,
}

impl Job {
    fn fingerprint(&self) -> String {
        fingerprint(
            &self.chain,
            &self.token_in,
            &self.token_out,
            &self.amount,
            self.direction,
        )
    }

    fn pair_key(&self) -> String {
        crate::fingerprint::pair_key(&self.chain, &self.token_in, &self.token_out)
    }
}

/// Order jobs so a `BinaryHeap` (a max-heap) pops highest priority first,
/// and within equal priority pops the earliest-submitted job first (FIFO).
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted_at_seq == other.submitted_at_seq
    }
}
impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at_seq.cmp(&self.submitted_at_seq))
    }
}

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_FACTOR: u32 = 2;

struct Inner {
    heap: BinaryHeap<Job>,
    /// Coalescing set: at most one pending job per (fingerprint, priority).
    pending: DashSet<(String, Priority)>,
}

/// MPMC priority queue. `enqueue` is non-blocking; a bounded capacity is
/// enforced by the caller dropping Background jobs when saturated (the
/// sweeper does this — see `sweeper.rs`). Admin force-refresh (`High`) is
/// never dropped by the queue itself.
pub struct RefreshQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    seq: AtomicU64,
    capacity: usize,
    len: AtomicU64,
}

impl RefreshQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                pending: DashSet::new(),
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            capacity,
            len: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// Enqueues a job. Returns `false` (without enqueuing) if a
    /// structurally-identical job is already pending at this priority
    /// (coalescing, spec §4.6 SHOULD) or if the queue is at capacity and the
    /// job is `Background` priority (best-effort, dropped silently by the
    /// caller's policy — the sweeper counts this).
    pub async fn enqueue(&self, mut job: Job, metrics: &Metrics) -> bool {
        let key = (job.fingerprint(), job.priority);
        let mut inner = self.inner.lock().await;

        if inner.pending.contains(&key) {
            return false;
        }

        if self.len.load(Ordering::Relaxed) as usize >= self.capacity
            && job.priority == Priority::Background
        {
            return false;
        }

        job.submitted_at_seq = self.seq.fetch_add(1, Ordering::Relaxed);
        inner.pending.insert(key);
        inner.heap.push(job);
        self.len.fetch_add(1, Ordering::Relaxed);
        metrics.job_enqueued();
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Waits for and pops the highest-priority job (FIFO within a band).
    async fn dequeue(&self) -> Job {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(job) = inner.heap.pop() {
                    let key = (job.fingerprint(), job.priority);
                    inner.pending.remove(&key);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return job;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Runs one worker loop: dequeue, fetch through the breaker, write the
/// store, retry with backoff on failure. Workers make progress
/// independently — a blocked worker (slow upstream) never blocks the others
/// since each owns its own loop and its own breaker/store calls (spec §4.6
/// "Progress").
pub async fn run_worker<S: QuoteSource, Q: QuoteStore>(
    queue: Arc<RefreshQueue>,
    source: Arc<S>,
    store: Arc<Q>,
    registry: Arc<TierRegistry>,
    tier_config: TierConfig,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
    shutdown: Arc<Notify>,
) {
    loop {
        let job = tokio::select! {
            job = queue.dequeue() => job,
            () = shutdown.notified() => return,
        };

        metrics.job_started();

        let fp = job.fingerprint();
        let pair_key = job.pair_key();
        let chain = job.chain.clone();
        let token_in = job.token_in.clone();
        let token_out = job.token_out.clone();
        let amount = job.amount.clone();
        let direction = job.direction;

        let result = breaker
            .call(|| {
                let source = Arc::clone(&source);
                async move {
                    source
                        .fetch_quote(&chain, &token_in, &token_out, &amount, direction)
                        .await
                }
            })
            .await;

        match result {
            Ok(quote) => {
                let tier = registry.tier_of(&pair_key);
                let entry = CacheEntry {
                    quote,
                    inserted_at_ms: now_ms(),
                    tier,
                };
                let ttl = tier_config.settings(tier).ttl;
                store.set(&fp, &entry, ttl.as_secs()).await;
                metrics.job_completed();
            }
            Err(_) if job.attempts_remaining > 1 => {
                let attempt_index = DEFAULT_MAX_ATTEMPTS.saturating_sub(job.attempts_remaining);
                let delay = BACKOFF_BASE * BACKOFF_FACTOR.pow(attempt_index);
                let mut retry = job.clone();
                retry.attempts_remaining -= 1;

                let queue = Arc::clone(&queue);
                let metrics_clone = Arc::clone(&metrics);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(retry, &metrics_clone).await;
                });
            }
            Err(_) => {
                metrics.job_failed();
            }
        }
    }
}

pub fn new_job(
    chain: impl Into<String>,
    token_in: impl Into<String>,
    token_out: impl Into<String>,
    amount: impl Into<String>,
    direction: Direction,
    priority: Priority,
) -> Job {
    Job {
        chain: chain.into(),
        token_in: token_in.into(),
        token_out: token_out.into(),
        amount: amount.into(),
        direction,
        priority,
        attempts_remaining: DEFAULT_MAX_ATTEMPTS,
        submitted_at_seq: 0,
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
