//! Lock-free counters and a bounded latency ring. Recording must never block
//! the request path (spec §4.9) — every write here is a single atomic op.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const LATENCY_WINDOW: usize = 1000;

/// Fixed-capacity ring of the last `LATENCY_WINDOW` request latencies,
/// replacing the teacher-era ever-growing-list-with-shift pattern (spec §9)
/// with O(1), lock-free recording: a monotonically increasing cursor modulo
/// the window size picks the slot to overwrite.
struct LatencyRing {
    slots: Vec<AtomicU64>,
    cursor: AtomicUsize,
    filled: AtomicUsize,
}

impl LatencyRing {
    fn new() -> Self {
        Self {
            slots: (0..LATENCY_WINDOW).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
        }
    }

    fn record(&self, millis: u64) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % LATENCY_WINDOW;
        self.slots[idx].store(millis, Ordering::Relaxed);
        let filled = self.filled.load(Ordering::Relaxed);
        if filled < LATENCY_WINDOW {
            self.filled.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> Vec<u64> {
        let filled = self.filled.load(Ordering::Relaxed).min(LATENCY_WINDOW);
        self.slots[..filled]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub jobs_active: u64,
    pub jobs_waiting: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub sweeps_dropped: u64,
    pub circuit_trips: u64,
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub sample_count: usize,
}

/// Atomically-updated counters plus a bounded latency window. All reads are
/// lock-free snapshots; `hitRate` is zero-safe when there is no traffic yet.
#[derive(Default)]
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    errors: AtomicU64,
    jobs_active: AtomicU64,
    jobs_waiting: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    sweeps_dropped: AtomicU64,
    latencies: Option<LatencyRingHolder>,
}

/// Keeps `LatencyRing`'s non-`Default` constructor out of the derive above.
struct LatencyRingHolder(LatencyRing);

impl Metrics {
    pub fn new() -> Self {
        Self {
            latencies: Some(LatencyRingHolder(LatencyRing::new())),
            ..Default::default()
        }
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, millis: u64) {
        if let Some(ring) = &self.latencies {
            ring.0.record(millis);
        }
    }

    pub fn job_enqueued(&self) {
        self.jobs_waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_waiting.fetch_sub(1, Ordering::Relaxed);
        self.jobs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_active.fetch_sub(1, Ordering::Relaxed);
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_active.fetch_sub(1, Ordering::Relaxed);
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_dropped(&self) {
        self.sweeps_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, circuit_trips: u64) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let denom = hits + misses;
        let hit_rate = if denom == 0 { 0.0 } else { hits as f64 / denom as f64 };

        let mut samples = self
            .latencies
            .as_ref()
            .map(|r| r.0.snapshot())
            .unwrap_or_default();
        samples.sort_unstable();

        let avg_latency_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };

        let p95_latency_ms = percentile(&samples, 0.95);

        MetricsSnapshot {
            cache_hits: hits,
            cache_misses: misses,
            errors: self.errors.load(Ordering::Relaxed),
            jobs_active: self.jobs_active.load(Ordering::Relaxed),
            jobs_waiting: self.jobs_waiting.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            sweeps_dropped: self.sweeps_dropped.load(Ordering::Relaxed),
            circuit_trips,
            hit_rate,
            avg_latency_ms,
            p95_latency_ms,
            sample_count: samples.len(),
        }
    }
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)] as f64
}
