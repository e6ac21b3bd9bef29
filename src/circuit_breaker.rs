//! Per-upstream health gate. Grounded on the teacher's `rpc/rate_limiter.rs`
//! shape: a narrow `Mutex`-guarded state struct for the read-modify-write
//! transitions, `AtomicU64` counters for cheap lock-free observation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while a HalfOpen trial call is outstanding, so concurrent callers
    /// don't all get to attempt the single allowed trial call at once.
    half_open_trial_in_flight: bool,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
    trips: Arc<AtomicU64>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_trial_in_flight: false,
            })),
            trips: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Runs `call` through the breaker, honoring the per-call timeout.
    /// Timeouts count as failures, per spec §4.8.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        if !self.admit().await {
            return Err(EngineError::CircuitOpen);
        }

        let outcome = tokio::time::timeout(self.config.call_timeout, call()).await;

        match outcome {
            Ok(Ok(value)) => {
                self.on_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure().await;
                Err(EngineError::UpstreamFailure(e.to_string()))
            }
            Err(_) => {
                self.on_failure().await;
                Err(EngineError::Timeout)
            }
        }
    }

    /// Decides whether a call may proceed, transitioning `Open -> HalfOpen`
    /// if the reset window has elapsed.
    async fn admit(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_trial_in_flight {
                    false
                } else {
                    inner.half_open_trial_in_flight = true;
                    true
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.half_open_trial_in_flight = false;
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.half_open_trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                self.trips.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.trips.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::Open => {
                // Already open; a failure here would only happen from a
                // stale admitted call racing a concurrent trip. No-op.
            }
        }
    }

    #[cfg(test)]
    async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}
