//! The upstream quote source: an opaque `FetchQuote(pair, amount, direction)
//! -> Quote | error` collaborator with 2-5s latency (spec §6, "consumed").
//!
//! The core never interprets the returned `Quote` payload; it is carried as
//! an opaque `serde_json::Value`. `HttpQuoteSource` is the production
//! implementation, grounded on the teacher's `StellarRpcClient` (`rpc/
//! stellar.rs`) reqwest-client-with-retry shape; `StubQuoteSource` is used in
//! tests to control success/failure/latency deterministically.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::fingerprint::Direction;

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        direction: Direction,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Calls a configured on-chain router HTTP endpoint. Retries are NOT
/// performed here — retry/backoff on failure is the Refresh Queue's job
/// (spec §4.6); this client issues exactly one attempt per call and lets the
/// circuit breaker and queue above it decide what happens next.
pub struct HttpQuoteSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpQuoteSource {
    pub fn new(base_url: String, call_timeout: Duration, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("failed to build upstream HTTP client");

        Self { client, base_url, api_key }
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_quote(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        direction: Direction,
    ) -> anyhow::Result<serde_json::Value> {
        let url = format!(
            "{}/quote?chain={chain}&tokenIn={token_in}&tokenOut={token_out}&amount={amount}&tradeType={direction}",
            self.base_url
        );

        let mut request = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let response = response.error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        Ok(body)
    }
}

/// Deterministic test double: fails the first `fail_calls` invocations, then
/// succeeds, optionally sleeping `latency` before responding.
pub struct StubQuoteSource {
    fail_calls: AtomicUsize,
    latency: Duration,
}

impl StubQuoteSource {
    pub fn always_succeeds() -> Self {
        Self {
            fail_calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn fails_n_times(n: usize) -> Self {
        Self {
            fail_calls: AtomicUsize::new(n),
            latency: Duration::ZERO,
        }
    }

    pub fn always_fails() -> Self {
        Self {
            fail_calls: AtomicUsize::new(usize::MAX),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl QuoteSource for StubQuoteSource {
    async fn fetch_quote(
        &self,
        chain: &str,
        token_in: &str,
        token_out: &str,
        amount: &str,
        _direction: Direction,
    ) -> anyhow::Result<serde_json::Value> {
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }

        let remaining = self.fail_calls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_calls.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("stub upstream failure");
        }

        Ok(serde_json::json!({
            "chain": chain,
            "tokenIn": token_in,
            "tokenOut": token_out,
            "amount": amount,
            "price": "1.2345",
        }))
    }
}
