//! The Quote Store: an external fast KV abstraction keyed by fingerprint.
//!
//! Both implementations treat failures as local concerns — a failed read is
//! a cache miss, a failed write is dropped — per spec §4.2 and §7
//! (`StoreUnavailable` never propagates to callers).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::tier::TierLabel;

/// `{quote, insertedAt, tier}` — overwritten, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub quote: serde_json::Value,
    pub inserted_at_ms: u64,
    pub tier: TierLabel,
}

#[async_trait]
pub trait QuoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: &CacheEntry, ttl_seconds: u64);
}

/// In-memory implementation backed by `dashmap`. Used for tests and as the
/// automatic fallback when Redis is unreachable, mirroring the teacher's
/// `RateLimiter` degrade-to-memory pattern.
#[derive(Default)]
pub struct InMemoryQuoteStore {
    entries: DashMap<String, (CacheEntry, std::time::Instant, Duration)>,
}

impl InMemoryQuoteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuoteStore for InMemoryQuoteStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let (entry, inserted, ttl) = self.entries.get(key).map(|e| e.clone())?;
        if inserted.elapsed() > ttl {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl_seconds: u64) {
        self.entries.insert(
            key.to_string(),
            (
                entry.clone(),
                std::time::Instant::now(),
                Duration::from_secs(ttl_seconds.max(1)),
            ),
        );
    }
}

/// Production implementation over Redis, grounded on the teacher's existing
/// `redis::Client` + `MultiplexedConnection` usage in `rate_limit.rs`. Falls
/// back to an in-memory store whenever the connection cannot be established
/// or a call fails — the store TTL is an upper bound the store enforces;
/// the tier TTL carried inside `CacheEntry.inserted_at_ms` is the freshness
/// boundary the engine actually relies on (spec §4.2).
pub struct RedisQuoteStore {
    connection: Arc<RwLock<Option<redis::aio::MultiplexedConnection>>>,
    fallback: InMemoryQuoteStore,
}

impl RedisQuoteStore {
    pub async fn connect(redis_url: &str) -> Self {
        let connection = match redis::Client::open(redis_url) {
            Ok(client) => match client.get_multiplexed_tokio_connection().await {
                Ok(conn) => {
                    tracing::info!("connected to Redis quote store");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to connect to Redis, using in-memory quote store");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid Redis URL, using in-memory quote store");
                None
            }
        };

        Self {
            connection: Arc::new(RwLock::new(connection)),
            fallback: InMemoryQuoteStore::new(),
        }
    }
}

#[async_trait]
impl QuoteStore for RedisQuoteStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let Some(conn) = self.connection.read().await.clone() else {
            return self.fallback.get(key).await;
        };

        let mut conn = conn;
        use redis::AsyncCommands;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, key, "quote store read failed, treating as miss");
                self.fallback.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl_seconds: u64) {
        let Ok(raw) = serde_json::to_string(entry) else {
            return;
        };

        if let Some(conn) = self.connection.read().await.clone() {
            let mut conn = conn;
            use redis::AsyncCommands;
            if let Err(e) = conn
                .set_ex::<_, _, ()>(key, raw, ttl_seconds.max(1))
                .await
            {
                tracing::warn!(error = %e, key, "quote store write failed, dropping");
            }
            return;
        }

        self.fallback.set(key, entry, ttl_seconds).await;
    }
}
