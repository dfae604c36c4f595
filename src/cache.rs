//! Multi-layer read-through cache
//!
//! Two layers: a bounded in-process L1 (moka) and an external Redis L2 with
//! JSON-serialized values and a longer TTL. Lookup order is L1 → L2 → origin;
//! an L2 hit backfills L1, and computed values are written through both
//! layers. The L2 leg sits behind the `vector_cache_kv` circuit breaker:
//! while it is open the cache silently degrades to L1-only, and L2 failures
//! never surface to callers.
//!
//! Negative results (a lookup that produced nothing) are cached with a
//! shorter TTL to avoid thundering herds on repeated misses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::breaker::CircuitBreaker;

/// Key prefix for every L2 entry, so layer-wide clears stay scoped.
const L2_PREFIX: &str = "mnemolite:cache:";

/// Sentinel stored for cached negative lookups (never valid JSON).
const NEGATIVE_SENTINEL: &str = "\u{1}negative";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(String),
}

/// Which cache layer an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    L1,
    L2,
    All,
}

impl std::str::FromStr for CacheLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(CacheLayer::L1),
            "l2" => Ok(CacheLayer::L2),
            "all" => Ok(CacheLayer::All),
            other => Err(format!("unknown cache layer: '{}' (expected l1, l2, all)", other)),
        }
    }
}

/// A cache lookup result: a serialized value or a remembered miss.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Json(String),
    Negative,
}

#[derive(Clone)]
struct L1Entry {
    value: CachedValue,
    expires_at: Instant,
}

struct L2Cache {
    conn: redis::aio::ConnectionManager,
    breaker: Arc<CircuitBreaker>,
}

/// L1 + L2 read-through cache with negative caching.
pub struct MultiLayerCache {
    l1: moka::future::Cache<String, L1Entry>,
    l2: Option<L2Cache>,
    l1_ttl: Duration,
    l2_ttl: Duration,
    negative_ttl: Duration,
}

impl MultiLayerCache {
    /// In-process-only cache (no L2). Used by worker subprocesses and tests.
    pub fn l1_only(capacity: u64, l1_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            l1: moka::future::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(l1_ttl.max(negative_ttl))
                .build(),
            l2: None,
            l1_ttl,
            l2_ttl: Duration::ZERO,
            negative_ttl,
        }
    }

    /// Full two-layer cache backed by Redis.
    pub async fn with_redis(
        capacity: u64,
        l1_ttl: Duration,
        l2_ttl: Duration,
        negative_ttl: Duration,
        redis_url: &str,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(|e| CacheError::Redis(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::Redis(e.to_string()))?;

        let mut cache = Self::l1_only(capacity, l1_ttl, negative_ttl);
        cache.l2 = Some(L2Cache { conn, breaker });
        cache.l2_ttl = l2_ttl;
        Ok(cache)
    }

    /// Look up a key: L1, then L2 (backfilling L1 on hit).
    pub async fn get_json(&self, key: &str) -> Option<CachedValue> {
        if let Some(entry) = self.l1.get(key).await {
            if entry.expires_at > Instant::now() {
                return Some(entry.value);
            }
            self.l1.invalidate(key).await;
        }

        let raw = self.l2_get(key).await?;
        let value = if raw == NEGATIVE_SENTINEL {
            CachedValue::Negative
        } else {
            CachedValue::Json(raw)
        };

        // Backfill L1 so repeated lookups stay in-process
        let ttl = match value {
            CachedValue::Negative => self.negative_ttl,
            CachedValue::Json(_) => self.l1_ttl,
        };
        self.l1
            .insert(
                key.to_string(),
                L1Entry {
                    value: value.clone(),
                    expires_at: Instant::now() + ttl,
                },
            )
            .await;

        Some(value)
    }

    /// Write a serialized value through both layers.
    pub async fn put_json(&self, key: &str, json: String) {
        self.l1
            .insert(
                key.to_string(),
                L1Entry {
                    value: CachedValue::Json(json.clone()),
                    expires_at: Instant::now() + self.l1_ttl,
                },
            )
            .await;
        self.l2_set(key, json, self.l2_ttl).await;
    }

    /// Remember a miss with the shorter negative TTL.
    pub async fn put_negative(&self, key: &str) {
        self.l1
            .insert(
                key.to_string(),
                L1Entry {
                    value: CachedValue::Negative,
                    expires_at: Instant::now() + self.negative_ttl,
                },
            )
            .await;
        self.l2_set(key, NEGATIVE_SENTINEL.to_string(), self.negative_ttl)
            .await;
    }

    /// Typed lookup; `None` covers both a miss and a cached negative.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get_json(key).await? {
            CachedValue::Json(json) => serde_json::from_str(&json)
                .map_err(|e| {
                    tracing::warn!(key, error = %e, "Dropping undecodable cache entry");
                })
                .ok(),
            CachedValue::Negative => None,
        }
    }

    /// Typed write-through.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.put_json(key, json).await,
            Err(e) => tracing::warn!(key, error = %e, "Failed to serialize cache value"),
        }
    }

    /// Clear one or both layers. Idempotent; a clear of an already-empty
    /// layer is a no-op.
    pub async fn clear(&self, layer: CacheLayer) {
        if matches!(layer, CacheLayer::L1 | CacheLayer::All) {
            self.l1.invalidate_all();
            self.l1.run_pending_tasks().await;
        }
        if matches!(layer, CacheLayer::L2 | CacheLayer::All) {
            self.l2_clear().await;
        }
    }

    /// Number of live L1 entries (monitoring).
    pub async fn l1_len(&self) -> u64 {
        self.l1.run_pending_tasks().await;
        self.l1.entry_count()
    }

    async fn l2_get(&self, key: &str) -> Option<String> {
        let l2 = self.l2.as_ref()?;
        l2.breaker.check().ok()?;

        let mut conn = l2.conn.clone();
        let result: Result<Option<String>, _> = conn.get(format!("{L2_PREFIX}{key}")).await;
        match result {
            Ok(value) => {
                l2.breaker.record_success();
                value
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "L2 cache read failed, degrading to L1");
                l2.breaker.record_failure();
                None
            }
        }
    }

    async fn l2_set(&self, key: &str, value: String, ttl: Duration) {
        let Some(l2) = self.l2.as_ref() else {
            return;
        };
        if l2.breaker.check().is_err() {
            return;
        }

        let mut conn = l2.conn.clone();
        let result: Result<(), _> = conn
            .set_ex(format!("{L2_PREFIX}{key}"), value, ttl.as_secs().max(1))
            .await;
        match result {
            Ok(()) => l2.breaker.record_success(),
            Err(e) => {
                tracing::debug!(key, error = %e, "L2 cache write failed");
                l2.breaker.record_failure();
            }
        }
    }

    async fn l2_clear(&self) {
        let Some(l2) = self.l2.as_ref() else {
            return;
        };
        if l2.breaker.check().is_err() {
            return;
        }

        let mut conn = l2.conn.clone();
        let keys: Result<Vec<String>, _> = async {
            let mut iter = conn.scan_match::<_, String>(format!("{L2_PREFIX}*")).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok::<_, redis::RedisError>(keys)
        }
        .await;

        match keys {
            Ok(keys) => {
                let mut conn = l2.conn.clone();
                if keys.is_empty() {
                    l2.breaker.record_success();
                    return;
                }
                let result: Result<(), _> = conn.del(keys).await;
                match result {
                    Ok(()) => l2.breaker.record_success(),
                    Err(e) => {
                        tracing::debug!(error = %e, "L2 cache clear failed");
                        l2.breaker.record_failure();
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "L2 cache scan failed");
                l2.breaker.record_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MultiLayerCache {
        MultiLayerCache::l1_only(
            128,
            Duration::from_secs(60),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let c = cache();
        c.put("k", &vec![1, 2, 3]).await;
        let got: Option<Vec<i32>> = c.get("k").await;
        assert_eq!(got, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        let c = cache();
        assert!(c.get_json("absent").await.is_none());
    }

    #[tokio::test]
    async fn test_negative_entry_distinct_from_miss() {
        let c = cache();
        c.put_negative("empty-result").await;
        assert_eq!(
            c.get_json("empty-result").await,
            Some(CachedValue::Negative)
        );
        // Typed lookup treats the cached negative as None
        let got: Option<String> = c.get("empty-result").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_negative_entry_expires_sooner() {
        let c = cache();
        c.put_negative("k").await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(c.get_json("k").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_l1_is_idempotent() {
        let c = cache();
        c.put("k", &1).await;
        c.clear(CacheLayer::L1).await;
        assert!(c.get_json("k").await.is_none());
        // Clearing again is a no-op, not an error
        c.clear(CacheLayer::L1).await;
        c.clear(CacheLayer::All).await;
    }

    #[tokio::test]
    async fn test_clear_l2_without_l2_is_noop() {
        let c = cache();
        c.put("k", &1).await;
        c.clear(CacheLayer::L2).await;
        // L1 untouched by an L2-only clear
        let got: Option<i32> = c.get("k").await;
        assert_eq!(got, Some(1));
    }

    #[tokio::test]
    async fn test_layer_parse() {
        assert_eq!("L1".parse::<CacheLayer>().unwrap(), CacheLayer::L1);
        assert_eq!("l2".parse::<CacheLayer>().unwrap(), CacheLayer::L2);
        assert_eq!("all".parse::<CacheLayer>().unwrap(), CacheLayer::All);
        assert!("l3".parse::<CacheLayer>().is_err());
    }
}
