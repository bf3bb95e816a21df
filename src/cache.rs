// SPDX-License-Identifier: BSD-3-Clause

//! Per-cluster TTL cache.
//!
//! A concurrent key/value store over a moka future cache. Writes are
//! asynchronous: moka queues maintenance work internally, so a `insert`
//! followed immediately by a `get` is not guaranteed to observe the value.
//! Callers that need a synchronous view call [`ClusterCache::sync`] to drain
//! the pending queue first. This is a documented, testable property of the
//! store, not an incidental race.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;

/// Default maximum number of cached entries per cluster.
const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// Default time-to-live for entries that do not carry their own TTL.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache sizing and expiry configuration, applied at cluster registration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
            default_ttl: DEFAULT_TTL,
        }
    }
}

/// A cached value plus its per-entry TTL.
#[derive(Clone)]
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    ttl: Option<Duration>,
}

/// Expiry policy honoring each entry's own TTL, falling back to the
/// cache-wide default.
struct PerEntryExpiry {
    default_ttl: Duration,
}

impl Expiry<String, CacheEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl.unwrap_or(self.default_ttl))
    }
}

/// Concurrent, TTL-aware key/value store owned by one cluster.
pub struct ClusterCache {
    inner: Cache<String, CacheEntry>,
}

impl ClusterCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(PerEntryExpiry {
                default_ttl: config.default_ttl,
            })
            .build();
        Self { inner }
    }

    /// Store a value under `key` with the cache-wide default TTL.
    pub async fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.insert_with_ttl(key, value, None).await;
    }

    /// Store a value under `key`, expiring after `ttl` if given.
    pub async fn insert_with_ttl<T: Send + Sync + 'static>(
        &self,
        key: impl Into<String>,
        value: T,
        ttl: Option<Duration>,
    ) {
        let entry = CacheEntry {
            value: Arc::new(value),
            ttl,
        };
        self.inner.insert(key.into(), entry).await;
    }

    /// Look up a value of type `T`. Returns `None` on a miss or a type
    /// mismatch.
    pub async fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.inner.get(key).await?;
        entry.value.downcast::<T>().ok()
    }

    /// Drain moka's pending write/maintenance queue so that all prior
    /// `insert` calls become visible to `get`.
    pub async fn sync(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Drop every cached entry. Does not touch the snapshots the cached
    /// values were derived from.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Number of entries currently accounted for (approximate until
    /// [`ClusterCache::sync`] has run).
    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
