//! Cache configuration and statistics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction kicks in.
    pub capacity: usize,
    /// Default time-to-live for entries inserted with `put`.
    #[serde(with = "crate::utils::duration_secs")]
    pub ttl: Duration,
    /// Minimum spacing between opportunistic prunes triggered by a full cache.
    #[serde(with = "crate::utils::duration_secs")]
    pub prune_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieval results: larger, shorter-lived (tracks document freshness).
    pub fn retrieval() -> Self {
        Self::new()
            .with_capacity(512)
            .with_ttl(Duration::from_secs(1800))
    }

    /// Generated answers: longer-lived, regeneration is the expensive part.
    pub fn answer() -> Self {
        Self::new()
            .with_capacity(256)
            .with_ttl(Duration::from_secs(3600))
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
pub(crate) struct AtomicStats {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) inserts: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expirations: AtomicU64,
}

impl AtomicStats {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn to_stats(&self, name: &'static str, size: usize, capacity: usize) -> CacheStats {
        CacheStats {
            name,
            size,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
