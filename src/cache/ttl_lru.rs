//! Bounded cache with per-entry TTL and LRU eviction.

use super::config::{AtomicStats, CacheConfig, CacheStats};
use crate::utils::instant_after;
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct State<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    last_prune: Option<Instant>,
}

enum Lookup<V> {
    Missing,
    Expired,
    Hit(V),
}

/// Thread-safe key/value store with two independent eviction triggers:
/// absolute expiry per entry and capacity-bounded recency.
///
/// Recency is tracked by [`lru::LruCache`], so `get`/`put` are O(1). Expired
/// entries are dropped when touched, when a full cache prunes opportunistically,
/// and by [`purge_expired`](Self::purge_expired), which the runtime sweeper calls
/// on a fixed interval.
pub struct TtlLruCache<K: Hash + Eq, V> {
    name: &'static str,
    config: CacheConfig,
    state: Mutex<State<K, V>>,
    stats: AtomicStats,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// `config.capacity` is clamped to at least 1.
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            config,
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                last_prune: None,
            }),
            stats: AtomicStats::default(),
        }
    }

    // A panic while holding the lock cannot leave the LRU list half-updated
    // from our side, so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the value and marks it most recently used, or `None` when the key
    /// is absent or expired (an expired entry is removed on the spot).
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut st = self.lock();
        let lookup = match st.entries.get(key) {
            None => Lookup::Missing,
            Some(entry) if entry.is_expired(now) => Lookup::Expired,
            Some(entry) => Lookup::Hit(entry.value.clone()),
        };
        match lookup {
            Lookup::Hit(value) => {
                AtomicStats::bump(&self.stats.hits, 1);
                Some(value)
            }
            Lookup::Expired => {
                st.entries.pop(key);
                AtomicStats::bump(&self.stats.expirations, 1);
                AtomicStats::bump(&self.stats.misses, 1);
                None
            }
            Lookup::Missing => {
                AtomicStats::bump(&self.stats.misses, 1);
                None
            }
        }
    }

    /// Like [`get`](Self::get) but without touching recency or stats.
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let st = self.lock();
        st.entries
            .peek(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    /// Insert with the configured default TTL.
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.config.ttl);
    }

    /// Insert or overwrite. When the insert pushes the cache past capacity the
    /// least recently used entry is evicted.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut st = self.lock();
        let overwrite = st.entries.contains(&key);
        if !overwrite && st.entries.len() >= st.entries.cap().get() {
            self.maybe_prune(&mut st, now);
        }
        let entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at: instant_after(now, ttl),
        };
        if st.entries.push(key, entry).is_some() && !overwrite {
            AtomicStats::bump(&self.stats.evictions, 1);
            debug!(cache = self.name, "evicted least recently used entry");
        }
        AtomicStats::bump(&self.stats.inserts, 1);
    }

    /// Remove a specific key. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Drop every entry and return how many there were.
    pub fn clear(&self) -> usize {
        let mut st = self.lock();
        let dropped = st.entries.len();
        st.entries.clear();
        drop(st);
        debug!(cache = self.name, dropped, "cache cleared");
        dropped
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut st = self.lock();
        Self::purge_locked(&mut st, now, &self.stats)
    }

    /// Age of a live entry, mostly useful for diagnostics.
    pub fn age(&self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        let st = self.lock();
        st.entries
            .peek(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| now.saturating_duration_since(e.inserted_at))
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().entries.cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        self.stats.to_stats(self.name, size, self.capacity())
    }

    fn maybe_prune(&self, st: &mut State<K, V>, now: Instant) {
        let due = st
            .last_prune
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.prune_interval);
        if due {
            Self::purge_locked(st, now, &self.stats);
        }
    }

    fn purge_locked(st: &mut State<K, V>, now: Instant, stats: &AtomicStats) -> usize {
        st.last_prune = Some(now);
        let expired: Vec<K> = st
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            st.entries.pop(key);
        }
        AtomicStats::bump(&stats.expirations, expired.len() as u64);
        expired.len()
    }
}
