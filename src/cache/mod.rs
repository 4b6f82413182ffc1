//! 缓存模块：带 TTL 过期与 LRU 淘汰的有界缓存，用于检索结果和生成答案。
//!
//! # Caching Module
//!
//! Bounded, expiring memoization in front of the two expensive steps of a RAG
//! request: retrieval and generation.
//!
//! ## Overview
//!
//! Every entry has two independent ways to leave the cache:
//! - Its absolute TTL runs out (checked on read, on a full insert, and by the
//!   runtime sweeper)
//! - It becomes the least recently used entry of a full cache
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TtlLruCache`] | Generic thread-safe TTL + LRU store |
//! | [`CacheConfig`] | Capacity, default TTL and prune spacing |
//! | [`CacheStats`] | Hit/miss/eviction counters |
//! | [`RetrievalKey`] | Normalized query key for retrieval results |
//! | [`answer_key`] | Digest of question + context fingerprint for answers |
//!
//! ## Example
//!
//! ```rust
//! use rag_gate::cache::{CacheConfig, RetrievalCache, RetrievalKey};
//!
//! let cache = RetrievalCache::new("retrieval", CacheConfig::retrieval());
//! let key = RetrievalKey::new("How many vacation days?", 4);
//! assert!(cache.get(&key).is_none());
//! cache.put(key.clone(), Vec::new());
//! assert!(cache.get(&key).is_some());
//! ```

mod config;
mod key;
mod ttl_lru;

pub use config::{CacheConfig, CacheStats};
pub use key::{answer_key, context_fingerprint, normalize_query, RetrievalKey};
pub use ttl_lru::TtlLruCache;

use crate::types::ScoredChunk;

/// Retrieved context chunks keyed by normalized query.
pub type RetrievalCache = TtlLruCache<RetrievalKey, Vec<ScoredChunk>>;

/// Generated answers keyed by [`answer_key`].
pub type AnswerCache = TtlLruCache<String, String>;
