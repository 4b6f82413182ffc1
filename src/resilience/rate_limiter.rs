use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub key: String,
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_keys: usize,
    pub capacity: f64,
    pub refill_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum burst size (tokens). New keys start with a full bucket.
    pub capacity: f64,
    /// Tokens per second. A non-positive rate disables limiting.
    pub refill_rate: f64,
    /// Buckets untouched for this long are dropped by [`RateLimiter::sweep_idle`].
    #[serde(with = "crate::utils::duration_secs")]
    pub idle_ttl: Duration,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            capacity: rps.max(1.0), // default burst: 1 second worth, at least 1
            refill_rate: rps,
            idle_ttl: Duration::from_secs(600),
        })
    }

    /// Create a new config with default values (10 burst, one token every 2s).
    pub fn new() -> Self {
        Self {
            capacity: 10.0,
            refill_rate: 0.5,
            idle_ttl: Duration::from_secs(600),
        }
    }

    /// Set the maximum tokens (burst size)
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.capacity = tokens as f64;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    /// Set how long an untouched bucket survives a sweep
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.refill_rate <= 0.0
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn full(cfg: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            tokens: cfg.capacity,
            last: now,
        }
    }

    fn refill(&mut self, cfg: &RateLimiterConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * cfg.refill_rate).min(cfg.capacity);
            self.last = now;
        }
    }

    fn try_take(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn wait_for(&self, cfg: &RateLimiterConfig, cost: f64) -> Duration {
        let missing = cost - self.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            // a tiny refill rate can push the wait past what Duration holds
            Duration::try_from_secs_f64(missing / cfg.refill_rate).unwrap_or(Duration::MAX)
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Per-key token-bucket rate limiter.
///
/// - Buckets are created lazily, full, on a key's first request
/// - Never blocks: a request is either admitted or rejected
/// - Buckets live in a sharded map, so callers on different keys rarely contend
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    /// Run `f` against the (refilled) bucket for `key`, creating it on first use.
    fn with_bucket<R>(&self, key: &str, f: impl FnOnce(&mut TokenBucket) -> R) -> R {
        let now = Instant::now();
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.refill(&self.cfg, now);
            return f(&mut *bucket);
        }
        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::full(&self.cfg, now));
        bucket.refill(&self.cfg, now);
        f(&mut *bucket)
    }

    /// Consume one token for `key`. Returns false when the bucket is empty.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Consume `cost` tokens at once (all or nothing).
    pub fn allow_n(&self, key: &str, cost: u32) -> bool {
        if self.cfg.is_unlimited() {
            return true;
        }
        let admitted = self.with_bucket(key, |b| b.try_take(cost as f64));
        if !admitted {
            debug!(key, cost, "rate limit bucket empty");
        }
        admitted
    }

    /// Like [`allow`](Self::allow), but reports a typed error carrying the back-off hint.
    pub fn check(&self, key: &str) -> Result<()> {
        if self.allow(key) {
            return Ok(());
        }
        let retry_after = self.retry_after(key);
        info!(key, retry_after_ms = millis(retry_after), "request rate limited");
        Err(Error::RateLimitExceeded {
            key: key.to_owned(),
            retry_after,
        })
    }

    /// Time until `key` has a whole token again. Zero when one is available.
    pub fn retry_after(&self, key: &str) -> Duration {
        if self.cfg.is_unlimited() || !self.buckets.contains_key(key) {
            return Duration::ZERO;
        }
        self.with_bucket(key, |b| b.wait_for(&self.cfg, 1.0))
    }

    /// Whole tokens currently left for `key`.
    pub fn remaining(&self, key: &str) -> u32 {
        if !self.buckets.contains_key(key) {
            return self.cfg.capacity.max(0.0) as u32;
        }
        self.with_bucket(key, |b| b.tokens.max(0.0) as u32)
    }

    pub fn snapshot(&self, key: &str) -> RateLimiterSnapshot {
        let (tokens, wait) = if self.buckets.contains_key(key) && !self.cfg.is_unlimited() {
            self.with_bucket(key, |b| (b.tokens, b.wait_for(&self.cfg, 1.0)))
        } else {
            (self.cfg.capacity, Duration::ZERO)
        };
        RateLimiterSnapshot {
            key: key.to_owned(),
            capacity: self.cfg.capacity,
            refill_rate: self.cfg.refill_rate,
            tokens,
            estimated_wait_ms: (wait > Duration::ZERO).then(|| millis(wait)),
        }
    }

    /// Drop buckets that have not been touched for `idle_ttl`. Returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last) < self.cfg.idle_ttl);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "swept idle rate limit buckets");
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_keys: self.buckets.len(),
            capacity: self.cfg.capacity,
            refill_rate: self.cfg.refill_rate,
        }
    }
}
