//! 弹性模块：按调用方键进行令牌桶限流，保护昂贵的推理后端。
//!
//! # Resilience Primitives Module
//!
//! Admission control in front of the inference queue.
//!
//! ## Rate Limiter
//!
//! Each caller key (client IP, API key, user id) gets its own token bucket,
//! created full on first use and refilled continuously:
//!
//! ```rust
//! use rag_gate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! let config = RateLimiterConfig::new()
//!     .with_max_tokens(10)
//!     .with_refill_rate(0.5); // one request every 2 seconds
//! let limiter = RateLimiter::new(config);
//!
//! if limiter.allow("203.0.113.7") {
//!     // Proceed with request...
//! }
//! ```
//!
//! Buckets of keys that stop calling are reclaimed by
//! [`RateLimiter::sweep_idle`](rate_limiter::RateLimiter::sweep_idle), which the
//! runtime sweeper invokes on its configured interval.

pub mod rate_limiter;

pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot, RateLimiterStats};
