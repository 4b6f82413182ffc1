//! Process-level settings: every component's configuration in one document.

use crate::cache::CacheConfig;
use crate::gateway::GatewayConfig;
use crate::queue::QueueConfig;
use crate::resilience::RateLimiterConfig;
use crate::session::SessionBackend;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable read by [`Settings::from_env`].
pub const ENV_PREFIX: &str = "RAG_GATE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Sliding idle timeout of a conversation.
    #[serde(with = "crate::utils::duration_secs")]
    pub ttl: Duration,
    pub backend: SessionBackend,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            backend: SessionBackend::Memory,
        }
    }
}

/// Complete configuration of a [`Runtime`](crate::runtime::Runtime).
///
/// ```yaml
/// rate_limit: { capacity: 10, refill_rate: 0.5 }
/// retrieval_cache: { capacity: 512, ttl: 1800 }
/// answer_cache: { capacity: 256, ttl: 3600 }
/// queue: { max_concurrent: 2, max_size: 50, task_timeout: 120 }
/// sessions: { ttl: 86400, backend: { kind: file, dir: ./data/sessions } }
/// sweep_interval: 60
/// ```
///
/// Durations are seconds. `sweep_interval` has no default and must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rate_limit: RateLimiterConfig,
    pub retrieval_cache: CacheConfig,
    pub answer_cache: CacheConfig,
    pub queue: QueueConfig,
    pub sessions: SessionSettings,
    pub gateway: GatewayConfig,
    /// How often expired cache entries, idle limiter buckets and expired
    /// sessions are swept.
    #[serde(with = "crate::utils::option_duration_secs")]
    pub sweep_interval: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limit: RateLimiterConfig::default(),
            retrieval_cache: CacheConfig::retrieval(),
            answer_cache: CacheConfig::answer(),
            queue: QueueConfig::default(),
            sessions: SessionSettings::default(),
            gateway: GatewayConfig::default(),
            sweep_interval: None,
        }
    }
}

fn config_error(message: impl Into<String>, field: &str, details: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("settings"),
    )
}

impl Settings {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .unwrap_or_default();
            config_error(format!("invalid settings document: {}", e), "<root>", location)
        })
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            config_error(
                format!("cannot read settings file: {}", e),
                "<file>",
                path.display().to_string(),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Defaults overridden by `RAG_GATE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `RAG_GATE_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |suffix: &str| {
            let name = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&name).map(|value| (name, value))
        };

        if let Some(v) = parse(var("RATE_LIMIT_CAPACITY"))? {
            self.rate_limit.capacity = v;
        }
        if let Some(v) = parse(var("RATE_LIMIT_REFILL_RATE"))? {
            self.rate_limit.refill_rate = v;
        }
        if let Some(v) = parse_secs(var("RATE_LIMIT_IDLE_TTL_SECS"))? {
            self.rate_limit.idle_ttl = v;
        }
        if let Some(v) = parse(var("RETRIEVAL_CACHE_CAPACITY"))? {
            self.retrieval_cache.capacity = v;
        }
        if let Some(v) = parse_secs(var("RETRIEVAL_CACHE_TTL_SECS"))? {
            self.retrieval_cache.ttl = v;
        }
        if let Some(v) = parse(var("ANSWER_CACHE_CAPACITY"))? {
            self.answer_cache.capacity = v;
        }
        if let Some(v) = parse_secs(var("ANSWER_CACHE_TTL_SECS"))? {
            self.answer_cache.ttl = v;
        }
        if let Some(v) = parse(var("QUEUE_MAX_CONCURRENT"))? {
            self.queue.max_concurrent = v;
        }
        if let Some(v) = parse(var("QUEUE_MAX_SIZE"))? {
            self.queue.max_size = v;
        }
        if let Some(v) = parse_secs(var("QUEUE_TASK_TIMEOUT_SECS"))? {
            self.queue.task_timeout = v;
        }
        if let Some(v) = parse(var("QUEUE_INTERRUPTIBLE"))? {
            self.queue.interruptible = v;
        }
        if let Some(v) = parse_secs(var("SESSION_TTL_SECS"))? {
            self.sessions.ttl = v;
        }
        if let Some((name, kind)) = var("SESSION_BACKEND") {
            self.sessions.backend = match kind.trim().to_ascii_lowercase().as_str() {
                "memory" => SessionBackend::Memory,
                "file" => SessionBackend::File {
                    dir: var("SESSION_DIR")
                        .map(|(_, dir)| PathBuf::from(dir))
                        .unwrap_or_else(|| PathBuf::from("./data/sessions")),
                },
                other => {
                    return Err(config_error(
                        format!("unknown session backend '{}'", other),
                        &name,
                        "expected 'memory' or 'file'",
                    ))
                }
            };
        }
        if let Some(v) = parse(var("RETRIEVER_K"))? {
            self.gateway.retriever_k = v;
        }
        if let Some(v) = parse(var("HISTORY_WINDOW"))? {
            self.gateway.history_window = v;
        }
        if let Some(v) = parse_secs(var("SWEEP_INTERVAL_SECS"))? {
            self.sweep_interval = Some(v);
        }
        Ok(self)
    }

    /// Reject settings no component could run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if !rl.capacity.is_finite() || !rl.refill_rate.is_finite() {
            return Err(config_error(
                "rate limit values must be finite",
                "rate_limit",
                format!("capacity={}, refill_rate={}", rl.capacity, rl.refill_rate),
            ));
        }
        if !rl.is_unlimited() && rl.capacity < 1.0 {
            return Err(config_error(
                "rate limit capacity must allow at least one request",
                "rate_limit.capacity",
                format!("got {}", rl.capacity),
            ));
        }
        for (field, cache) in [
            ("retrieval_cache", &self.retrieval_cache),
            ("answer_cache", &self.answer_cache),
        ] {
            if cache.capacity == 0 {
                return Err(config_error(
                    "cache capacity must be at least 1",
                    &format!("{}.capacity", field),
                    "got 0",
                ));
            }
            if cache.ttl.is_zero() {
                return Err(config_error(
                    "cache ttl must be greater than zero",
                    &format!("{}.ttl", field),
                    "got 0",
                ));
            }
        }
        self.queue.validate()?;
        if self.sessions.ttl.is_zero() {
            return Err(config_error(
                "session ttl must be greater than zero",
                "sessions.ttl",
                "got 0",
            ));
        }
        if self.gateway.retriever_k == 0 {
            return Err(config_error(
                "retriever_k must be at least 1",
                "gateway.retriever_k",
                "got 0",
            ));
        }
        match self.sweep_interval {
            None => Err(config_error(
                "sweep_interval is required",
                "sweep_interval",
                "set it in the settings file or RAG_GATE_SWEEP_INTERVAL_SECS",
            )),
            Some(d) if d.is_zero() => Err(config_error(
                "sweep_interval must be greater than zero",
                "sweep_interval",
                "got 0",
            )),
            Some(_) => Ok(()),
        }
    }
}

fn parse<T>(var: Option<(String, String)>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some((name, raw)) = var else {
        return Ok(None);
    };
    raw.trim().parse::<T>().map(Some).map_err(|e| {
        config_error(
            format!("invalid value for {}: {}", name, e),
            &name,
            format!("got '{}'", raw),
        )
    })
}

fn parse_secs(var: Option<(String, String)>) -> Result<Option<Duration>> {
    let name = var.as_ref().map(|(n, _)| n.clone()).unwrap_or_default();
    match parse::<f64>(var)? {
        None => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs).map(Some).map_err(|e| {
            config_error(
                format!("invalid duration for {}: {}", name, e),
                &name,
                format!("got {}", secs),
            )
        }),
    }
}
