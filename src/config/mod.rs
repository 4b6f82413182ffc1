//! 配置模块：从 YAML 文件或 `RAG_GATE_*` 环境变量加载并校验全部组件配置。
//!
//! # Configuration Module
//!
//! [`Settings`] gathers the configuration of every component. It can be
//! written in code, read from YAML with [`Settings::from_yaml_file`], or
//! assembled from the environment with [`Settings::from_env`]:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RAG_GATE_RATE_LIMIT_CAPACITY` | `rate_limit.capacity` |
//! | `RAG_GATE_RATE_LIMIT_REFILL_RATE` | `rate_limit.refill_rate` |
//! | `RAG_GATE_RATE_LIMIT_IDLE_TTL_SECS` | `rate_limit.idle_ttl` |
//! | `RAG_GATE_RETRIEVAL_CACHE_CAPACITY` / `_TTL_SECS` | `retrieval_cache.*` |
//! | `RAG_GATE_ANSWER_CACHE_CAPACITY` / `_TTL_SECS` | `answer_cache.*` |
//! | `RAG_GATE_QUEUE_MAX_CONCURRENT` | `queue.max_concurrent` |
//! | `RAG_GATE_QUEUE_MAX_SIZE` | `queue.max_size` |
//! | `RAG_GATE_QUEUE_TASK_TIMEOUT_SECS` | `queue.task_timeout` |
//! | `RAG_GATE_QUEUE_INTERRUPTIBLE` | `queue.interruptible` |
//! | `RAG_GATE_SESSION_TTL_SECS` | `sessions.ttl` |
//! | `RAG_GATE_SESSION_BACKEND`, `RAG_GATE_SESSION_DIR` | `sessions.backend` |
//! | `RAG_GATE_RETRIEVER_K`, `RAG_GATE_HISTORY_WINDOW` | `gateway.*` |
//! | `RAG_GATE_SWEEP_INTERVAL_SECS` | `sweep_interval` (required) |

mod settings;

pub use settings::{SessionSettings, Settings, ENV_PREFIX};
