//! # rag-gate
//!
//! 面向检索增强生成（RAG）服务的准入控制层：限流、缓存、会话与有界推理队列。
//!
//! Admission layer for retrieval-augmented LLM services. It sits between
//! the HTTP surface of a RAG service and its two expensive collaborators,
//! the retriever and the generator, and decides what work is admitted, what
//! is answered from memory, and how much inference runs at once.
//!
//! ## Overview
//!
//! A request flows through the components in a fixed order:
//!
//! ```text
//! client key ──► RateLimiter ──► SessionStore (history)
//!                                   │
//!                                   ▼
//!              RetrievalCache ◄── retrieve ──► Retriever
//!                                   │
//!                                   ▼
//!                 AnswerCache ◄── generate ──► InferenceQueue ──► Generator
//!                                   │
//!                                   ▼
//!                          SessionStore (record turn)
//! ```
//!
//! - **Rate limiting**: token bucket per client key, idle buckets swept away
//! - **Caching**: two TTL + LRU caches, one for retrieval results and one for
//!   history-free answers
//! - **Sessions**: multi-turn conversation memory with sliding expiry, in
//!   memory or on disk
//! - **Inference queue**: bounded FIFO with a fixed worker count, per-task
//!   deadlines, cancellation and streaming output
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rag_gate::{ChatRequest, Runtime, Settings};
//! # use std::sync::Arc;
//! # async fn demo(
//! #     retriever: Arc<dyn rag_gate::gateway::Retriever>,
//! #     generator: Arc<dyn rag_gate::gateway::Generator>,
//! # ) -> rag_gate::Result<()> {
//! let settings = Settings::from_yaml_file("rag-gate.yaml").await?;
//! let runtime = Runtime::builder(settings)
//!     .retriever(retriever)
//!     .generator(generator)
//!     .build()
//!     .await?;
//!
//! let response = runtime
//!     .gateway()
//!     .ask("10.0.0.7", ChatRequest::new("How many vacation days do I get?"))
//!     .await?;
//! println!("{} (session {})", response.answer, response.session_id);
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Token-bucket rate limiting per client key |
//! | [`cache`] | TTL + LRU caches for retrieval results and answers |
//! | [`session`] | Conversation sessions with memory and file backends |
//! | [`queue`] | Bounded inference queue with timeouts, cancellation and streaming |
//! | [`gateway`] | Request orchestration over the components above |
//! | [`config`] | Settings from YAML or environment |
//! | [`runtime`] | Explicitly owned component set plus background sweeper |
//! | [`types`] | Messages and scored retrieval chunks |
//! | [`logging`] | tracing-subscriber initialisation for binaries |

pub mod cache;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod queue;
pub mod resilience;
pub mod runtime;
pub mod session;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::Settings;
pub use gateway::{ChatRequest, ChatResponse, ChatStream, Gateway, Generator, Retriever};
pub use queue::{InferenceQueue, QueueConfig, StreamEvent, TaskHandle, TaskState};
pub use resilience::{RateLimiter, RateLimiterConfig};
pub use runtime::{Runtime, RuntimeStats};
pub use session::{Session, SessionId, SessionStore};
pub use types::{
    chunk::ScoredChunk,
    message::{Message, MessageRole},
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{BoxError, Error, ErrorContext};
