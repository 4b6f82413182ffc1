//! 推理队列模块：有界并发的 FIFO 调度器，负责准入、超时、取消与流式交付。
//!
//! # Inference Queue Module
//!
//! Retrieval plus generation takes seconds and the backend can only serve a
//! handful of calls at once. [`InferenceQueue`] is the single door to it.
//!
//! ## Task lifecycle
//!
//! ```text
//! submit ──► Pending ──► Running ──► Completed | Failed | TimedOut
//!    │          │           │
//!    ▼          ▼           ▼
//! Rejected   Cancelled   Cancelled
//!            TimedOut
//! ```
//!
//! ## Guarantees
//!
//! - Pending plus running never exceeds `max_size`; a full queue rejects at
//!   once with [`Error::QueueFull`](crate::Error::QueueFull)
//! - Running never exceeds `max_concurrent`
//! - Admission order is execution order
//! - Every terminal path frees its slot; a non-interruptible job frees it
//!   only when it actually returns
//! - A streaming task ends with exactly one [`StreamEvent::End`] or
//!   [`StreamEvent::Error`]
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`InferenceQueue`] | Admission, worker pool and bookkeeping |
//! | [`TaskHandle`] | Awaitable, cancellable result of one task |
//! | [`FragmentStream`] | Stream of [`StreamEvent`]s for streaming tasks |
//! | [`FragmentSink`] | Producer side handed to streaming jobs |
//! | [`QueueConfig`] | Bounds, timeout and interruptibility |
//! | [`QueueStats`] | Occupancy and outcome counters |

mod config;
mod inference;
mod stream;
mod task;

pub use config::{QueueConfig, QueueStats};
pub use inference::InferenceQueue;
pub use stream::{FragmentSink, FragmentStream, StreamEvent};
pub use task::{CancelHandle, TaskHandle, TaskId, TaskState};
pub use tokio_util::sync::CancellationToken;
