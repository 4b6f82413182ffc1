//! 类型模块：会话消息与检索片段等核心数据类型。
//!
//! # Types Module
//!
//! Plain data shared by the cache, session and gateway layers.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Message`] | Immutable conversation turn with role and timestamp |
//! | [`MessageRole`] | Message role (user, assistant, system) |
//! | [`ScoredChunk`] | Retrieved context chunk with its similarity score |

pub mod chunk;
pub mod message;

pub use chunk::ScoredChunk;
pub use message::{Message, MessageRole};
