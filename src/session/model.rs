//! Session data model.

use crate::types::message::unix_millis;
use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub type SessionId = String;

/// A conversation with sliding expiry.
///
/// A session is unreachable once `now > last_active + ttl`. Messages can only
/// be appended through a [`SessionStore`](super::SessionStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    /// Unix milliseconds.
    created_at: u64,
    /// Unix milliseconds; refreshed on every append.
    last_active: u64,
    ttl_ms: u64,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl Session {
    pub(crate) fn new(id: SessionId, ttl: Duration, metadata: Map<String, Value>) -> Self {
        let now = unix_millis();
        Self {
            id,
            created_at: now,
            last_active: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            messages: Vec::new(),
            metadata,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_active(&self) -> u64 {
        self.last_active
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// The last `n` messages, oldest first.
    pub fn recent_messages(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.last_active.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_millis())
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.last_active = unix_millis().max(self.last_active);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            last_active: self.last_active,
            message_count: self.messages.len(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Lightweight listing view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: u64,
    pub last_active: u64,
    pub message_count: usize,
    pub metadata: Map<String, Value>,
}
