//! Session store capability trait.

use super::model::{Session, SessionId, SessionSummary};
use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Conversation registry with TTL expiry.
///
/// Implementations are chosen once at construction and used only through this
/// trait. Expired sessions behave as absent for reads; `append_message` reports
/// them as [`Error::SessionExpired`] so callers can tell a stale id from an
/// unknown one.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create an empty session and return its fresh, unique id.
    async fn create(&self) -> Result<SessionId> {
        self.create_with_metadata(Map::new()).await
    }

    async fn create_with_metadata(&self, metadata: Map<String, Value>) -> Result<SessionId>;

    /// Fetch a live session. Unknown and expired ids both yield
    /// [`Error::SessionNotFound`].
    async fn get(&self, id: &str) -> Result<Session>;

    /// Append a message and refresh the session's activity time.
    async fn append_message(&self, id: &str, message: Message) -> Result<Session>;

    /// Returns whether a session was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Purge every expired session, returning how many were removed.
    async fn cleanup(&self) -> Result<usize>;

    /// Summaries of live sessions.
    async fn list(&self) -> Result<Vec<SessionSummary>>;

    fn name(&self) -> &'static str;

    /// Resume `id` when it is live, otherwise start a new session.
    async fn get_or_create(&self, id: Option<&str>) -> Result<Session> {
        if let Some(id) = id {
            match self.get(id).await {
                Ok(session) => return Ok(session),
                Err(Error::SessionNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let id = self.create().await?;
        self.get(&id).await
    }
}
