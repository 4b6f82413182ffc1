//! In-process session store.

use super::model::{Session, SessionId, SessionSummary};
use super::store::SessionStore;
use crate::types::message::unix_millis;
use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Map-backed store. Sessions are lost on restart.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_with_metadata(&self, metadata: Map<String, Value>) -> Result<SessionId> {
        let mut sessions = self.sessions.write().await;
        let mut id = Uuid::new_v4().to_string();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        sessions.insert(id.clone(), Session::new(id.clone(), self.ttl, metadata));
        info!(session_id = %id, "session created");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let now = unix_millis();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(s) if !s.is_expired_at(now) => return Ok(s.clone()),
                None => return Err(Error::SessionNotFound { id: id.to_owned() }),
                Some(_) => {}
            }
        }
        // expired: drop it so it stops taking memory before the next cleanup
        let mut sessions = self.sessions.write().await;
        if sessions.get(id).map_or(false, |s| s.is_expired_at(now)) {
            sessions.remove(id);
            debug!(session_id = id, "expired session removed on read");
        }
        Err(Error::SessionNotFound { id: id.to_owned() })
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound { id: id.to_owned() })?;
        if session.is_expired() {
            sessions.remove(id);
            return Err(Error::SessionExpired { id: id.to_owned() });
        }
        session.push(message);
        Ok(session.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!(session_id = id, "session deleted");
        }
        Ok(removed)
    }

    async fn cleanup(&self) -> Result<usize> {
        let now = unix_millis();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "cleaned up expired sessions");
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let now = unix_millis();
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_expired_at(now))
            .map(Session::summary)
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_create_ids_are_unique() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let mut ids = HashSet::new();
        for _ in 0..500 {
            assert!(ids.insert(store.create().await.unwrap()));
        }
        assert_eq!(store.list().await.unwrap().len(), 500);
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let id = store.create().await.unwrap();
        store.append_message(&id, Message::user("hola")).await.unwrap();
        let s = store
            .append_message(&id, Message::assistant("¿en qué te ayudo?"))
            .await
            .unwrap();
        assert_eq!(s.messages().len(), 2);
        assert_eq!(store.get(&id).await.unwrap().messages()[0].content(), "hola");
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        assert!(matches!(
            store.get("nope").await,
            Err(Error::SessionNotFound { .. })
        ));
        assert!(matches!(
            store.append_message("nope", Message::user("x")).await,
            Err(Error::SessionNotFound { .. })
        ));
        assert!(!store.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_session_rejects_append() {
        let store = MemorySessionStore::new(Duration::from_millis(30));
        let id = store.create().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(
            store.append_message(&id, Message::user("late")).await,
            Err(Error::SessionExpired { .. })
        ));
        assert!(matches!(
            store.get(&id).await,
            Err(Error::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = MemorySessionStore::new(Duration::from_millis(500));
        let stale = store.create().await.unwrap();
        // sleeps only overrun, so `stale` is past its ttl and `fresh` has
        // the whole ttl as margin
        tokio::time::sleep(Duration::from_millis(600)).await;
        let fresh = store.create().await.unwrap();

        assert_eq!(store.cleanup().await.unwrap(), 1);
        assert!(store.get(&fresh).await.is_ok());
        assert!(store.get(&stale).await.is_err());
        assert_eq!(store.cleanup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_resumes_or_starts() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let id = store.create().await.unwrap();
        assert_eq!(store.get_or_create(Some(&id)).await.unwrap().id(), id);
        let other = store.get_or_create(Some("gone")).await.unwrap();
        assert_ne!(other.id(), "gone");
        assert!(store.get_or_create(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_metadata_is_kept() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        let mut meta = Map::new();
        meta.insert("channel".into(), Value::from("web"));
        let id = store.create_with_metadata(meta).await.unwrap();
        let s = store.get(&id).await.unwrap();
        assert_eq!(s.metadata()["channel"], "web");
        assert_eq!(store.list().await.unwrap()[0].metadata["channel"], "web");
    }
}
