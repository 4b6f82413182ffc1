//! Durable session store: one JSON document per session on disk.

use super::model::{Session, SessionId, SessionSummary};
use super::store::SessionStore;
use crate::types::message::unix_millis;
use crate::types::Message;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Sessions survive process restarts. Writes go to a temporary file that is
/// renamed over the target, so a crash never leaves a half-written session.
///
/// Read-modify-write cycles are serialized by a store-wide lock; throughput is
/// bounded by the disk, not by contention.
pub struct FileSessionStore {
    dir: PathBuf,
    ttl: Duration,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::configuration_with_context(
                format!("cannot create session directory: {}", e),
                ErrorContext::new()
                    .with_field_path("sessions.dir")
                    .with_details(dir.display().to_string())
                    .with_source("file_session_store"),
            )
        })?;
        Ok(Self {
            dir,
            ttl,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Only uuid-shaped ids map to a path; anything else cannot name a file
    // outside the store directory.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        Uuid::parse_str(id)
            .ok()
            .map(|uuid| self.dir.join(format!("{}.json", uuid.hyphenated())))
    }

    async fn read(&self, path: &Path) -> Result<Option<Session>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, session: &Session) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(session)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every parseable session on disk with its path. Corrupt files are skipped.
    async fn scan(&self) -> Result<Vec<(PathBuf, Session)>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(session)) => out.push((path, session)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_with_metadata(&self, metadata: Map<String, Value>) -> Result<SessionId> {
        let _guard = self.write_lock.lock().await;
        loop {
            let id = Uuid::new_v4().to_string();
            let Some(path) = self.path_for(&id) else {
                continue;
            };
            if tokio::fs::try_exists(&path).await? {
                continue;
            }
            self.write(&path, &Session::new(id.clone(), self.ttl, metadata))
                .await?;
            info!(session_id = %id, backend = "file", "session created");
            return Ok(id);
        }
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let not_found = || Error::SessionNotFound { id: id.to_owned() };
        let path = self.path_for(id).ok_or_else(not_found)?;
        let session = self.read(&path).await?.ok_or_else(not_found)?;
        if session.is_expired() {
            let _guard = self.write_lock.lock().await;
            self.remove(&path).await?;
            return Err(not_found());
        }
        Ok(session)
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<Session> {
        let not_found = || Error::SessionNotFound { id: id.to_owned() };
        let path = self.path_for(id).ok_or_else(not_found)?;
        let _guard = self.write_lock.lock().await;
        let mut session = self.read(&path).await?.ok_or_else(not_found)?;
        if session.is_expired() {
            self.remove(&path).await?;
            return Err(Error::SessionExpired { id: id.to_owned() });
        }
        session.push(message);
        self.write(&path, &session).await?;
        Ok(session)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        let removed = self.remove(&path).await?;
        if removed {
            info!(session_id = id, backend = "file", "session deleted");
        }
        Ok(removed)
    }

    async fn cleanup(&self) -> Result<usize> {
        let now = unix_millis();
        let _guard = self.write_lock.lock().await;
        let mut removed = 0;
        for (path, session) in self.scan().await? {
            if session.is_expired_at(now) && self.remove(&path).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, backend = "file", "cleaned up expired sessions");
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let now = unix_millis();
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, s)| !s.is_expired_at(now))
            .map(|(_, s)| s.summary())
            .collect())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
