//! 会话模块：带 TTL 过期的多轮对话存储，支持内存与文件两种后端。
//!
//! # Session Module
//!
//! Conversation registry with sliding expiry. Each append refreshes a
//! session's activity time; a session idle longer than its TTL is gone.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`SessionStore`] | Capability trait every backend implements |
//! | [`MemorySessionStore`] | In-process map, lost on restart |
//! | [`FileSessionStore`] | One JSON document per session on disk |
//! | [`SessionBackend`] | Serializable backend selector for [`Settings`](crate::config::Settings) |
//!
//! The backend is picked once with [`build_session_store`] and used only as
//! `Arc<dyn SessionStore>` afterwards.

mod file;
mod memory;
mod model;
mod store;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use model::{Session, SessionId, SessionSummary};
pub use store::SessionStore;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where sessions live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionBackend {
    #[default]
    Memory,
    File { dir: PathBuf },
}

/// Construct the store named by `backend`.
pub async fn build_session_store(
    backend: &SessionBackend,
    ttl: Duration,
) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match backend {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new(ttl)),
        SessionBackend::File { dir } => Arc::new(FileSessionStore::open(dir, ttl).await?),
    };
    tracing::info!(backend = store.name(), ttl_secs = ttl.as_secs(), "session store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_selects_backend() {
        let memory = build_session_store(&SessionBackend::Memory, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(memory.name(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let file = build_session_store(
            &SessionBackend::File {
                dir: dir.path().join("sessions"),
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(file.name(), "file");
        assert!(dir.path().join("sessions").is_dir());
    }

    #[test]
    fn test_backend_yaml_shape() {
        let backend: SessionBackend =
            serde_yaml::from_str("kind: file\ndir: /var/lib/rag-gate").unwrap();
        assert_eq!(
            backend,
            SessionBackend::File {
                dir: PathBuf::from("/var/lib/rag-gate")
            }
        );
        let backend: SessionBackend = serde_yaml::from_str("kind: memory").unwrap();
        assert_eq!(backend, SessionBackend::Memory);
    }
}
