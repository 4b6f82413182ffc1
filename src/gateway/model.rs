//! Request and response types of the chat gateway.

use crate::cache::RetrievalKey;
use crate::types::message::unix_millis;
use crate::types::ScoredChunk;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    /// Resume this conversation; a fresh session is started when absent,
    /// unknown or expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Collection or filter the search is restricted to. Part of the
    /// retrieval cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ChatRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: None,
            scope: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Key of this question in the retrieval cache.
    pub(crate) fn retrieval_key(&self, k: usize) -> RetrievalKey {
        let key = RetrievalKey::new(&self.question, k);
        match &self.scope {
            Some(scope) => key.with_scope(scope.clone()),
            None => key,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.question.trim().is_empty() {
            return Err(Error::InvalidRequest {
                message: "question must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub session_id: String,
    /// Context the answer was grounded on, with shortened content.
    pub sources: Vec<ScoredChunk>,
    /// True when the answer came from the answer cache.
    pub cached: bool,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl ChatResponse {
    pub(crate) fn new(
        answer: String,
        session_id: String,
        sources: Vec<ScoredChunk>,
        cached: bool,
    ) -> Self {
        Self {
            answer,
            session_id,
            sources,
            cached,
            timestamp: unix_millis(),
        }
    }
}
