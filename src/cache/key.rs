//! Cache key generation.

use crate::types::ScoredChunk;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key of the retrieval cache: the normalized query plus everything that
/// changes which chunks come back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrievalKey {
    pub query: String,
    pub k: usize,
    pub scope: Option<String>,
}

impl RetrievalKey {
    pub fn new(query: &str, k: usize) -> Self {
        Self {
            query: normalize_query(query),
            k,
            scope: None,
        }
    }

    /// Restrict the key to a collection, tenant or metadata filter.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

impl std::fmt::Display for RetrievalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "search:{}:{}:{}", self.query, self.k, scope),
            None => write!(f, "search:{}:{}", self.query, self.k),
        }
    }
}

/// Trim, collapse internal whitespace and lowercase, so trivially different
/// spellings of the same question share a cache slot.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// Length-prefixed so ("ab", "c") and ("a", "bc") never hash alike.
fn update_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// Stable digest of an ordered set of context chunks.
pub fn context_fingerprint(chunks: &[ScoredChunk]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((chunks.len() as u64).to_le_bytes());
    for chunk in chunks {
        update_field(&mut hasher, &chunk.source);
        update_field(&mut hasher, &chunk.content);
    }
    hex(&hasher.finalize())
}

/// Key of the answer cache: SHA-256 over the normalized question and the
/// fingerprint of the context it was answered from.
pub fn answer_key(question: &str, chunks: &[ScoredChunk]) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, "response");
    update_field(&mut hasher, &normalize_query(question));
    update_field(&mut hasher, &context_fingerprint(chunks));
    hex(&hasher.finalize())
}
