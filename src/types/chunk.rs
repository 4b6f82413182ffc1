//! Retrieved context chunks.

use serde::{Deserialize, Serialize};

/// One piece of retrieved context with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub content: String,
    /// Document the chunk came from (file name, URL, ...).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub score: f32,
}

impl ScoredChunk {
    pub fn new(content: impl Into<String>, source: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            page: None,
            score,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Content shortened to `max_chars` characters, suffixed with "..." when cut.
    pub fn preview(&self, max_chars: usize) -> String {
        if self.content.chars().count() <= max_chars {
            return self.content.clone();
        }
        let mut out: String = self.content.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
