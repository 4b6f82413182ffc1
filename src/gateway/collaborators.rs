//! Interfaces to the retrieval and generation backends.

use crate::types::{Message, ScoredChunk};
use crate::BoxError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Vector similarity search.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Top `k` chunks for `query`, best first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, BoxError>;

    /// Search restricted to a collection or metadata filter. Backends without
    /// scopes search everything.
    async fn retrieve_scoped(
        &self,
        query: &str,
        k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ScoredChunk>, BoxError> {
        let _ = scope;
        self.retrieve(query, k).await
    }
}

/// Everything a generator needs for one turn.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub context: Vec<ScoredChunk>,
    /// Recent conversation turns, oldest first.
    pub history: Vec<Message>,
}

impl GenerationRequest {
    /// Context rendered as one prompt block, one section per chunk.
    pub fn context_text(&self) -> String {
        self.context
            .iter()
            .map(|c| format!("Source: {}\n{}", c.source, c.content))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

/// Language model call.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BoxError>;

    /// Incremental variant. The default yields the whole answer as one
    /// fragment.
    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String, BoxError>>, BoxError> {
        let answer = self.generate(request).await?;
        Ok(stream::once(async move { Ok(answer) }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Generator for Echo {
        async fn generate(&self, request: GenerationRequest) -> Result<String, BoxError> {
            Ok(format!("echo: {}", request.question))
        }
    }

    #[tokio::test]
    async fn test_default_stream_is_single_fragment() {
        let request = GenerationRequest {
            question: "hola".into(),
            context: vec![],
            history: vec![],
        };
        let fragments: Vec<_> = Echo.generate_stream(request).await.unwrap().collect().await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_ref().unwrap(), "echo: hola");
    }

    #[test]
    fn test_context_text() {
        let request = GenerationRequest {
            question: "q".into(),
            context: vec![
                ScoredChunk::new("Vacations: 22 days.", "hr.pdf", 0.9),
                ScoredChunk::new("Office opens at 9.", "faq.md", 0.7),
            ],
            history: vec![],
        };
        assert_eq!(
            request.context_text(),
            "Source: hr.pdf\nVacations: 22 days.\n\n---\n\nSource: faq.md\nOffice opens at 9."
        );
    }
}
