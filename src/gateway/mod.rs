//! 网关模块：把限流、缓存、会话与推理队列组合成一次完整的 RAG 问答流程。
//!
//! # Gateway Module
//!
//! One chat turn, end to end:
//!
//! 1. Rate limit the caller key
//! 2. Resume or start the session
//! 3. Retrieval cache, then answer cache (fresh conversations only)
//! 4. On a miss, retrieval and generation run as one queued job
//! 5. The user and assistant messages are appended to the session
//!
//! Retrieval and generation are reached only through the [`Retriever`] and
//! [`Generator`] traits.

mod collaborators;
mod model;
mod service;
mod stream;

pub use collaborators::{GenerationRequest, Generator, Retriever};
pub use model::{ChatRequest, ChatResponse};
pub use service::{Components, Gateway, GatewayConfig};
pub use stream::ChatStream;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AnswerCache, CacheConfig, RetrievalCache};
    use crate::queue::{InferenceQueue, QueueConfig, StreamEvent};
    use crate::resilience::{RateLimiter, RateLimiterConfig};
    use crate::session::{MemorySessionStore, SessionStore};
    use crate::types::ScoredChunk;
    use crate::{BoxError, Error};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRetriever {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Retriever for CountingRetriever {
        async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..k.min(2))
                .map(|i| ScoredChunk::new(format!("{query} chunk {i}"), "handbook.pdf", 0.9))
                .collect())
        }
    }

    #[derive(Default)]
    struct ScriptedGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, request: GenerationRequest) -> Result<String, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                "answer to '{}' ({} turns of history)",
                request.question,
                request.history.len()
            ))
        }

        async fn generate_stream(
            &self,
            request: GenerationRequest,
        ) -> Result<BoxStream<'static, Result<String, BoxError>>, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let words: Vec<Result<String, BoxError>> = ["streamed ", "answer ", "to ", "'"]
                .into_iter()
                .map(String::from)
                .chain([request.question, "'".to_string()])
                .map(Ok)
                .collect();
            Ok(stream::iter(words).boxed())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        async fn generate(&self, _request: GenerationRequest) -> Result<String, BoxError> {
            Err("model server unreachable".into())
        }
    }

    struct Fixture {
        gateway: Gateway,
        components: Components,
        retriever: Arc<CountingRetriever>,
        generator: Arc<ScriptedGenerator>,
    }

    fn components(limiter: RateLimiterConfig) -> Components {
        Components {
            limiter: Arc::new(RateLimiter::new(limiter)),
            retrieval_cache: Arc::new(RetrievalCache::new("retrieval", CacheConfig::retrieval())),
            answer_cache: Arc::new(AnswerCache::new("answer", CacheConfig::answer())),
            sessions: Arc::new(MemorySessionStore::new(Duration::from_secs(3600))),
            queue: Arc::new(
                InferenceQueue::new(QueueConfig::new().with_max_concurrent(1).with_max_size(4))
                    .unwrap(),
            ),
        }
    }

    fn fixture() -> Fixture {
        let components = components(RateLimiterConfig::new().with_max_tokens(100));
        let retriever = Arc::new(CountingRetriever::default());
        let generator = Arc::new(ScriptedGenerator::default());
        let gateway = Gateway::new(
            GatewayConfig::default(),
            &components,
            retriever.clone(),
            generator.clone(),
        );
        Fixture {
            gateway,
            components,
            retriever,
            generator,
        }
    }

    #[tokio::test]
    async fn test_ask_records_turn_in_new_session() {
        let f = fixture();
        let response = f
            .gateway
            .ask("10.0.0.1", ChatRequest::new("How many vacation days?"))
            .await
            .unwrap();

        assert!(!response.cached);
        assert_eq!(response.sources.len(), 2);
        let session = f.components.sessions.get(&response.session_id).await.unwrap();
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[1].content(), response.answer);
    }

    #[tokio::test]
    async fn test_repeat_question_hits_both_caches() {
        let f = fixture();
        let first = f
            .gateway
            .ask("10.0.0.1", ChatRequest::new("How many vacation days?"))
            .await
            .unwrap();
        let second = f
            .gateway
            .ask("10.0.0.2", ChatRequest::new("  how many VACATION days? "))
            .await
            .unwrap();

        assert!(second.cached);
        assert_eq!(first.answer, second.answer);
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(f.retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.components.queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_follow_up_skips_answer_cache_and_sees_history() {
        let f = fixture();
        let first = f
            .gateway
            .ask("10.0.0.1", ChatRequest::new("Office hours?"))
            .await
            .unwrap();
        let follow_up = f
            .gateway
            .ask(
                "10.0.0.1",
                ChatRequest::new("Office hours?").with_session(&first.session_id),
            )
            .await
            .unwrap();

        assert!(!follow_up.cached);
        assert_eq!(follow_up.session_id, first.session_id);
        assert!(follow_up.answer.contains("2 turns of history"));
        // retrieval is still shared
        assert_eq!(f.retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_caller_is_rejected_before_any_work() {
        let components = components(RateLimiterConfig::new().with_max_tokens(1).with_refill_rate(0.01));
        let retriever = Arc::new(CountingRetriever::default());
        let gateway = Gateway::new(
            GatewayConfig::default(),
            &components,
            retriever.clone(),
            Arc::new(ScriptedGenerator::default()),
        );

        gateway.ask("abuser", ChatRequest::new("q1")).await.unwrap();
        let err = gateway.ask("abuser", ChatRequest::new("q2")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));
        assert!(err.retry_after().is_some());
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        // other callers are unaffected
        assert!(gateway.ask("someone-else", ChatRequest::new("q2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_generator_failure_surfaces_as_upstream_error() {
        let components = components(RateLimiterConfig::new());
        let gateway = Gateway::new(
            GatewayConfig::default(),
            &components,
            Arc::new(CountingRetriever::default()),
            Arc::new(FailingGenerator),
        );
        let err = gateway.ask("c", ChatRequest::new("q")).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamInference { .. }));
        assert_eq!(components.answer_cache.len(), 0);
    }

    #[tokio::test]
    async fn test_empty_question_is_invalid() {
        let f = fixture();
        assert!(matches!(
            f.gateway.ask("c", ChatRequest::new(" ")).await,
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_ask_stream_emits_fragments_then_end_and_records_turn() {
        let f = fixture();
        let mut stream = f
            .gateway
            .ask_stream("c", ChatRequest::new("dress code?"))
            .await
            .unwrap();

        let mut text = String::new();
        let mut terminal = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Fragment(piece) => text.push_str(&piece),
                other => terminal = Some(other),
            }
        }
        assert!(matches!(terminal, Some(StreamEvent::End)));
        assert_eq!(text, "streamed answer to 'dress code?'");
        assert_eq!(stream.sources().map(|s| s.len()), Some(2));

        let session = f.components.sessions.get(stream.session_id()).await.unwrap();
        assert_eq!(session.messages()[1].content(), text);
        // streaming never touches the answer cache
        assert_eq!(f.components.answer_cache.len(), 0);
    }
}
