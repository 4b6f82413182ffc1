//! The chat flow: admission, caches, queue, session bookkeeping.

use super::collaborators::{GenerationRequest, Generator, Retriever};
use super::model::{ChatRequest, ChatResponse};
use super::stream::ChatStream;
use crate::cache::{answer_key, AnswerCache, RetrievalCache, RetrievalKey};
use crate::queue::{CancellationToken, FragmentSink, InferenceQueue};
use crate::resilience::RateLimiter;
use crate::session::SessionStore;
use crate::types::{Message, ScoredChunk};
use crate::{BoxError, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Tunables of the chat flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Chunks requested from the retriever per question.
    pub retriever_k: usize,
    /// Past messages handed to the generator.
    pub history_window: usize,
    /// Characters of each source kept in responses.
    pub source_preview_chars: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retriever_k: 4,
            history_window: 10,
            source_preview_chars: 200,
        }
    }
}

/// Shared admission state the gateway composes. Built once and handed out
/// by reference count.
#[derive(Clone)]
pub struct Components {
    pub limiter: Arc<RateLimiter>,
    pub retrieval_cache: Arc<RetrievalCache>,
    pub answer_cache: Arc<AnswerCache>,
    pub sessions: Arc<dyn SessionStore>,
    pub queue: Arc<InferenceQueue>,
}

/// What a queued job needs; cloned into each job.
#[derive(Clone)]
struct Backends {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    retrieval_cache: Arc<RetrievalCache>,
    answer_cache: Arc<AnswerCache>,
    sessions: Arc<dyn SessionStore>,
}

impl Backends {
    async fn context(
        &self,
        key: RetrievalKey,
        question: &str,
        prefetched: Option<Vec<ScoredChunk>>,
    ) -> std::result::Result<Vec<ScoredChunk>, BoxError> {
        if let Some(chunks) = prefetched {
            return Ok(chunks);
        }
        // another task may have filled it while this one was queued
        if let Some(chunks) = self.retrieval_cache.get(&key) {
            return Ok(chunks);
        }
        let chunks = self
            .retriever
            .retrieve_scoped(question, key.k, key.scope.as_deref())
            .await?;
        debug!(key = %key, chunks = chunks.len(), "retrieval cache filled");
        self.retrieval_cache.put(key, chunks.clone());
        Ok(chunks)
    }

    async fn record_turn(&self, session_id: &str, question: &str, answer: &str) -> Result<()> {
        self.sessions
            .append_message(session_id, Message::user(question))
            .await?;
        self.sessions
            .append_message(session_id, Message::assistant(answer))
            .await?;
        Ok(())
    }
}

struct Answer {
    text: String,
    chunks: Vec<ScoredChunk>,
    cached: bool,
}

/// Non-streaming job: context, answer cache, generation.
struct AnswerJob {
    backends: Backends,
    key: RetrievalKey,
    question: String,
    history: Vec<Message>,
    prefetched: Option<Vec<ScoredChunk>>,
}

impl AnswerJob {
    async fn run(self, cancel: CancellationToken) -> std::result::Result<Answer, BoxError> {
        let chunks = self
            .backends
            .context(self.key, &self.question, self.prefetched)
            .await?;

        // Answers depend on history, so only fresh conversations share them.
        let fresh = self.history.is_empty();
        let cache_key = answer_key(&self.question, &chunks);
        if fresh {
            if let Some(text) = self.backends.answer_cache.get(&cache_key) {
                return Ok(Answer {
                    text,
                    chunks,
                    cached: true,
                });
            }
        }
        if cancel.is_cancelled() {
            return Err("cancelled before generation".into());
        }

        let text = self
            .backends
            .generator
            .generate(GenerationRequest {
                question: self.question,
                context: chunks.clone(),
                history: self.history,
            })
            .await?;
        if fresh {
            self.backends.answer_cache.put(cache_key, text.clone());
        }
        Ok(Answer {
            text,
            chunks,
            cached: false,
        })
    }
}

/// Streaming job: context, fragments, then the session record.
struct StreamJob {
    backends: Backends,
    key: RetrievalKey,
    question: String,
    history: Vec<Message>,
    prefetched: Option<Vec<ScoredChunk>>,
    session_id: String,
    sources: Arc<OnceLock<Vec<ScoredChunk>>>,
    preview_chars: usize,
}

impl StreamJob {
    async fn run(
        self,
        sink: FragmentSink,
        cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError> {
        let chunks = self
            .backends
            .context(self.key, &self.question, self.prefetched)
            .await?;
        let _ = self.sources.set(previews(&chunks, self.preview_chars));

        let mut fragments = self
            .backends
            .generator
            .generate_stream(GenerationRequest {
                question: self.question.clone(),
                context: chunks,
                history: self.history,
            })
            .await?;

        let mut answer = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if cancel.is_cancelled() {
                return Err("stream cancelled".into());
            }
            answer.push_str(&fragment);
            if !sink.send(fragment) {
                return Err("stream reader went away".into());
            }
        }

        self.backends
            .record_turn(&self.session_id, &self.question, &answer)
            .await?;
        Ok(())
    }
}

fn previews(chunks: &[ScoredChunk], max_chars: usize) -> Vec<ScoredChunk> {
    chunks
        .iter()
        .map(|c| ScoredChunk {
            content: c.preview(max_chars),
            ..c.clone()
        })
        .collect()
}

/// Entry point for chat requests.
///
/// Each request passes the caller's rate limit, resumes or starts a session,
/// and is answered from the caches when possible. Everything else goes
/// through the inference queue, so backend load stays bounded no matter how
/// many callers arrive.
pub struct Gateway {
    config: GatewayConfig,
    limiter: Arc<RateLimiter>,
    queue: Arc<InferenceQueue>,
    backends: Backends,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        components: &Components,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            config,
            limiter: components.limiter.clone(),
            queue: components.queue.clone(),
            backends: Backends {
                retriever,
                generator,
                retrieval_cache: components.retrieval_cache.clone(),
                answer_cache: components.answer_cache.clone(),
                sessions: components.sessions.clone(),
            },
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.backends.sessions
    }

    /// Forget every cached search result. Call it after documents are added
    /// to or removed from the index; answers keyed on the old context stop
    /// matching once retrieval returns the new chunks.
    pub fn invalidate_retrieval(&self) -> usize {
        let dropped = self.backends.retrieval_cache.clear();
        info!(dropped, "retrieval cache invalidated");
        dropped
    }

    /// Answer one question.
    pub async fn ask(&self, client_key: &str, request: ChatRequest) -> Result<ChatResponse> {
        request.validate()?;
        self.limiter.check(client_key)?;

        let session = self
            .backends
            .sessions
            .get_or_create(request.session_id.as_deref())
            .await?;
        let session_id = session.id().to_owned();
        let history = session.recent_messages(self.config.history_window).to_vec();
        let key = request.retrieval_key(self.config.retriever_k);
        let prefetched = self.backends.retrieval_cache.get(&key);

        if history.is_empty() {
            if let Some(chunks) = &prefetched {
                let cached = self
                    .backends
                    .answer_cache
                    .get(&answer_key(&request.question, chunks));
                if let Some(answer) = cached {
                    info!(session_id = %session_id, "answer served from cache");
                    self.backends
                        .record_turn(&session_id, &request.question, &answer)
                        .await?;
                    let sources = previews(chunks, self.config.source_preview_chars);
                    return Ok(ChatResponse::new(answer, session_id, sources, true));
                }
            }
        }

        let job = AnswerJob {
            backends: self.backends.clone(),
            key,
            question: request.question.clone(),
            history,
            prefetched,
        };
        let answer = self.queue.run(move |cancel| job.run(cancel)).await?;

        self.backends
            .record_turn(&session_id, &request.question, &answer.text)
            .await?;
        info!(
            session_id = %session_id,
            sources = answer.chunks.len(),
            cached = answer.cached,
            "answer delivered"
        );
        let sources = previews(&answer.chunks, self.config.source_preview_chars);
        Ok(ChatResponse::new(
            answer.text,
            session_id,
            sources,
            answer.cached,
        ))
    }

    /// Answer one question incrementally. Admission errors (rate limit, full
    /// queue, bad session backend) are returned here; generation errors
    /// arrive as the stream's terminal `Error`.
    pub async fn ask_stream(&self, client_key: &str, request: ChatRequest) -> Result<ChatStream> {
        request.validate()?;
        self.limiter.check(client_key)?;

        let session = self
            .backends
            .sessions
            .get_or_create(request.session_id.as_deref())
            .await?;
        let session_id = session.id().to_owned();
        let history = session.recent_messages(self.config.history_window).to_vec();
        let key = request.retrieval_key(self.config.retriever_k);
        let prefetched = self.backends.retrieval_cache.get(&key);
        let sources = Arc::new(OnceLock::new());

        let job = StreamJob {
            backends: self.backends.clone(),
            key,
            question: request.question,
            history,
            prefetched,
            session_id: session_id.clone(),
            sources: sources.clone(),
            preview_chars: self.config.source_preview_chars,
        };
        let events = self
            .queue
            .submit_stream(move |sink, cancel| job.run(sink, cancel))?;
        info!(session_id = %session_id, task_id = events.id(), "streaming answer queued");
        Ok(ChatStream::new(session_id, sources, events))
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("sessions", &self.backends.sessions.name())
            .finish()
    }
}
