//! Streaming chat answers.

use crate::queue::{CancelHandle, FragmentStream, StreamEvent};
use crate::types::ScoredChunk;
use crate::Result;
use futures::stream::{FusedStream, Stream};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

/// A streaming answer: fragments as they are generated, then one terminal
/// `End` or `Error`. By the time `End` is yielded the turn is already
/// recorded in the session.
pub struct ChatStream {
    session_id: String,
    sources: Arc<OnceLock<Vec<ScoredChunk>>>,
    events: FragmentStream,
}

impl ChatStream {
    pub(crate) fn new(
        session_id: String,
        sources: Arc<OnceLock<Vec<ScoredChunk>>>,
        events: FragmentStream,
    ) -> Self {
        Self {
            session_id,
            sources,
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn task_id(&self) -> &str {
        self.events.id()
    }

    /// Context the answer is grounded on. Available once retrieval finished,
    /// which is before the first fragment.
    pub fn sources(&self) -> Option<&[ScoredChunk]> {
        self.sources.get().map(Vec::as_slice)
    }

    pub fn cancel(&self) -> bool {
        self.events.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.events.cancel_handle()
    }

    /// Drain into the full answer.
    pub async fn collect_text(self) -> Result<String> {
        self.events.collect_text().await
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl FusedStream for ChatStream {
    fn is_terminated(&self) -> bool {
        self.events.is_terminated()
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("session_id", &self.session_id)
            .field("events", &self.events)
            .finish()
    }
}
