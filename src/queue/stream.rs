//! Streaming delivery: fragments pushed by a job, read by the caller as a
//! finite stream that always ends with exactly one terminal marker.

use super::inference::QueueInner;
use super::task::{CancelHandle, Settle, TaskCore, TaskState};
use crate::{Error, Result};
use futures::stream::{FusedStream, Stream};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::time::Sleep;

/// One item of a [`FragmentStream`].
#[derive(Debug)]
pub enum StreamEvent {
    /// A piece of generated text.
    Fragment(String),
    /// Normal end of generation.
    End,
    /// The task failed, timed out, was cancelled or the queue shut down.
    Error(Error),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment(_))
    }
}

pub(crate) struct StreamResponder {
    core: Arc<TaskCore>,
    tx: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
}

impl StreamResponder {
    pub(crate) fn new(core: Arc<TaskCore>, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            core,
            tx: Mutex::new(Some(tx)),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<StreamEvent>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, fragment: String) -> bool {
        match self.sender().as_ref() {
            Some(tx) => tx.send(StreamEvent::Fragment(fragment)).is_ok(),
            None => false,
        }
    }

    /// Send the terminal marker and close the channel, unless the task
    /// already ended. Fragments pushed afterwards are dropped.
    fn terminate(&self, state: TaskState, event: StreamEvent) -> bool {
        let mut tx = self.sender();
        if !self.core.finish(state) {
            return false;
        }
        if let Some(tx) = tx.take() {
            let _ = tx.send(event);
        }
        true
    }

    pub(crate) fn end(&self, result: Result<()>) -> bool {
        match result {
            Ok(()) => self.terminate(TaskState::Completed, StreamEvent::End),
            Err(e) => self.terminate(TaskState::Failed, StreamEvent::Error(e)),
        }
    }
}

impl Settle for StreamResponder {
    fn fail(&self, state: TaskState, error: Error) -> bool {
        self.terminate(state, StreamEvent::Error(error))
    }
}

/// Producer half handed to a streaming job.
#[derive(Clone)]
pub struct FragmentSink {
    responder: Arc<StreamResponder>,
}

impl FragmentSink {
    pub(crate) fn new(responder: Arc<StreamResponder>) -> Self {
        Self { responder }
    }

    /// Push a fragment. Returns false once the task has ended or the reader
    /// went away, which a job can treat as a signal to stop producing.
    pub fn send(&self, fragment: impl Into<String>) -> bool {
        self.responder.push(fragment.into())
    }

    pub fn is_closed(&self) -> bool {
        self.responder.core.state().is_terminal()
    }
}

/// Caller half of a streaming task.
///
/// Yields `Fragment`s followed by exactly one `End` or `Error`, then `None`.
/// Dropping the stream before the terminal marker cancels the task.
pub struct FragmentStream {
    core: Arc<TaskCore>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    queue: Arc<QueueInner>,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
    finished: bool,
}

impl FragmentStream {
    pub(crate) fn new(
        core: Arc<TaskCore>,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        queue: Arc<QueueInner>,
    ) -> Self {
        let deadline = Box::pin(tokio::time::sleep_until(core.deadline));
        Self {
            core,
            rx,
            queue,
            deadline,
            expired: false,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn cancel(&self) -> bool {
        self.queue.cancel(&self.core)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.core.clone(), self.queue.clone())
    }

    /// Drain the stream into the full text, or the error that ended it.
    pub async fn collect_text(mut self) -> Result<String> {
        use futures::StreamExt;
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Fragment(f) => text.push_str(&f),
                StreamEvent::End => return Ok(text),
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Err(Error::QueueClosed)
    }
}

impl Stream for FragmentStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    this.finished = event.is_terminal();
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => {
                    // producer vanished without a terminal marker
                    this.finished = true;
                    return Poll::Ready(Some(StreamEvent::Error(Error::QueueClosed)));
                }
                Poll::Pending => {}
            }
            if this.expired {
                return Poll::Pending;
            }
            match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.expired = true;
                    this.queue.expire(&this.core);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl FusedStream for FragmentStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.cancel(&self.core);
        }
    }
}

impl std::fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStream")
            .field("id", &self.core.id)
            .field("finished", &self.finished)
            .finish()
    }
}
