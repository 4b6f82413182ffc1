//! Task lifecycle, result delivery and the caller-side handle.

use super::config::QueueCounters;
use super::inference::QueueInner;
use crate::utils::instant_after;
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TaskId = String;

/// Lifecycle of one inference task.
///
/// `Pending -> Running -> {Completed, Failed, TimedOut}`, plus the early
/// exits `Pending -> {Rejected, Cancelled, TimedOut}` and
/// `Running -> Cancelled`. A terminal state never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    /// Refused at admission; `submit` reports it as [`Error::QueueFull`] and
    /// no handle is ever created.
    Rejected,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Cancelled => "cancelled",
            TaskState::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity, timing and state shared by the queue, the worker and the handle.
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) token: CancellationToken,
    state: Mutex<TaskState>,
    counters: Arc<QueueCounters>,
}

impl TaskCore {
    pub(crate) fn new(timeout: Duration, counters: Arc<QueueCounters>) -> Self {
        let enqueued_at = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            enqueued_at,
            deadline: instant_after(enqueued_at, timeout),
            token: CancellationToken::new(),
            state: Mutex::new(TaskState::Pending),
            counters,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    /// `Pending -> Running`. False when the task already left `Pending`.
    pub(crate) fn start(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != TaskState::Pending {
            return false;
        }
        *state = TaskState::Running;
        debug!(task_id = %self.id, state = %TaskState::Running, "task transition");
        true
    }

    /// Move to a terminal state. Only the first caller wins; the winner is the
    /// one that delivers the outcome.
    pub(crate) fn finish(&self, to: TaskState) -> bool {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return false;
        }
        *state = to;
        drop(state);
        self.counters.record(to);
        debug!(task_id = %self.id, state = %to, waited_ms = self.waited().as_millis() as u64, "task transition");
        true
    }

    pub(crate) fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub(crate) fn timeout_error(&self) -> Error {
        Error::QueueTimeout {
            task_id: self.id.clone(),
            waited: self.waited(),
        }
    }

    pub(crate) fn cancelled_error(&self) -> Error {
        Error::Cancelled {
            task_id: self.id.clone(),
        }
    }
}

/// Type-erased way for the queue to end a task it knows nothing about.
pub(crate) trait Settle: Send + Sync {
    /// Deliver a terminal error unless the task already finished.
    fn fail(&self, state: TaskState, error: Error) -> bool;
}

/// Single-shot result slot of a non-streaming task.
pub(crate) struct Responder<T> {
    core: Arc<TaskCore>,
    tx: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T: Send> Responder<T> {
    pub(crate) fn new(core: Arc<TaskCore>, tx: oneshot::Sender<Result<T>>) -> Self {
        Self {
            core,
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn deliver(&self, state: TaskState, result: Result<T>) -> bool {
        let mut tx = lock(&self.tx);
        if !self.core.finish(state) {
            return false;
        }
        if let Some(tx) = tx.take() {
            // receiver gone means the caller detached; nothing left to do
            let _ = tx.send(result);
        }
        true
    }
}

impl<T: Send> Settle for Responder<T> {
    fn fail(&self, state: TaskState, error: Error) -> bool {
        self.deliver(state, Err(error))
    }
}

/// Cloneable cancel switch detached from the result handle.
#[derive(Clone)]
pub struct CancelHandle {
    core: Arc<TaskCore>,
    queue: Arc<QueueInner>,
}

impl CancelHandle {
    pub(crate) fn new(core: Arc<TaskCore>, queue: Arc<QueueInner>) -> Self {
        Self { core, queue }
    }

    /// Cancel the task. A pending task is dropped from the queue; a running
    /// one gets its cancellation token set. Returns false once the task has
    /// already finished.
    pub fn cancel(&self) -> bool {
        self.queue.cancel(&self.core)
    }

    pub fn task_id(&self) -> &str {
        &self.core.id
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("task_id", &self.core.id)
            .finish()
    }
}

/// Caller side of a submitted task.
///
/// Await it (or call [`wait`](Self::wait)) for the result. Dropping the handle
/// detaches: the task still runs and its result is discarded.
pub struct TaskHandle<T> {
    core: Arc<TaskCore>,
    rx: oneshot::Receiver<Result<T>>,
    queue: Arc<QueueInner>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        core: Arc<TaskCore>,
        rx: oneshot::Receiver<Result<T>>,
        queue: Arc<QueueInner>,
    ) -> Self {
        Self { core, rx, queue }
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

    /// Wait for the outcome. Past the task deadline this resolves to
    /// [`Error::QueueTimeout`] even if the task never left the queue.
    pub async fn wait(mut self) -> Result<T> {
        match tokio::time::timeout_at(self.core.deadline, &mut self.rx).await {
            Ok(received) => received.unwrap_or(Err(Error::QueueClosed)),
            Err(_) => {
                // Settles a still-queued task; a running one is settled by
                // its worker at the same deadline.
                self.queue.expire(&self.core);
                (&mut self.rx).await.unwrap_or(Err(Error::QueueClosed))
            }
        }
    }
}

impl<T: Send + 'static> IntoFuture for TaskHandle<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}
