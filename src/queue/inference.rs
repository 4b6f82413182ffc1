//! Bounded FIFO worker pool in front of the inference backend.

use super::config::{QueueConfig, QueueCounters, QueueStats};
use super::stream::{FragmentSink, FragmentStream, StreamResponder};
use super::task::{Responder, Settle, TaskCore, TaskHandle, TaskState};
use crate::{BoxError, Error, Result};
use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hands a finished job's outcome to its caller. The worker calls it only
/// after the slot is released.
type Delivery = Box<dyn FnOnce() + Send>;

/// An admitted task waiting for a slot.
struct QueuedTask {
    core: Arc<TaskCore>,
    run: BoxFuture<'static, Delivery>,
    settle: Arc<dyn Settle>,
}

struct QueueState {
    pending: VecDeque<QueuedTask>,
    running: usize,
    closed: bool,
}

enum Next {
    Task(QueuedTask),
    Idle,
    Closed,
}

/// Bookkeeping shared by the queue, its workers and every outstanding handle.
pub(crate) struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    counters: Arc<QueueCounters>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, task: QueuedTask) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::QueueClosed);
        }
        let occupancy = state.pending.len() + state.running;
        if occupancy >= self.config.max_size {
            drop(state);
            task.core.finish(TaskState::Rejected);
            warn!(
                task_id = %task.core.id,
                occupancy,
                max_size = self.config.max_size,
                "inference queue full, task rejected"
            );
            return Err(Error::QueueFull {
                capacity: self.config.max_size,
            });
        }
        debug!(task_id = %task.core.id, position = state.pending.len(), "task queued");
        state.pending.push_back(task);
        drop(state);
        self.counters.submitted();
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the oldest runnable task and claim a slot for it. Tasks whose
    /// deadline passed while queued are settled here instead of run.
    fn next(&self) -> Next {
        let mut state = self.lock();
        while let Some(task) = state.pending.pop_front() {
            if tokio::time::Instant::now() >= task.core.deadline {
                task.settle.fail(TaskState::TimedOut, task.core.timeout_error());
                continue;
            }
            if !task.core.start() {
                continue;
            }
            state.running += 1;
            return Next::Task(task);
        }
        if state.closed {
            Next::Closed
        } else {
            Next::Idle
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
    }

    fn take_pending(&self, core: &TaskCore) -> Option<QueuedTask> {
        let mut state = self.lock();
        let pos = state.pending.iter().position(|t| t.core.id == core.id)?;
        state.pending.remove(pos)
    }

    pub(crate) fn cancel(&self, core: &TaskCore) -> bool {
        if let Some(task) = self.take_pending(core) {
            info!(task_id = %core.id, "pending task cancelled");
            return task.settle.fail(TaskState::Cancelled, core.cancelled_error());
        }
        if core.state() == TaskState::Running {
            info!(task_id = %core.id, "cancellation requested for running task");
            core.token.cancel();
            return true;
        }
        false
    }

    /// Time out a task that is still queued. Running tasks are timed out by
    /// the worker that owns them.
    pub(crate) fn expire(&self, core: &TaskCore) {
        if let Some(task) = self.take_pending(core) {
            warn!(task_id = %core.id, "task timed out while queued");
            task.settle.fail(TaskState::TimedOut, core.timeout_error());
        }
    }

    /// Stop admitting and fail everything still queued.
    fn close(&self) {
        let drained: Vec<QueuedTask> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.drain(..).collect()
        };
        for task in &drained {
            task.settle.fail(TaskState::Cancelled, Error::QueueClosed);
        }
        info!(failed_pending = drained.len(), "inference queue closed");
        self.notify.notify_waiters();
    }

    async fn execute(&self, task: QueuedTask) {
        let QueuedTask { core, run, settle } = task;
        if core.token.is_cancelled() {
            self.release();
            settle.fail(TaskState::Cancelled, core.cancelled_error());
            return;
        }

        // Own task so a panicking job takes down only itself.
        let mut join = tokio::spawn(run);
        let (state, error) = tokio::select! {
            biased;
            _ = core.token.cancelled() => (TaskState::Cancelled, core.cancelled_error()),
            _ = tokio::time::sleep_until(core.deadline) => (TaskState::TimedOut, core.timeout_error()),
            joined = &mut join => {
                // Free the slot before the caller can see the outcome.
                self.release();
                settle_join(&core, settle.as_ref(), joined);
                return;
            }
        };

        if self.config.interruptible {
            join.abort();
            discard(&core, join.await);
            self.release();
            if settle.fail(state, error) && state == TaskState::TimedOut {
                warn!(task_id = %core.id, interruptible = true, "running task timed out");
            }
        } else {
            if settle.fail(state, error) && state == TaskState::TimedOut {
                warn!(task_id = %core.id, interruptible = false, "running task timed out");
            }
            // The slot is held until the job is actually gone.
            discard(&core, join.await);
            self.release();
        }
    }
}

fn settle_join(
    core: &TaskCore,
    settle: &dyn Settle,
    joined: std::result::Result<Delivery, JoinError>,
) {
    match joined {
        Ok(deliver) => deliver(),
        Err(e) if e.is_panic() => {
            warn!(task_id = %core.id, "inference job panicked");
            let source: BoxError = "inference job panicked".into();
            settle.fail(TaskState::Failed, Error::upstream(core.id.clone(), source));
        }
        Err(_) => {
            settle.fail(TaskState::Cancelled, core.cancelled_error());
        }
    }
}

/// Drop the outcome of an interrupted job; its task settles elsewhere.
fn discard(core: &TaskCore, joined: std::result::Result<Delivery, JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!(task_id = %core.id, "discarded job panicked");
        }
    }
}

async fn worker_loop(inner: Arc<QueueInner>, worker: usize) {
    debug!(worker, "queue worker started");
    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a submit in between is not missed.
        notified.as_mut().enable();
        match inner.next() {
            Next::Task(task) => inner.execute(task).await,
            Next::Idle => notified.await,
            Next::Closed => break,
        }
    }
    debug!(worker, "queue worker stopped");
}

/// Bounded-concurrency scheduler for slow inference jobs.
///
/// Exactly `max_concurrent` workers drain a single FIFO. Admission counts
/// pending plus running tasks against `max_size` and rejects synchronously
/// with [`Error::QueueFull`] when there is no room.
///
/// ```rust,no_run
/// use rag_gate::queue::{InferenceQueue, QueueConfig};
///
/// # async fn demo() -> rag_gate::Result<()> {
/// let queue = InferenceQueue::new(QueueConfig::new().with_max_concurrent(2))?;
/// let handle = queue.submit(|_cancel| async { Ok::<_, rag_gate::BoxError>("answer") })?;
/// assert_eq!(handle.await?, "answer");
/// queue.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct InferenceQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceQueue {
    /// Validate `config` and start the workers. Must be called inside a tokio
    /// runtime.
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(config.max_size),
                running: 0,
                closed: false,
            }),
            notify: Notify::new(),
            counters: Arc::new(QueueCounters::default()),
            config,
        });
        let workers = (0..inner.config.max_concurrent)
            .map(|worker| tokio::spawn(worker_loop(inner.clone(), worker)))
            .collect();
        info!(
            max_concurrent = inner.config.max_concurrent,
            max_size = inner.config.max_size,
            task_timeout_ms = inner.config.task_timeout.as_millis() as u64,
            "inference queue started"
        );
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    fn new_core(&self) -> Arc<TaskCore> {
        Arc::new(TaskCore::new(
            self.inner.config.task_timeout,
            self.inner.counters.clone(),
        ))
    }

    /// Admit a job. The job receives a token it may poll between steps to
    /// notice cancellation.
    pub fn submit<T, E, F, Fut>(&self, job: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let core = self.new_core();
        let (tx, rx) = oneshot::channel();
        let responder = Arc::new(Responder::new(core.clone(), tx));

        let run = {
            let responder = responder.clone();
            let core = core.clone();
            async move {
                let outcome = job(core.token.clone()).await.map_err(Into::<BoxError>::into);
                Box::new(move || {
                    // whatever a job returns after cancellation counts as cancelled
                    if core.token.is_cancelled() {
                        responder.fail(TaskState::Cancelled, core.cancelled_error());
                        return;
                    }
                    match outcome {
                        Ok(value) => responder.deliver(TaskState::Completed, Ok(value)),
                        Err(e) => {
                            warn!(task_id = %core.id, error = %e, "inference job failed");
                            responder.deliver(
                                TaskState::Failed,
                                Err(Error::upstream(core.id.clone(), e)),
                            )
                        }
                    };
                }) as Delivery
            }
            .boxed()
        };

        self.inner.admit(QueuedTask {
            core: core.clone(),
            run,
            settle: responder,
        })?;
        Ok(TaskHandle::new(core, rx, self.inner.clone()))
    }

    /// Admit a job and wait for its result.
    pub async fn run<T, E, F, Fut>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        self.submit(job)?.wait().await
    }

    /// Admit a job that produces text incrementally through a
    /// [`FragmentSink`]. Its `Ok` return ends the stream with `End`, an `Err`
    /// with `Error`.
    pub fn submit_stream<E, F, Fut>(&self, job: F) -> Result<FragmentStream>
    where
        E: Into<BoxError>,
        F: FnOnce(FragmentSink, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    {
        let core = self.new_core();
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = Arc::new(StreamResponder::new(core.clone(), tx));

        let run = {
            let responder = responder.clone();
            let sink = FragmentSink::new(responder.clone());
            let core = core.clone();
            async move {
                let outcome = job(sink, core.token.clone()).await.map_err(Into::<BoxError>::into);
                Box::new(move || {
                    if core.token.is_cancelled() {
                        responder.fail(TaskState::Cancelled, core.cancelled_error());
                        return;
                    }
                    let result = outcome.map_err(|e| {
                        warn!(task_id = %core.id, error = %e, "streaming job failed");
                        Error::upstream(core.id.clone(), e)
                    });
                    responder.end(result);
                }) as Delivery
            }
            .boxed()
        };

        self.inner.admit(QueuedTask {
            core: core.clone(),
            run,
            settle: responder,
        })?;
        Ok(FragmentStream::new(core, rx, self.inner.clone()))
    }

    pub fn stats(&self) -> QueueStats {
        let (pending, running) = {
            let state = self.inner.lock();
            (state.pending.len(), state.running)
        };
        let mut stats = QueueStats {
            pending,
            running,
            max_concurrent: self.inner.config.max_concurrent,
            max_size: self.inner.config.max_size,
            ..QueueStats::default()
        };
        self.inner.counters.fill(&mut stats);
        stats
    }

    /// Whether the next `submit` would be rejected for lack of room.
    pub fn is_full(&self) -> bool {
        let state = self.inner.lock();
        state.pending.len() + state.running >= self.inner.config.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Stop admitting, fail queued tasks with [`Error::QueueClosed`], let
    /// running jobs finish and join the workers.
    pub async fn shutdown(&self) {
        self.inner.close();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "queue worker ended abnormally");
            }
        }
    }
}

impl Drop for InferenceQueue {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for InferenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceQueue")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(max_concurrent: usize, max_size: usize) -> InferenceQueue {
        InferenceQueue::new(
            QueueConfig::new()
                .with_max_concurrent(max_concurrent)
                .with_max_size(max_size)
                .with_task_timeout(Duration::from_secs(30)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let q = queue(1, 4);
        let handle = q
            .submit(|_| async { Ok::<_, BoxError>(21 * 2) })
            .unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(q.stats().completed, 1);
        assert_eq!(q.stats().submitted, 1);
    }

    #[tokio::test]
    async fn test_job_error_becomes_upstream_inference() {
        let q = queue(1, 4);
        let err = q
            .run(|_| async { Err::<(), _>("vector store unreachable") })
            .await
            .unwrap_err();
        match err {
            Error::UpstreamInference { message, .. } => {
                assert_eq!(message, "vector store unreachable")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(q.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_job_fails_only_itself() {
        let q = queue(1, 4);
        let bad = q
            .submit(|_| async {
                if true {
                    panic!("boom");
                }
                Ok::<(), BoxError>(())
            })
            .unwrap();
        let good = q.submit(|_| async { Ok::<_, BoxError>("still serving") }).unwrap();

        assert!(matches!(bad.await, Err(Error::UpstreamInference { .. })));
        assert_eq!(good.await.unwrap(), "still serving");
    }

    #[tokio::test]
    async fn test_huge_task_timeout_means_no_deadline() {
        let q = InferenceQueue::new(
            QueueConfig::new().with_task_timeout(Duration::from_secs_f64(1.0e19)),
        )
        .unwrap();
        assert_eq!(q.run(|_| async { Ok::<_, BoxError>("ok") }).await.unwrap(), "ok");
        let text = q
            .submit_stream(|sink, _| async move {
                sink.send("ok");
                Ok::<_, BoxError>(())
            })
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "ok");
        q.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        assert!(matches!(
            InferenceQueue::new(QueueConfig::new().with_max_concurrent(0)),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let q = queue(1, 4);
        q.shutdown().await;
        assert!(q.is_closed());
        assert!(matches!(
            q.submit(|_| async { Ok::<_, BoxError>(()) }),
            Err(Error::QueueClosed)
        ));
    }
}
