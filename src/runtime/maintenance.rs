//! Periodic sweeper for expired cache entries, idle buckets and sessions.

use crate::gateway::Components;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub retrieval_expired: usize,
    pub answer_expired: usize,
    pub idle_buckets: usize,
    pub expired_sessions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.retrieval_expired + self.answer_expired + self.idle_buckets + self.expired_sessions
    }
}

/// Run one sweep over every component. A failing session backend is logged
/// and does not stop the other sweeps.
pub async fn sweep(components: &Components) -> SweepReport {
    let mut report = SweepReport {
        retrieval_expired: components.retrieval_cache.purge_expired(),
        answer_expired: components.answer_cache.purge_expired(),
        idle_buckets: components.limiter.sweep_idle(),
        expired_sessions: 0,
    };
    match components.sessions.cleanup().await {
        Ok(n) => report.expired_sessions = n,
        Err(e) => warn!(backend = components.sessions.name(), error = %e, "session cleanup failed"),
    }
    if report.total() > 0 {
        info!(
            retrieval_expired = report.retrieval_expired,
            answer_expired = report.answer_expired,
            idle_buckets = report.idle_buckets,
            expired_sessions = report.expired_sessions,
            "maintenance sweep"
        );
    } else {
        debug!("maintenance sweep: nothing to remove");
    }
    report
}

/// Background task running [`sweep`] every `interval` until stopped.
pub struct Maintenance {
    stop: CancellationToken,
    task: JoinHandle<()>,
    interval: Duration,
}

impl Maintenance {
    pub fn spawn(components: Components, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&components).await;
                    }
                }
            }
            debug!("maintenance sweeper stopped");
        });
        info!(interval_ms = interval.as_millis() as u64, "maintenance sweeper started");
        Self {
            stop,
            task,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "maintenance sweeper ended abnormally");
        }
    }
}

impl std::fmt::Debug for Maintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maintenance")
            .field("interval", &self.interval)
            .field("running", &!self.task.is_finished())
            .finish()
    }
}
