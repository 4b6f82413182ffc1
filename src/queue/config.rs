//! Queue configuration and statistics.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::task::TaskState;

/// Bounds of the inference queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Execution slots, one worker each.
    pub max_concurrent: usize,
    /// Admitted tasks (pending plus running) beyond which `submit` rejects.
    pub max_size: usize,
    /// Bound on a task's total time in the system, queued plus running.
    #[serde(with = "crate::utils::duration_secs")]
    pub task_timeout: Duration,
    /// Whether a timed-out or cancelled job is aborted at its next await
    /// point. When false the job runs to completion and its result is
    /// discarded; the slot stays occupied until then.
    pub interruptible: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_size: 50,
            task_timeout: Duration::from_secs(120),
            interruptible: true,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: String| -> Result<()> {
            Err(Error::configuration_with_context(
                format!("invalid queue configuration: {}", field),
                ErrorContext::new()
                    .with_field_path(format!("queue.{}", field))
                    .with_details(details)
                    .with_source("queue_config"),
            ))
        };
        if self.max_concurrent == 0 {
            return invalid("max_concurrent", "must be at least 1".into());
        }
        if self.max_size < self.max_concurrent {
            return invalid(
                "max_size",
                format!(
                    "must be >= max_concurrent ({}), got {}",
                    self.max_concurrent, self.max_size
                ),
            );
        }
        if self.task_timeout.is_zero() {
            return invalid("task_timeout", "must be greater than zero".into());
        }
        Ok(())
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub max_size: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Tasks currently holding admission (pending plus running).
    pub fn occupancy(&self) -> usize {
        self.pending + self.running
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a task reaching `state`. Non-terminal states are ignored.
    pub(crate) fn record(&self, state: TaskState) {
        let counter = match state {
            TaskState::Rejected => &self.rejected,
            TaskState::Completed => &self.completed,
            TaskState::Failed => &self.failed,
            TaskState::TimedOut => &self.timed_out,
            TaskState::Cancelled => &self.cancelled,
            TaskState::Pending | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut QueueStats) {
        stats.submitted = self.submitted.load(Ordering::Relaxed);
        stats.rejected = self.rejected.load(Ordering::Relaxed);
        stats.completed = self.completed.load(Ordering::Relaxed);
        stats.failed = self.failed.load(Ordering::Relaxed);
        stats.timed_out = self.timed_out.load(Ordering::Relaxed);
        stats.cancelled = self.cancelled.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(QueueConfig::new().with_max_concurrent(0).validate().is_err());
        let err = QueueConfig::new()
            .with_max_concurrent(4)
            .with_max_size(2)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("queue.max_size")
        );
        assert!(QueueConfig::new()
            .with_task_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_counters_ignore_live_states() {
        let counters = QueueCounters::default();
        counters.record(TaskState::Running);
        counters.record(TaskState::Completed);
        counters.record(TaskState::Rejected);
        let mut stats = QueueStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_yaml_durations() {
        let cfg: QueueConfig =
            serde_yaml::from_str("max_concurrent: 3\ntask_timeout: 2.5").unwrap();
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.max_size, 50);
        assert_eq!(cfg.task_timeout, Duration::from_millis(2500));
    }
}
