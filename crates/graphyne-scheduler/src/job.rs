//! Job capability interface.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::registry::LiveTask;
use crate::task::Task;

/// A unit of work the scheduler can run.
///
/// Implementations report success through the returned payload and failure
/// through the error; the scheduler owns the status bookkeeping around the
/// call. Cancellation is delivered through [`JobContext::is_cancelled`] and
/// by dropping the running future; both are requests, not guarantees of an
/// immediate stop.
#[async_trait]
pub trait Job: Send + Sync {
    /// Execute the unit of work.
    async fn run(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;

    /// Best-effort cleanup hook, invoked when a cancellation arrives for a
    /// task with no live run on this node (for example after a restart).
    fn cancel(&self) {}

    /// Ephemeral jobs are never persisted and are not crash-recoverable;
    /// their creator must resubmit them on node loss.
    fn ephemeral(&self) -> bool {
        false
    }
}

/// Resolves a persisted task record back to runnable logic.
///
/// Restart recovery and post-restart cancellation go through here: the
/// record's `job_ref` is all that survives a crash.
pub trait JobFactory: Send + Sync {
    /// Build the job for the given record.
    fn create(&self, task: &Task) -> Result<Arc<dyn Job>, SchedulerError>;
}

/// Execution context handed to a running job.
#[derive(Clone)]
pub struct JobContext {
    live: Arc<LiveTask>,
}

impl JobContext {
    pub(crate) fn new(live: Arc<LiveTask>) -> Self {
        Self { live }
    }

    /// Snapshot of the task record.
    pub fn task(&self) -> Task {
        self.live.record.read().clone()
    }

    /// Task id.
    pub fn task_id(&self) -> Uuid {
        self.live.record.read().id
    }

    /// Whether cancellation has been requested; long-running jobs should
    /// poll this at safe points.
    pub fn is_cancelled(&self) -> bool {
        self.live.cancel.is_cancelled()
    }

    /// Report progress (0..=100) on the live record.
    pub fn set_progress(&self, progress: u32) {
        let mut record = self.live.record.write();
        record.progress = progress.min(100);
        record.updated_at = chrono::Utc::now();
    }
}
