//! Scheduler errors.

use thiserror::Error;
use uuid::Uuid;

use crate::status::TaskStatus;

/// Scheduler error types.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed or duplicate submission; nothing was persisted.
    #[error("Invalid task: {0}")]
    Validation(String),

    /// A master-only operation was attempted on a non-master node.
    #[error("Can't {op} task on non-master server")]
    Authority {
        /// The rejected operation.
        op: String,
    },

    /// The pending-task ceiling was exceeded.
    #[error("Pending tasks size {pending} has exceeded the max limit {max}")]
    Capacity {
        /// Pending count the submission would have produced.
        pending: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Unknown task id.
    #[error("Can't find task with id '{0}'")]
    NotFound(Uuid),

    /// Illegal lifecycle transition.
    #[error("Can't {op} task '{id}' in status {status:?}")]
    StateConflict {
        /// Task id.
        id: Uuid,
        /// The offending status.
        status: TaskStatus,
        /// The rejected operation.
        op: String,
    },

    /// Store adapter failure, wrapped and rethrown; the next tick or the
    /// caller retries.
    #[error("Failed to update/query task store: {0}")]
    Storage(String),

    /// A blocking wait helper ran out of time.
    #[error("{0}")]
    Timeout(String),

    /// The store lane was re-entered from its own worker.
    #[error("Task store access re-entered from the store worker itself")]
    SelfDeadlock,

    /// The scheduler was closed.
    #[error("Scheduler is closed")]
    Shutdown,
}

impl SchedulerError {
    /// Shorthand for a state-conflict error.
    pub fn conflict(id: Uuid, status: TaskStatus, op: impl Into<String>) -> Self {
        Self::StateConflict {
            id,
            status,
            op: op.into(),
        }
    }
}
