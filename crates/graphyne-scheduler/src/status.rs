//! Task lifecycle status and its transition rules.

use serde::{Deserialize, Serialize};

/// Task lifecycle status.
///
/// Statuses carry an explicit precedence code; a task normally only moves
/// to a higher code. The two exceptions are the restart path (RUNNING or
/// QUEUED back to RESTORING) and cancellation, which may cut a lifecycle
/// short from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet classified; never persisted by the scheduler.
    Unknown,
    /// Freshly created, not yet submitted.
    New,
    /// Durably recorded, waiting for the master to pick a worker.
    Scheduling,
    /// Assigned to a worker, waiting for that worker to pick it up.
    Scheduled,
    /// Accepted by the owning node's local queue.
    Queued,
    /// Re-submitted by restart recovery.
    Restoring,
    /// Executing.
    Running,
    /// Finished successfully (terminal).
    Success,
    /// Cancellation requested, owner has not confirmed yet.
    Cancelling,
    /// Cancelled (terminal).
    Cancelled,
    /// Failed (terminal).
    Failed,
}

/// Statuses a node must recover after a restart, scanned in this order.
pub const PENDING_STATUSES: [TaskStatus; 3] = [
    TaskStatus::Restoring,
    TaskStatus::Running,
    TaskStatus::Queued,
];

impl TaskStatus {
    /// Precedence code.
    pub fn code(self) -> u8 {
        match self {
            TaskStatus::Unknown => 0,
            TaskStatus::New => 1,
            TaskStatus::Scheduling => 2,
            TaskStatus::Scheduled => 3,
            TaskStatus::Queued => 4,
            TaskStatus::Restoring => 5,
            TaskStatus::Running => 6,
            TaskStatus::Success => 7,
            TaskStatus::Cancelling => 8,
            TaskStatus::Cancelled => 9,
            TaskStatus::Failed => 10,
        }
    }

    /// Whether this status ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    /// Whether a restarted owner must recover a task in this status.
    pub fn is_pending(self) -> bool {
        PENDING_STATUSES.contains(&self)
    }

    /// Whether the lifecycle may move from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match next {
            // Initial statuses are never re-entered.
            Unknown | New => false,
            Scheduling => matches!(self, New),
            Scheduled => matches!(self, Scheduling),
            Queued => matches!(self, New | Scheduled),
            // Restart recovery; re-restoring an already RESTORING task is
            // the second-crash case.
            Restoring => matches!(self, Queued | Running | Restoring),
            Running => matches!(self, Queued | Restoring),
            Success => matches!(self, Running),
            // Dependency failures surface before RUNNING is reached.
            Failed => matches!(self, Queued | Restoring | Running),
            // Only once a worker owns the task; otherwise cancellation is
            // synchronous (straight to CANCELLED).
            Cancelling => {
                !self.is_terminal() && self != Cancelling && self.code() >= Scheduled.code()
            }
            Cancelled => !self.is_terminal(),
        }
    }

    /// Lower-case name, also used as the store index key.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Unknown => "unknown",
            TaskStatus::New => "new",
            TaskStatus::Scheduling => "scheduling",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Restoring => "restoring",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::New
    }
}
