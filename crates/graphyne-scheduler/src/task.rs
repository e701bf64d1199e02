//! Task record.

use chrono::{DateTime, Utc};
use graphyne_cluster::{NodeId, Placement};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::status::TaskStatus;

/// A unit of background work as persisted in the metadata store.
///
/// Once a record is saved, the store copy is the source of truth; at most
/// one node holds an authoritative in-memory instance of a non-terminal
/// task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Cluster-unique task id.
    pub id: Uuid,
    /// Task type, e.g. `index-rebuild` or `schema-migration`.
    pub kind: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Owning node; unset until the master assigns one.
    pub server: Option<NodeId>,
    /// Times this task was re-submitted by restart recovery.
    pub retries: u32,
    /// Progress indication, 0..=100.
    pub progress: u32,
    /// Result payload once finished.
    pub result: Option<serde_json::Value>,
    /// Last failure message.
    pub error: Option<String>,
    /// Tasks that must reach SUCCESS before this one runs.
    pub depends_on: Vec<Uuid>,
    /// Restricted to a designated compute node.
    pub computer: bool,
    /// Scalar placement cost.
    pub load: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Opaque reference the job factory resolves to runnable logic.
    pub job_ref: String,
}

impl Task {
    /// Create a new task record.
    pub fn new(kind: impl Into<String>, job_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            status: TaskStatus::New,
            server: None,
            retries: 0,
            progress: 0,
            result: None,
            error: None,
            depends_on: Vec::new(),
            computer: false,
            load: 1,
            created_at: now,
            updated_at: now,
            job_ref: job_ref.into(),
        }
    }

    /// Require other tasks to succeed first.
    pub fn with_dependencies(mut self, depends_on: Vec<Uuid>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Restrict to a designated compute node.
    pub fn with_computer(mut self, computer: bool) -> Self {
        self.computer = computer;
        self
    }

    /// Set the placement cost.
    pub fn with_load(mut self, load: u64) -> Self {
        self.load = load;
        self
    }

    /// Whether the lifecycle has ended.
    pub fn completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// The placement-relevant slice handed to the oracle.
    pub fn placement(&self) -> Placement {
        Placement {
            task_id: self.id,
            load: self.load,
            computer: self.computer,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::conflict(
                self.id,
                self.status,
                format!("set status {next:?} on"),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
