//! Cluster member records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a cluster member.
pub type NodeId = String;

/// Role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// The single member authorized to assign work.
    Master,
    /// A member that executes assigned work (the master also executes).
    Worker,
}

/// Snapshot of one cluster member as seen by the load oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Member id.
    pub id: NodeId,
    /// Current role.
    pub role: ServerRole,
    /// Current scheduler-defined load.
    pub load: u64,
    /// Load ceiling for placement decisions.
    pub max_load: u64,
    /// Whether this member is a designated compute node.
    pub compute: bool,
    /// Last heartbeat time.
    pub heartbeat: DateTime<Utc>,
}

impl ServerInfo {
    /// Create a member record with default capacity.
    pub fn new(id: impl Into<NodeId>, role: ServerRole) -> Self {
        Self {
            id: id.into(),
            role,
            load: 0,
            max_load: default_max_load(),
            compute: false,
            heartbeat: Utc::now(),
        }
    }

    /// Set the load ceiling.
    pub fn with_max_load(mut self, max_load: u64) -> Self {
        self.max_load = max_load;
        self
    }

    /// Mark this member as a designated compute node.
    pub fn with_compute(mut self, compute: bool) -> Self {
        self.compute = compute;
        self
    }

    /// Whether this member can take the given placement right now.
    pub fn can_accept(&self, placement: &Placement) -> bool {
        if placement.computer && !self.compute {
            return false;
        }
        self.load.saturating_add(placement.load) <= self.max_load
    }
}

fn default_max_load() -> u64 {
    10_000
}

/// The placement-relevant slice of a task, handed to the oracle when it
/// picks a worker. The full task record stays with the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    /// Task id.
    pub task_id: Uuid,
    /// Scalar placement cost.
    pub load: u64,
    /// Restricted to a designated compute node.
    pub computer: bool,
}
