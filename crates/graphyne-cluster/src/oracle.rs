//! Membership and load oracle interface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::server::{NodeId, Placement, ServerInfo, ServerRole};

/// Cluster membership and load oracle.
///
/// The scheduler consumes this interface; membership maintenance, leader
/// election and heartbeating live behind it.
#[async_trait]
pub trait ServerOracle: Send + Sync {
    /// Id of the local node.
    fn self_node_id(&self) -> NodeId;

    /// Whether the local node is currently the master.
    fn self_is_master(&self) -> bool;

    /// Whether the cluster currently has exactly one member.
    fn only_single_node(&self) -> bool;

    /// Point-in-time snapshot of all member records.
    async fn all_server_infos(&self) -> Vec<ServerInfo>;

    /// Pick an eligible worker for the placement from the given snapshot,
    /// or `None` if no member can take it right now.
    fn pick_worker_node(&self, infos: &[ServerInfo], placement: &Placement) -> Option<NodeId>;

    /// Add load to a member's counters.
    async fn increase_load(&self, node: &NodeId, amount: u64);

    /// Release load from a member's counters (saturating).
    async fn decrease_load(&self, node: &NodeId, amount: u64);

    /// Durably replace the member records with the given snapshot.
    async fn update_server_infos(&self, infos: Vec<ServerInfo>);

    /// Signal the master that a task wants scheduling attention soon.
    /// Fire-and-forget; the periodic tick discovers the task regardless.
    fn notify_new_task(&self, task_id: Uuid);
}

/// In-memory oracle for tests and single-process embedding.
pub struct MemoryOracle {
    self_id: NodeId,
    master: AtomicBool,
    infos: RwLock<HashMap<NodeId, ServerInfo>>,
    notifications: AtomicU64,
}

impl MemoryOracle {
    /// Create an oracle for the given local node.
    pub fn new(self_id: impl Into<NodeId>, master: bool) -> Self {
        let self_id = self_id.into();
        let role = if master {
            ServerRole::Master
        } else {
            ServerRole::Worker
        };
        let mut infos = HashMap::new();
        infos.insert(self_id.clone(), ServerInfo::new(self_id.clone(), role));
        Self {
            self_id,
            master: AtomicBool::new(master),
            infos: RwLock::new(infos),
            notifications: AtomicU64::new(0),
        }
    }

    /// Create a single-node master oracle.
    pub fn single(self_id: impl Into<NodeId>) -> Self {
        Self::new(self_id, true)
    }

    /// Register another cluster member.
    pub fn add_server(&self, info: ServerInfo) {
        self.infos.write().insert(info.id.clone(), info);
    }

    /// Flip local mastership (demotion/promotion in tests).
    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }

    /// Number of wake-up notifications received so far.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Current load of one member, if known.
    pub fn load_of(&self, node: &NodeId) -> Option<u64> {
        self.infos.read().get(node).map(|info| info.load)
    }
}

#[async_trait]
impl ServerOracle for MemoryOracle {
    fn self_node_id(&self) -> NodeId {
        self.self_id.clone()
    }

    fn self_is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    fn only_single_node(&self) -> bool {
        self.infos.read().len() <= 1
    }

    async fn all_server_infos(&self) -> Vec<ServerInfo> {
        let mut infos: Vec<ServerInfo> = self.infos.read().values().cloned().collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn pick_worker_node(&self, infos: &[ServerInfo], placement: &Placement) -> Option<NodeId> {
        infos
            .iter()
            .filter(|info| info.can_accept(placement))
            .min_by_key(|info| info.load)
            .map(|info| info.id.clone())
    }

    async fn increase_load(&self, node: &NodeId, amount: u64) {
        if let Some(info) = self.infos.write().get_mut(node) {
            info.load = info.load.saturating_add(amount);
        }
    }

    async fn decrease_load(&self, node: &NodeId, amount: u64) {
        if let Some(info) = self.infos.write().get_mut(node) {
            info.load = info.load.saturating_sub(amount);
        }
    }

    async fn update_server_infos(&self, infos: Vec<ServerInfo>) {
        let mut map = self.infos.write();
        for mut info in infos {
            info.heartbeat = Utc::now();
            map.insert(info.id.clone(), info);
        }
    }

    fn notify_new_task(&self, task_id: Uuid) {
        debug!("notified of task '{}'", task_id);
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }
}
