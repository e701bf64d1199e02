//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Graph this scheduler instance belongs to.
    #[serde(default = "default_graph")]
    pub graph: String,

    /// Maximum number of concurrently running jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    /// Ceiling on tasks pending on this node (queued plus running).
    #[serde(default = "default_max_pending_tasks")]
    pub max_pending_tasks: usize,

    /// Page size for store scans.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Period of the master/worker tick loop in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Poll interval of the blocking wait helpers in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_graph() -> String {
    "default".to_string()
}

fn default_max_workers() -> u32 {
    4
}

fn default_max_pending_tasks() -> usize {
    1000
}

fn default_page_size() -> usize {
    500
}

fn default_tick_interval() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    250
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            graph: default_graph(),
            max_workers: default_max_workers(),
            max_pending_tasks: default_max_pending_tasks(),
            page_size: default_page_size(),
            tick_interval_secs: default_tick_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}
