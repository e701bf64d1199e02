//! # Graphyne Cluster
//!
//! Membership and load oracle interface consumed by the task scheduler.
//!
//! The scheduler never talks to the consensus or heartbeat machinery
//! directly; it sees the cluster through [`ServerOracle`]: who the local
//! node is, who is master, the current member snapshot, and worker
//! selection for a task placement.

pub mod oracle;
pub mod server;

pub use oracle::{MemoryOracle, ServerOracle};
pub use server::{NodeId, Placement, ServerInfo, ServerRole};
