//! # Graphyne Scheduler
//!
//! Distributed background-task scheduling for the Graphyne graph database
//! cluster: index rebuilds, analytic jobs and schema migrations are
//! submitted once and reliably executed across cooperating nodes,
//! surviving node crashes, master failover and partial persistence
//! failures.
//!
//! ## Features
//!
//! - Task lifecycle state machine with an explicit precedence order
//! - Leader-coordinated work assignment (master tick / worker tick)
//! - Crash recovery from the durable metadata store
//! - Node-aware cancellation with best-effort interrupts
//! - Bounded job pool plus a serialized store-access lane

pub mod config;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod task;

mod lane;
mod registry;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use job::{Job, JobContext, JobFactory};
pub use scheduler::TaskScheduler;
pub use status::{PENDING_STATUSES, TaskStatus};
pub use store::{Condition, FileTaskStore, MemoryTaskStore, PageToken, TaskPage, TaskStore};
pub use task::Task;
