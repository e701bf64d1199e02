//! Per-node map of live task instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::job::Job;
use crate::task::Task;

/// A task this node currently owns, with its cancellation handle.
pub(crate) struct LiveTask {
    /// Authoritative in-memory record while the task is live here.
    pub(crate) record: RwLock<Task>,
    /// Cancellation handle for the running future.
    pub(crate) cancel: CancellationToken,
    /// The runnable logic.
    pub(crate) job: Arc<dyn Job>,
    /// Never persisted; skip all store traffic for this task.
    pub(crate) ephemeral: bool,
    /// Force-deleted while live; the final save must not resurrect the
    /// store row.
    evicted: AtomicBool,
}

impl LiveTask {
    pub(crate) fn new(task: Task, job: Arc<dyn Job>) -> Arc<Self> {
        let ephemeral = job.ephemeral();
        Arc::new(Self {
            record: RwLock::new(task),
            cancel: CancellationToken::new(),
            job,
            ephemeral,
            evicted: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.record.read().id
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }
}

/// Registry of live tasks, scoped to one scheduler instance.
///
/// All mutation goes through the single mutex; the pending-task ceiling is
/// enforced at insert so a rejected submission leaves no trace.
pub(crate) struct TaskRegistry {
    inner: Mutex<HashMap<Uuid, Arc<LiveTask>>>,
}

impl TaskRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<Arc<LiveTask>> {
        self.inner.lock().get(&id).cloned()
    }

    /// Insert a live task, guarding against duplicates and the ceiling.
    pub(crate) fn insert(
        &self,
        live: Arc<LiveTask>,
        max_pending: usize,
    ) -> Result<(), SchedulerError> {
        let mut map = self.inner.lock();
        let id = live.id();
        if let Some(existing) = map.get(&id) {
            return Err(SchedulerError::conflict(
                id,
                existing.record.read().status,
                "submit duplicate",
            ));
        }
        let pending = map.len() + 1;
        if pending > max_pending {
            return Err(SchedulerError::Capacity {
                pending,
                max: max_pending,
            });
        }
        map.insert(id, live);
        Ok(())
    }

    pub(crate) fn remove(&self, id: Uuid) -> Option<Arc<LiveTask>> {
        self.inner.lock().remove(&id)
    }
}
