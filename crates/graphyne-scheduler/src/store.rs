//! Metadata store adapter.
//!
//! The persistence engine itself is an external collaborator; the
//! scheduler sees it as opaque CRUD plus indexed, paginated queries. Two
//! adapters ship here: an in-memory one for tests and embedding, and a
//! JSON-file one organizing records into per-status directories.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use graphyne_cluster::NodeId;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::status::TaskStatus;
use crate::task::Task;

/// Opaque cursor into a paginated scan. Feeding a page's `next` token back
/// into the query resumes the scan after that page.
pub type PageToken = String;

/// One page of a restartable scan.
#[derive(Debug, Clone)]
pub struct TaskPage {
    /// Records in this page.
    pub tasks: Vec<Task>,
    /// Cursor for the next page, or `None` when the scan is exhausted.
    pub next: Option<PageToken>,
}

/// Field-equality condition for store queries.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Match the task type.
    Kind(String),
    /// Match the lifecycle status.
    Status(TaskStatus),
    /// Match the owning node.
    Server(NodeId),
    /// Match the compute-node restriction flag.
    Computer(bool),
}

impl Condition {
    /// Whether the record satisfies this condition.
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Condition::Kind(kind) => task.kind == *kind,
            Condition::Status(status) => task.status == *status,
            Condition::Server(server) => task.server.as_ref() == Some(server),
            Condition::Computer(computer) => task.computer == *computer,
        }
    }
}

/// Durable upsert/query/delete of task records.
///
/// `limit == 0` means unlimited. Status fields change fast; `save` must
/// drop stale secondary-index entries for the record's old status before
/// indexing the new one, or the index leaks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create whatever schema/layout the adapter needs. Idempotent.
    async fn ensure_schema(&self) -> Result<(), SchedulerError>;

    /// Insert or update a record.
    async fn save(&self, task: &Task) -> Result<(), SchedulerError>;

    /// Remove a record. Rejected with a state conflict unless the persisted
    /// status is terminal or `force` is set. Returns the removed record.
    async fn delete(&self, id: Uuid, force: bool) -> Result<Option<Task>, SchedulerError>;

    /// Point lookup.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>, SchedulerError>;

    /// Batch lookup; missing ids are skipped.
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>, SchedulerError>;

    /// Status-indexed paginated scan.
    async fn query_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError>;

    /// Paginated scan by field-equality conditions.
    async fn query_by_conditions(
        &self,
        conditions: &[Condition],
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError>;
}

fn parse_page(page: Option<&PageToken>) -> Result<usize, SchedulerError> {
    match page {
        None => Ok(0),
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| SchedulerError::Storage(format!("invalid page token '{token}'"))),
    }
}

fn slice_page(mut tasks: Vec<Task>, limit: usize, offset: usize) -> TaskPage {
    let total = tasks.len();
    if offset >= total {
        return TaskPage {
            tasks: Vec::new(),
            next: None,
        };
    }
    let mut tail = tasks.split_off(offset);
    if limit > 0 && tail.len() > limit {
        tail.truncate(limit);
        return TaskPage {
            tasks: tail,
            next: Some((offset + limit).to_string()),
        };
    }
    TaskPage {
        tasks: tail,
        next: None,
    }
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<Uuid, Task>,
    // Insertion-ordered status index.
    index: HashMap<TaskStatus, Vec<Uuid>>,
}

/// In-memory task store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn ensure_schema(&self) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn save(&self, task: &Task) -> Result<(), SchedulerError> {
        let mut inner = self.inner.write().await;
        let old_status = inner.tasks.get(&task.id).map(|old| old.status);
        match old_status {
            Some(old) if old == task.status => {}
            Some(old) => {
                // Drop the stale index entry before indexing the new status.
                if let Some(ids) = inner.index.get_mut(&old) {
                    ids.retain(|id| *id != task.id);
                }
                inner.index.entry(task.status).or_default().push(task.id);
            }
            None => inner.index.entry(task.status).or_default().push(task.id),
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid, force: bool) -> Result<Option<Task>, SchedulerError> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get(&id).cloned() else {
            return Ok(None);
        };
        if !force && !task.status.is_terminal() {
            return Err(SchedulerError::conflict(id, task.status, "delete incomplete"));
        }
        if let Some(ids) = inner.index.get_mut(&task.status) {
            ids.retain(|entry| *entry != id);
        }
        inner.tasks.remove(&id);
        Ok(Some(task))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>, SchedulerError> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>, SchedulerError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn query_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError> {
        let offset = parse_page(page.as_ref())?;
        let inner = self.inner.read().await;
        let tasks: Vec<Task> = inner
            .index
            .get(&status)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(slice_page(tasks, limit, offset))
    }

    async fn query_by_conditions(
        &self,
        conditions: &[Condition],
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError> {
        let offset = parse_page(page.as_ref())?;
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| conditions.iter().all(|cond| cond.matches(task)))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(slice_page(tasks, limit, offset))
    }
}

// Every status a record can be persisted in.
const STORED_STATUSES: [TaskStatus; 10] = [
    TaskStatus::New,
    TaskStatus::Scheduling,
    TaskStatus::Scheduled,
    TaskStatus::Queued,
    TaskStatus::Restoring,
    TaskStatus::Running,
    TaskStatus::Success,
    TaskStatus::Cancelling,
    TaskStatus::Cancelled,
    TaskStatus::Failed,
];

/// File-based task store.
///
/// Records are stored as individual JSON files organized by status:
/// ```text
/// {root}/
/// └── tasks/
///     ├── scheduling/
///     │   └── {uuid}.json
///     ├── queued/
///     │   └── {uuid}.json
///     └── ...
/// ```
/// Moving a record between directories on save is the stale-index cleanup:
/// a status never appears twice for one id.
pub struct FileTaskStore {
    root: PathBuf,
}

impl FileTaskStore {
    /// Create a store rooted at `root`, creating the layout if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let store = Self { root: root.into() };
        store.ensure_schema().await?;
        debug!("file task store initialized at {:?}", store.root);
        Ok(store)
    }

    fn status_dir(&self, status: TaskStatus) -> PathBuf {
        self.root.join("tasks").join(status.as_str())
    }

    fn task_path(&self, id: Uuid, status: TaskStatus) -> PathBuf {
        self.status_dir(status).join(format!("{id}.json"))
    }

    async fn find_task_file(&self, id: Uuid) -> Option<(PathBuf, TaskStatus)> {
        for status in STORED_STATUSES {
            let path = self.task_path(id, status);
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Some((path, status));
            }
        }
        None
    }

    async fn read_task(&self, path: &PathBuf) -> Result<Task, SchedulerError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| SchedulerError::Storage(format!("failed to read task file: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| SchedulerError::Storage(format!("failed to deserialize task: {e}")))
    }

    async fn status_tasks(&self, status: TaskStatus) -> Result<Vec<Task>, SchedulerError> {
        let dir = self.status_dir(status);
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| SchedulerError::Storage(format!("failed to read {dir:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SchedulerError::Storage(format!("failed to read dir entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                names.push(path);
            }
        }
        // Stable scan order so page cursors resume deterministically.
        names.sort();
        let mut tasks = Vec::new();
        for path in names {
            match self.read_task(&path).await {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("skipping unreadable task file {:?}: {}", path, e),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn ensure_schema(&self) -> Result<(), SchedulerError> {
        for status in STORED_STATUSES {
            fs::create_dir_all(self.status_dir(status))
                .await
                .map_err(|e| {
                    SchedulerError::Storage(format!(
                        "failed to create {} directory: {e}",
                        status.as_str()
                    ))
                })?;
        }
        Ok(())
    }

    async fn save(&self, task: &Task) -> Result<(), SchedulerError> {
        if let Some((old_path, old_status)) = self.find_task_file(task.id).await {
            if old_status != task.status {
                let _ = fs::remove_file(&old_path).await;
            }
        }
        let path = self.task_path(task.id, task.status);
        let content = serde_json::to_string_pretty(task)
            .map_err(|e| SchedulerError::Storage(format!("failed to serialize task: {e}")))?;
        fs::write(&path, content)
            .await
            .map_err(|e| SchedulerError::Storage(format!("failed to write task file: {e}")))?;
        debug!("saved task '{}' to {:?}", task.id, path);
        Ok(())
    }

    async fn delete(&self, id: Uuid, force: bool) -> Result<Option<Task>, SchedulerError> {
        let Some((path, status)) = self.find_task_file(id).await else {
            return Ok(None);
        };
        let task = self.read_task(&path).await?;
        if !force && !status.is_terminal() {
            return Err(SchedulerError::conflict(id, status, "delete incomplete"));
        }
        fs::remove_file(&path)
            .await
            .map_err(|e| SchedulerError::Storage(format!("failed to delete task file: {e}")))?;
        debug!("deleted task '{}'", id);
        Ok(Some(task))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>, SchedulerError> {
        match self.find_task_file(id).await {
            Some((path, _)) => Ok(Some(self.read_task(&path).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Task>, SchedulerError> {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get_by_id(*id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn query_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError> {
        let offset = parse_page(page.as_ref())?;
        let tasks = self.status_tasks(status).await?;
        Ok(slice_page(tasks, limit, offset))
    }

    async fn query_by_conditions(
        &self,
        conditions: &[Condition],
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError> {
        let offset = parse_page(page.as_ref())?;
        let mut tasks = Vec::new();
        for status in STORED_STATUSES {
            for task in self.status_tasks(status).await? {
                if conditions.iter().all(|cond| cond.matches(&task)) {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(slice_page(tasks, limit, offset))
    }
}
