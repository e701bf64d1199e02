//! Task scheduler orchestration.
//!
//! Submission, master-side assignment, worker-side pickup, cancellation,
//! restart recovery, and completion bookkeeping. The scheduler is bound to
//! one node of the cluster; cross-node coordination happens entirely
//! through the shared metadata store and the membership oracle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use graphyne_cluster::ServerOracle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::job::{Job, JobContext, JobFactory};
use crate::lane::StoreLane;
use crate::registry::{LiveTask, TaskRegistry};
use crate::status::{PENDING_STATUSES, TaskStatus};
use crate::store::{Condition, PageToken, TaskPage, TaskStore};
use crate::task::Task;

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;

/// How a finished run ended.
enum Outcome {
    Success(serde_json::Value),
    Failed(String),
    Cancelled,
}

enum DependencyState {
    Ready,
    Blocked,
    Failed(Uuid),
}

/// Node-local task scheduler.
///
/// One instance per node per graph. All public operations are safe to call
/// concurrently; registry mutation goes through a single critical section
/// and every store access through the serialized lane.
pub struct TaskScheduler {
    config: SchedulerConfig,
    oracle: Arc<dyn ServerOracle>,
    factory: Arc<dyn JobFactory>,
    registry: TaskRegistry,
    lane: StoreLane,
    permits: Arc<Semaphore>,
    wakeup: Notify,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    /// Create a scheduler over the given store, oracle, and job factory.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        oracle: Arc<dyn ServerOracle>,
        factory: Arc<dyn JobFactory>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_workers as usize));
        Arc::new(Self {
            lane: StoreLane::new(store),
            registry: TaskRegistry::new(),
            permits,
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            config,
            oracle,
            factory,
        })
    }

    /// Graph this scheduler belongs to.
    pub fn graph(&self) -> &str {
        &self.config.graph
    }

    /// Number of tasks pending on this node (queued plus running).
    pub fn pending_tasks(&self) -> usize {
        self.registry.len()
    }

    /// Create the store schema/layout. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), SchedulerError> {
        self.lane
            .call(|store| async move { store.ensure_schema().await })
            .await
    }

    /// Submit a task for execution.
    ///
    /// Either the task runs locally before this returns (single-node fast
    /// path, ephemeral jobs) or it is durably marked SCHEDULING; a crash
    /// after the save but before the master wake-up is safe because the
    /// periodic tick discovers the task regardless.
    pub async fn submit(
        self: &Arc<Self>,
        mut task: Task,
        job: Arc<dyn Job>,
    ) -> Result<Task, SchedulerError> {
        // A QUEUED task is a re-submission and must already be tracked.
        if task.status == TaskStatus::Queued {
            let live = self.registry.get(task.id).ok_or_else(|| {
                SchedulerError::Validation(format!(
                    "can't resubmit task '{}' that was never submitted",
                    task.id
                ))
            })?;
            let status = live.record.read().status;
            if status != TaskStatus::Queued {
                return Err(SchedulerError::conflict(task.id, status, "resubmit"));
            }
            self.spawn_job(live);
            return Ok(task);
        }
        if task.status != TaskStatus::New {
            return Err(SchedulerError::conflict(task.id, task.status, "submit"));
        }
        if let Some(existing) = self.registry.get(task.id) {
            return Err(SchedulerError::conflict(
                task.id,
                existing.record.read().status,
                "submit duplicate",
            ));
        }

        // Ephemeral jobs run where they were created and are never saved.
        if job.ephemeral() {
            task.transition(TaskStatus::Queued)?;
            self.enqueue_local(task.clone(), job)?;
            return Ok(task);
        }

        if !self.oracle.self_is_master() {
            return Err(SchedulerError::Authority { op: "submit".into() });
        }

        if self.oracle.only_single_node() && !task.computer {
            // Single node: skip the assignment round-trip entirely. Check
            // the ceiling first so a rejected submission persists nothing.
            let pending = self.registry.len() + 1;
            if pending > self.config.max_pending_tasks {
                return Err(SchedulerError::Capacity {
                    pending,
                    max: self.config.max_pending_tasks,
                });
            }
            task.transition(TaskStatus::Queued)?;
            let self_id = self.oracle.self_node_id();
            task.server = Some(self_id.clone());
            self.save(&task).await?;
            self.oracle.increase_load(&self_id, task.load).await;
            self.enqueue_local(task.clone(), job)?;
            return Ok(task);
        }

        task.transition(TaskStatus::Scheduling)?;
        self.save(&task).await?;
        self.oracle.notify_new_task(task.id);
        self.wakeup.notify_one();
        Ok(task)
    }

    /// Assign SCHEDULING tasks to workers. No-op on non-master nodes.
    pub async fn schedule_tasks_on_master(&self) -> Result<(), SchedulerError> {
        if !self.oracle.self_is_master() {
            debug!("skipping assignment tick on non-master node");
            return Ok(());
        }
        let mut infos = self.oracle.all_server_infos().await;
        for mut task in self.collect_by_status(TaskStatus::Scheduling).await? {
            if task.server.is_some() {
                // Another master instance claimed it first; not an error.
                continue;
            }
            if !self.oracle.self_is_master() {
                // Demoted mid-scan: stop before assigning anything else and
                // skip the snapshot save; the next master converges load.
                info!("lost mastership, aborting assignment scan");
                return Ok(());
            }
            let placement = task.placement();
            let Some(node) = self.oracle.pick_worker_node(&infos, &placement) else {
                info!(
                    "no suitable server for task '{}', waiting for next tick",
                    task.id
                );
                continue;
            };
            task.server = Some(node.clone());
            task.transition(TaskStatus::Scheduled)?;
            self.save(&task).await?;
            // Track projected load in the snapshot only; one durable save
            // after the scan batches the writes.
            if let Some(info) = infos.iter_mut().find(|info| info.id == node) {
                info.load = info.load.saturating_add(task.load);
            }
            info!("scheduled task '{}' to server '{}'", task.id, node);
        }
        self.oracle.update_server_infos(infos).await;
        Ok(())
    }

    /// Pick up SCHEDULED tasks addressed to this node. Runs on every node.
    pub async fn execute_tasks_on_worker(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let self_id = self.oracle.self_node_id();
        for mut task in self.collect_by_status(TaskStatus::Scheduled).await? {
            let Some(server) = task.server.clone() else {
                warn!("task '{}' is SCHEDULED without a server", task.id);
                continue;
            };
            if server != self_id {
                continue;
            }
            if self.registry.contains(task.id) {
                // Already picked up; the live instance outranks the store.
                continue;
            }
            if self.registry.len() + 1 > self.config.max_pending_tasks {
                warn!(
                    "pending-task ceiling reached, leaving task '{}' for a later tick",
                    task.id
                );
                return Ok(());
            }
            let job = match self.factory.create(&task) {
                Ok(job) => job,
                Err(e) => {
                    // Leave the record SCHEDULED; don't let one bad record
                    // wedge the rest of the scan.
                    warn!("can't attach job for task '{}': {}", task.id, e);
                    continue;
                }
            };
            task.transition(TaskStatus::Queued)?;
            self.save(&task).await?;
            match self.enqueue_local(task, job) {
                Ok(_) => {}
                // Lost a local race; the other instance owns it now.
                Err(SchedulerError::StateConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Complete CANCELLING tasks addressed to this node.
    pub async fn cancel_tasks_on_worker(&self) -> Result<(), SchedulerError> {
        let self_id = self.oracle.self_node_id();
        for mut task in self.collect_by_status(TaskStatus::Cancelling).await? {
            let Some(server) = task.server.clone() else {
                warn!("task '{}' is CANCELLING without a server", task.id);
                continue;
            };
            if server != self_id {
                continue;
            }
            if let Some(live) = self.registry.get(task.id) {
                // A live run exists; ask it to stop. Its run future finishes
                // the CANCELLED transition and the bookkeeping.
                live.cancel.cancel();
                info!("requested cancellation of live task '{}'", task.id);
            } else {
                // The process restarted mid-run, so there is nothing to
                // interrupt. Attach the job for its cleanup hook and finish
                // the record directly.
                match self.factory.create(&task) {
                    Ok(job) => job.cancel(),
                    Err(e) => debug!("no job to attach for cancelled task '{}': {}", task.id, e),
                }
                task.transition(TaskStatus::Cancelled)?;
                self.save(&task).await?;
                info!("cancelled task '{}' with no live instance", task.id);
            }
        }
        Ok(())
    }

    /// Request cancellation of a task. Master only.
    ///
    /// Tasks not yet assigned to a worker are cancelled synchronously;
    /// assigned tasks move to CANCELLING and the owning node completes the
    /// transition on its cancellation tick. Cancelling a completed or
    /// already-cancelling task is a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<(), SchedulerError> {
        if !self.oracle.self_is_master() {
            return Err(SchedulerError::Authority { op: "cancel".into() });
        }
        let mut task = self.get(id).await?;
        if task.completed() || task.status == TaskStatus::Cancelling {
            return Ok(());
        }
        info!("cancel task '{}' in status {:?}", id, task.status);

        if task.server.is_none() {
            if let Some(live) = self.registry.get(id) {
                // Local ephemeral instance: stop it; its run future does the
                // bookkeeping and nothing was ever persisted.
                live.cancel.cancel();
                return Ok(());
            }
            task.transition(TaskStatus::Cancelled)?;
            self.save(&task).await?;
            return Ok(());
        }

        task.transition(TaskStatus::Cancelling)?;
        self.save(&task).await?;
        if task.server != Some(self.oracle.self_node_id()) {
            // Evict the non-owning copy so two live instances of one id
            // never coexist; the owner still completes the cancellation.
            self.registry.remove(id);
        }
        self.oracle.notify_new_task(id);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Delete a task from the registry and the store. Master only.
    ///
    /// Incomplete tasks are rejected unless `force` is set.
    pub async fn delete(&self, id: Uuid, force: bool) -> Result<Option<Task>, SchedulerError> {
        if !self.oracle.self_is_master() {
            return Err(SchedulerError::Authority { op: "delete".into() });
        }
        if let Some(live) = self.registry.get(id) {
            let status = live.record.read().status;
            if !force && !status.is_terminal() {
                return Err(SchedulerError::conflict(id, status, "delete incomplete"));
            }
            live.mark_evicted();
            live.cancel.cancel();
            self.registry.remove(id);
        }
        self.lane
            .call(move |store| async move { store.delete(id, force).await })
            .await
    }

    /// Look up a task; a live in-memory instance always wins over the
    /// store copy.
    pub async fn get(&self, id: Uuid) -> Result<Task, SchedulerError> {
        if let Some(live) = self.registry.get(id) {
            return Ok(live.record.read().clone());
        }
        let found = self
            .lane
            .call(move |store| async move { store.get_by_id(id).await })
            .await?;
        found.ok_or(SchedulerError::NotFound(id))
    }

    /// Batch lookup: registry hits first, then one store fetch for the
    /// misses. Unknown ids are skipped.
    pub async fn list(&self, ids: &[Uuid]) -> Result<Vec<Task>, SchedulerError> {
        let mut tasks = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.registry.get(*id) {
                Some(live) => tasks.push(live.record.read().clone()),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            let stored = self
                .lane
                .call(move |store| async move { store.get_by_ids(&missing).await })
                .await?;
            tasks.extend(stored);
        }
        Ok(tasks)
    }

    /// Paginated status listing straight from the store.
    pub async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError> {
        self.lane
            .call(move |store| async move { store.query_by_status(status, limit, page).await })
            .await
    }

    /// Paginated field-equality listing straight from the store.
    pub async fn list_by_conditions(
        &self,
        conditions: Vec<Condition>,
        limit: usize,
        page: Option<PageToken>,
    ) -> Result<TaskPage, SchedulerError> {
        self.lane
            .call(move |store| async move {
                store.query_by_conditions(&conditions, limit, page).await
            })
            .await
    }

    /// Recover tasks this node owned before a restart.
    ///
    /// Scans RESTORING, RUNNING and QUEUED in that order, and re-submits
    /// every match owned by this node with an incremented retry count.
    /// Tasks owned by other nodes are never touched. Returns the number of
    /// restored tasks.
    pub async fn restore_tasks(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let self_id = self.oracle.self_node_id();
        let mut to_restore = Vec::new();
        for status in PENDING_STATUSES {
            for task in self.collect_by_status(status).await? {
                if task.server.as_ref() == Some(&self_id) {
                    to_restore.push(task);
                }
            }
        }
        let count = to_restore.len();
        for mut task in to_restore {
            if self.registry.contains(task.id) {
                return Err(SchedulerError::Validation(format!(
                    "task '{}' is already in the queue",
                    task.id
                )));
            }
            info!(
                "restoring task '{}' from status {:?} (retry {})",
                task.id,
                task.status,
                task.retries + 1
            );
            task.transition(TaskStatus::Restoring)?;
            task.retries += 1;
            self.save(&task).await?;
            let job = self.factory.create(&task)?;
            self.enqueue_local(task, job)?;
        }
        Ok(count)
    }

    /// Poll until the task completes, up to `seconds`.
    pub async fn wait_until_completed(
        &self,
        id: Uuid,
        seconds: u64,
    ) -> Result<Task, SchedulerError> {
        let interval = self.poll_interval();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
        loop {
            let task = self.get(id).await?;
            if task.completed() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SchedulerError::Timeout(format!(
                    "task '{id}' was not completed in {seconds} seconds"
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Poll until this node has no pending tasks, up to `seconds`.
    pub async fn wait_until_all_completed(&self, seconds: u64) -> Result<(), SchedulerError> {
        let interval = self.poll_interval();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
        loop {
            let pending = self.pending_tasks();
            if pending == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SchedulerError::Timeout(format!(
                    "there are still {pending} incomplete tasks after {seconds} seconds"
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Run the periodic tick loop until `close`.
    ///
    /// Each round runs the assignment tick (masters only), the pickup tick
    /// and the cancellation tick; a submission or cancellation wake-up cuts
    /// the wait short. Tick errors are logged and retried next round.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let sched = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(sched.config.tick_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = sched.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                    _ = sched.wakeup.notified() => {}
                }
                if let Err(e) = sched.schedule_tasks_on_master().await {
                    warn!("assignment tick failed: {}", e);
                }
                if let Err(e) = sched.execute_tasks_on_worker().await {
                    warn!("pickup tick failed: {}", e);
                }
                if let Err(e) = sched.cancel_tasks_on_worker().await {
                    warn!("cancellation tick failed: {}", e);
                }
            }
            debug!("scheduler ticker stopped");
        })
    }

    /// Stop the ticker and the store lane. Jobs already running keep their
    /// cancellation semantics; saves attempted after close fail and are
    /// logged. Call `wait_until_all_completed` first for a clean drain.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.permits.close();
        self.lane.close().await;
        info!("scheduler for graph '{}' closed", self.config.graph);
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    async fn save(&self, task: &Task) -> Result<(), SchedulerError> {
        debug!("saving task '{}' in status {:?}", task.id, task.status);
        let task = task.clone();
        self.lane
            .call(move |store| async move { store.save(&task).await })
            .await
    }

    /// Walk the status index page by page into one list.
    async fn collect_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, SchedulerError> {
        let limit = self.config.page_size;
        let mut tasks = Vec::new();
        let mut page: Option<PageToken> = None;
        loop {
            let cursor = page.clone();
            let batch = self
                .lane
                .call(move |store| async move { store.query_by_status(status, limit, cursor).await })
                .await?;
            tasks.extend(batch.tasks);
            match batch.next {
                Some(next) => page = Some(next),
                None => break,
            }
        }
        Ok(tasks)
    }

    fn enqueue_local(
        self: &Arc<Self>,
        task: Task,
        job: Arc<dyn Job>,
    ) -> Result<Arc<LiveTask>, SchedulerError> {
        let live = LiveTask::new(task, job);
        self.registry
            .insert(Arc::clone(&live), self.config.max_pending_tasks)?;
        self.spawn_job(Arc::clone(&live));
        Ok(live)
    }

    fn spawn_job(self: &Arc<Self>, live: Arc<LiveTask>) {
        let sched = Arc::clone(self);
        tokio::spawn(async move {
            sched.run_job(live).await;
        });
    }

    async fn run_job(self: Arc<Self>, live: Arc<LiveTask>) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        if live.cancel.is_cancelled() {
            self.finish(&live, Outcome::Cancelled).await;
            return;
        }

        let deps = live.record.read().depends_on.clone();
        if !deps.is_empty() {
            match self.dependency_state(&deps).await {
                Ok(DependencyState::Ready) => {}
                Ok(DependencyState::Blocked) => {
                    // Stay QUEUED and retry shortly; holding a worker permit
                    // while waiting could starve the dependency itself.
                    drop(permit);
                    self.requeue_after_poll(live);
                    return;
                }
                Ok(DependencyState::Failed(dep)) => {
                    self.finish(
                        &live,
                        Outcome::Failed(format!("dependency task '{dep}' did not succeed")),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    warn!("dependency check for task '{}' failed: {}", live.id(), e);
                    drop(permit);
                    self.requeue_after_poll(live);
                    return;
                }
            }
        }

        let started = { live.record.write().transition(TaskStatus::Running) };
        if let Err(e) = started {
            warn!("task '{}' is no longer runnable: {}", live.id(), e);
            self.task_done(&live).await;
            return;
        }
        if !live.ephemeral {
            let snapshot = live.record.read().clone();
            if let Err(e) = self.save(&snapshot).await {
                // Memory is ahead of the store now; later ticks re-derive
                // truth from the store, costing at most a redundant retry.
                warn!("failed to persist RUNNING for task '{}': {}", snapshot.id, e);
            }
        }

        let ctx = JobContext::new(Arc::clone(&live));
        let job = Arc::clone(&live.job);
        let outcome = tokio::select! {
            _ = live.cancel.cancelled() => Outcome::Cancelled,
            result = job.run(ctx) => match result {
                Ok(value) => Outcome::Success(value),
                Err(e) => Outcome::Failed(e.to_string()),
            },
        };
        drop(permit);
        self.finish(&live, outcome).await;
    }

    async fn finish(&self, live: &Arc<LiveTask>, outcome: Outcome) {
        let snapshot = {
            let mut record = live.record.write();
            let (status, result, error) = match outcome {
                Outcome::Success(value) => (TaskStatus::Success, Some(value), None),
                Outcome::Failed(message) => (TaskStatus::Failed, None, Some(message)),
                Outcome::Cancelled => (TaskStatus::Cancelled, None, None),
            };
            match record.transition(status) {
                Ok(()) => {
                    if status == TaskStatus::Success {
                        record.progress = 100;
                    }
                    record.result = result;
                    record.error = error;
                }
                Err(e) => warn!("dropping finish transition for task '{}': {}", record.id, e),
            }
            record.clone()
        };
        if !live.ephemeral && !live.is_evicted() {
            if let Err(e) = self.save(&snapshot).await {
                error!(
                    "failed to save final status {:?} of task '{}': {}",
                    snapshot.status, snapshot.id, e
                );
            }
        }
        self.task_done(live).await;
    }

    /// Completion bookkeeping: evict from the registry and release load.
    async fn task_done(&self, live: &Arc<LiveTask>) {
        let (id, server, load, status) = {
            let record = live.record.read();
            (record.id, record.server.clone(), record.load, record.status)
        };
        self.registry.remove(id);
        if let Some(server) = server {
            self.oracle.decrease_load(&server, load).await;
        }
        debug!("task '{}' done in status {:?}", id, status);
    }

    fn requeue_after_poll(self: &Arc<Self>, live: Arc<LiveTask>) {
        let sched = Arc::clone(self);
        let delay = self.poll_interval();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sched.shutdown.is_cancelled() {
                return;
            }
            sched.run_job(live).await;
        });
    }

    async fn dependency_state(&self, deps: &[Uuid]) -> Result<DependencyState, SchedulerError> {
        let ids = deps.to_vec();
        let found = self
            .lane
            .call(move |store| async move { store.get_by_ids(&ids).await })
            .await?;
        let by_id: HashMap<Uuid, TaskStatus> =
            found.into_iter().map(|task| (task.id, task.status)).collect();
        for dep in deps {
            match by_id.get(dep) {
                // A dependency that no longer exists can never succeed.
                None => return Ok(DependencyState::Failed(*dep)),
                Some(TaskStatus::Success) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                    return Ok(DependencyState::Failed(*dep));
                }
                Some(_) => return Ok(DependencyState::Blocked),
            }
        }
        Ok(DependencyState::Ready)
    }
}
