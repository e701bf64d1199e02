use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graphyne_cluster::{MemoryOracle, ServerInfo, ServerRole};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use super::TaskScheduler;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::job::{Job, JobContext, JobFactory};
use crate::status::TaskStatus;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::task::Task;

/// Test job driven by its `job_ref`-style behavior flags.
struct TestJob {
    delay: Duration,
    fail: bool,
    ephemeral: bool,
    block: bool,
}

impl TestJob {
    fn noop() -> Self {
        Self {
            delay: Duration::from_millis(10),
            fail: false,
            ephemeral: false,
            block: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::noop()
        }
    }

    fn blocking() -> Self {
        Self {
            block: true,
            ..Self::noop()
        }
    }

    fn ephemeral() -> Self {
        Self {
            ephemeral: true,
            ..Self::noop()
        }
    }
}

#[async_trait]
impl Job for TestJob {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        if self.block {
            loop {
                if ctx.is_cancelled() {
                    anyhow::bail!("interrupted");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        tokio::time::sleep(self.delay).await;
        ctx.set_progress(50);
        if self.fail {
            anyhow::bail!("boom");
        }
        Ok(json!({"ok": true}))
    }

    fn ephemeral(&self) -> bool {
        self.ephemeral
    }
}

/// Completes only once released; for dependency-ordering tests.
struct ManualJob {
    release: Arc<Notify>,
}

#[async_trait]
impl Job for ManualJob {
    async fn run(&self, _ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        self.release.notified().await;
        Ok(json!("released"))
    }
}

struct TestFactory;

impl JobFactory for TestFactory {
    fn create(&self, task: &Task) -> Result<Arc<dyn Job>, SchedulerError> {
        match task.job_ref.as_str() {
            "noop" => Ok(Arc::new(TestJob::noop())),
            "fail" => Ok(Arc::new(TestJob::failing())),
            "block" => Ok(Arc::new(TestJob::blocking())),
            other => Err(SchedulerError::Validation(format!(
                "unknown job ref '{other}'"
            ))),
        }
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 20,
        tick_interval_secs: 1,
        ..Default::default()
    }
}

fn scheduler(
    config: SchedulerConfig,
    store: Arc<MemoryTaskStore>,
    oracle: Arc<MemoryOracle>,
) -> Arc<TaskScheduler> {
    TaskScheduler::new(config, store, oracle, Arc::new(TestFactory))
}

fn single_node(store: Arc<MemoryTaskStore>) -> (Arc<TaskScheduler>, Arc<MemoryOracle>) {
    let oracle = Arc::new(MemoryOracle::single("node-a"));
    (
        scheduler(fast_config(), store, Arc::clone(&oracle)),
        oracle,
    )
}

/// Master on `node-a`, worker on `node-b`, shared store; `node-a` is kept
/// loaded so placement always picks `node-b`.
fn two_nodes(
    store: Arc<MemoryTaskStore>,
) -> (
    Arc<TaskScheduler>,
    Arc<MemoryOracle>,
    Arc<TaskScheduler>,
    Arc<MemoryOracle>,
) {
    let oracle_a = Arc::new(MemoryOracle::new("node-a", true));
    oracle_a.add_server(ServerInfo::new("node-b", ServerRole::Worker));
    let mut loaded = ServerInfo::new("node-a", ServerRole::Master);
    loaded.load = 100;
    oracle_a.add_server(loaded);

    let oracle_b = Arc::new(MemoryOracle::new("node-b", false));
    oracle_b.add_server(ServerInfo::new("node-a", ServerRole::Master));

    let sched_a = scheduler(fast_config(), Arc::clone(&store), Arc::clone(&oracle_a));
    let sched_b = scheduler(fast_config(), store, Arc::clone(&oracle_b));
    (sched_a, oracle_a, sched_b, oracle_b)
}

async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn eventually_status(store: &MemoryTaskStore, id: Uuid, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let current = store.get_by_id(id).await.unwrap().map(|task| task.status);
        if current == Some(status) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {id} never reached {status:?}, last seen {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_single_node_lifecycle() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, oracle) = single_node(Arc::clone(&store));

    let task = Task::new("index-rebuild", "noop");
    let id = task.id;
    let submitted = sched.submit(task, Arc::new(TestJob::noop())).await.unwrap();

    // Fast path: straight to QUEUED on this node, never SCHEDULING.
    assert_eq!(submitted.status, TaskStatus::Queued);
    assert_eq!(submitted.server.as_deref(), Some("node-a"));

    let done = sched.wait_until_completed(id, 5).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result, Some(json!({"ok": true})));

    sched.wait_until_all_completed(5).await.unwrap();
    eventually(
        || oracle.load_of(&"node-a".to_string()) == Some(0),
        "load release",
    )
    .await;
}

#[tokio::test]
async fn test_failed_job_records_error() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    let task = Task::new("index-rebuild", "fail");
    let id = task.id;
    sched
        .submit(task, Arc::new(TestJob::failing()))
        .await
        .unwrap();

    let done = sched.wait_until_completed(id, 5).await.unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn test_duplicate_submit_is_rejected() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(store);

    let task = Task::new("long", "block");
    sched
        .submit(task.clone(), Arc::new(TestJob::blocking()))
        .await
        .unwrap();

    let err = sched
        .submit(task, Arc::new(TestJob::blocking()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StateConflict { .. }));
    assert_eq!(sched.pending_tasks(), 1);
}

#[tokio::test]
async fn test_resubmit_requires_tracked_queued_task() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(store);

    let mut task = Task::new("t", "noop");
    task.status = TaskStatus::Queued;
    let err = sched
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let mut done = Task::new("t", "noop");
    done.status = TaskStatus::Success;
    let err = sched
        .submit(done, Arc::new(TestJob::noop()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StateConflict { .. }));
}

#[tokio::test]
async fn test_ephemeral_job_never_persisted() {
    let store = Arc::new(MemoryTaskStore::new());
    // Ephemeral jobs run on any node, master or not.
    let oracle = Arc::new(MemoryOracle::new("node-b", false));
    let sched = scheduler(fast_config(), Arc::clone(&store), oracle);

    let task = Task::new("scratch", "noop");
    let id = task.id;
    sched
        .submit(task, Arc::new(TestJob::ephemeral()))
        .await
        .unwrap();

    sched.wait_until_all_completed(5).await.unwrap();
    assert!(store.get_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_master_submit_rejected() {
    let store = Arc::new(MemoryTaskStore::new());
    let oracle = Arc::new(MemoryOracle::new("node-b", false));
    let sched = scheduler(fast_config(), Arc::clone(&store), oracle);

    let task = Task::new("rebuild", "noop");
    let id = task.id;
    let err = sched
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Authority { .. }));

    assert!(store.get_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_two_node_assignment_flow() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched_a, oracle_a, sched_b, _) = two_nodes(Arc::clone(&store));

    let task = Task::new("rebuild", "noop");
    let id = task.id;
    let submitted = sched_a
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap();
    assert_eq!(submitted.status, TaskStatus::Scheduling);
    assert!(submitted.server.is_none());
    assert_eq!(oracle_a.notifications(), 1);

    // Master tick assigns the least-loaded worker.
    sched_a.schedule_tasks_on_master().await.unwrap();
    let stored = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert_eq!(stored.server.as_deref(), Some("node-b"));
    assert_eq!(oracle_a.load_of(&"node-b".to_string()), Some(1));

    // The non-assignee's pickup tick leaves it alone.
    sched_a.execute_tasks_on_worker().await.unwrap();
    assert_eq!(sched_a.pending_tasks(), 0);
    assert_eq!(
        store.get_by_id(id).await.unwrap().unwrap().status,
        TaskStatus::Scheduled
    );

    // The assignee picks it up and runs it.
    sched_b.execute_tasks_on_worker().await.unwrap();
    let done = sched_b.wait_until_completed(id, 5).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_assignment_waits_when_no_server_fits() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched_a, oracle_a, _sched_b, _) = two_nodes(Arc::clone(&store));

    // A compute-bound task with no compute node in the cluster.
    let task = Task::new("analytics", "noop").with_computer(true);
    let id = task.id;
    sched_a
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap();

    sched_a.schedule_tasks_on_master().await.unwrap();
    let stored = store.get_by_id(id).await.unwrap().unwrap();
    // Left untouched for a later tick; no backoff, no error.
    assert_eq!(stored.status, TaskStatus::Scheduling);
    assert!(stored.server.is_none());
    assert_eq!(oracle_a.notifications(), 1);
}

#[tokio::test]
async fn test_demoted_master_assigns_nothing() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched_a, oracle_a, _sched_b, _) = two_nodes(Arc::clone(&store));

    let task = Task::new("rebuild", "noop");
    let id = task.id;
    sched_a
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap();

    oracle_a.set_master(false);
    sched_a.schedule_tasks_on_master().await.unwrap();

    let stored = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduling);
    assert!(stored.server.is_none());
}

#[tokio::test]
async fn test_cancel_unassigned_task_is_synchronous() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched_a, _, _sched_b, _) = two_nodes(Arc::clone(&store));

    let task = Task::new("rebuild", "noop");
    let id = task.id;
    sched_a
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap();

    sched_a.cancel(id).await.unwrap();
    assert_eq!(
        store.get_by_id(id).await.unwrap().unwrap().status,
        TaskStatus::Cancelled
    );

    // Cancelling a finished task is a no-op.
    sched_a.cancel(id).await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_task_via_owner_tick() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    let task = Task::new("long", "block");
    let id = task.id;
    sched
        .submit(task, Arc::new(TestJob::blocking()))
        .await
        .unwrap();
    eventually_status(&store, id, TaskStatus::Running).await;

    // Assigned to this node, so the request is forwarded as CANCELLING.
    sched.cancel(id).await.unwrap();
    eventually_status(&store, id, TaskStatus::Cancelling).await;
    assert_eq!(sched.pending_tasks(), 1);

    // The owner's cancellation tick completes the transition.
    sched.cancel_tasks_on_worker().await.unwrap();
    eventually_status(&store, id, TaskStatus::Cancelled).await;
    eventually(|| sched.pending_tasks() == 0, "registry eviction").await;
}

#[tokio::test]
async fn test_cancel_without_live_instance_after_restart() {
    let store = Arc::new(MemoryTaskStore::new());

    // A RUNNING task owned by node-a whose process restarted mid-run.
    let mut task = Task::new("rebuild", "noop");
    task.transition(TaskStatus::Queued).unwrap();
    task.server = Some("node-a".to_string());
    task.transition(TaskStatus::Running).unwrap();
    task.transition(TaskStatus::Cancelling).unwrap();
    store.save(&task).await.unwrap();

    let (sched, _) = single_node(Arc::clone(&store));
    sched.cancel_tasks_on_worker().await.unwrap();

    assert_eq!(
        store.get_by_id(task.id).await.unwrap().unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_non_master_cancel_rejected() {
    let store = Arc::new(MemoryTaskStore::new());
    let oracle = Arc::new(MemoryOracle::new("node-b", false));
    let sched = scheduler(fast_config(), store, oracle);

    let err = sched.cancel(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Authority { .. }));
}

#[tokio::test]
async fn test_delete_running_requires_force() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    let task = Task::new("long", "block");
    let id = task.id;
    sched
        .submit(task, Arc::new(TestJob::blocking()))
        .await
        .unwrap();
    eventually_status(&store, id, TaskStatus::Running).await;

    let err = sched.delete(id, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::StateConflict { .. }));
    assert_eq!(sched.pending_tasks(), 1);

    let removed = sched.delete(id, true).await.unwrap();
    assert!(removed.is_some());
    assert_eq!(sched.pending_tasks(), 0);

    // The interrupted run must not resurrect the deleted row.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get_by_id(id).await.unwrap().is_none());
    assert!(matches!(
        sched.get(id).await,
        Err(SchedulerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_completed_task() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    let task = Task::new("quick", "noop");
    let id = task.id;
    sched.submit(task, Arc::new(TestJob::noop())).await.unwrap();
    sched.wait_until_completed(id, 5).await.unwrap();

    let removed = sched.delete(id, false).await.unwrap().unwrap();
    assert_eq!(removed.status, TaskStatus::Success);
    assert!(store.get_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_restart_recovery_restores_own_tasks() {
    let store = Arc::new(MemoryTaskStore::new());

    // Crash left a RUNNING task owned by node-a in the store; the registry
    // died with the process.
    let mut task = Task::new("rebuild", "block");
    task.transition(TaskStatus::Queued).unwrap();
    task.server = Some("node-a".to_string());
    task.transition(TaskStatus::Running).unwrap();
    store.save(&task).await.unwrap();

    let (sched, _) = single_node(Arc::clone(&store));
    let restored = sched.restore_tasks().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(sched.pending_tasks(), 1);

    let record = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(record.retries, 1);
    assert!(matches!(
        record.status,
        TaskStatus::Restoring | TaskStatus::Running
    ));
}

#[tokio::test]
async fn test_restart_recovery_ignores_other_nodes() {
    let store = Arc::new(MemoryTaskStore::new());

    let mut task = Task::new("rebuild", "noop");
    task.transition(TaskStatus::Queued).unwrap();
    task.server = Some("node-a".to_string());
    task.transition(TaskStatus::Running).unwrap();
    store.save(&task).await.unwrap();

    let oracle = Arc::new(MemoryOracle::new("node-b", false));
    let sched = scheduler(fast_config(), Arc::clone(&store), oracle);
    let restored = sched.restore_tasks().await.unwrap();
    assert_eq!(restored, 0);
    assert_eq!(sched.pending_tasks(), 0);

    let record = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Running);
    assert_eq!(record.retries, 0);
}

#[tokio::test]
async fn test_recovered_task_runs_to_completion() {
    let store = Arc::new(MemoryTaskStore::new());

    let mut task = Task::new("rebuild", "noop");
    task.transition(TaskStatus::Queued).unwrap();
    task.server = Some("node-a".to_string());
    store.save(&task).await.unwrap();

    let (sched, _) = single_node(Arc::clone(&store));
    assert_eq!(sched.restore_tasks().await.unwrap(), 1);

    let done = sched.wait_until_completed(task.id, 5).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.retries, 1);
}

#[tokio::test]
async fn test_wait_until_completed_times_out() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(store);

    let task = Task::new("long", "block");
    let id = task.id;
    sched
        .submit(task, Arc::new(TestJob::blocking()))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = sched.wait_until_completed(id, 1).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, SchedulerError::Timeout(_)));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2));
}

#[tokio::test]
async fn test_capacity_ceiling_rejects_submission() {
    let store = Arc::new(MemoryTaskStore::new());
    let config = SchedulerConfig {
        max_pending_tasks: 1,
        ..fast_config()
    };
    let oracle = Arc::new(MemoryOracle::single("node-a"));
    let sched = scheduler(config, Arc::clone(&store), oracle);

    let first = Task::new("long", "block");
    sched
        .submit(first.clone(), Arc::new(TestJob::blocking()))
        .await
        .unwrap();

    let second = Task::new("quick", "noop");
    let err = sched
        .submit(second.clone(), Arc::new(TestJob::noop()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Capacity { pending: 2, max: 1 }));

    // The first task is unaffected and the rejected one never persisted.
    assert_eq!(sched.pending_tasks(), 1);
    assert!(store.get_by_id(second.id).await.unwrap().is_none());
    assert!(store.get_by_id(first.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_dependency_defers_until_success() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    let release = Arc::new(Notify::new());
    let dep = Task::new("dep", "manual");
    let child = Task::new("child", "noop").with_dependencies(vec![dep.id]);
    let child_id = child.id;

    sched
        .submit(
            dep.clone(),
            Arc::new(ManualJob {
                release: Arc::clone(&release),
            }),
        )
        .await
        .unwrap();
    sched
        .submit(child, Arc::new(TestJob::noop()))
        .await
        .unwrap();

    // The child must not finish while its dependency is still running.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let waiting = store.get_by_id(child_id).await.unwrap().unwrap();
    assert!(!waiting.status.is_terminal());

    release.notify_one();
    let done = sched.wait_until_completed(child_id, 5).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(
        store.get_by_id(dep.id).await.unwrap().unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_dependency_failure_fails_dependent() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    let dep = Task::new("dep", "fail");
    let child = Task::new("child", "noop").with_dependencies(vec![dep.id]);
    let child_id = child.id;

    sched
        .submit(dep, Arc::new(TestJob::failing()))
        .await
        .unwrap();
    sched
        .submit(child, Arc::new(TestJob::noop()))
        .await
        .unwrap();

    let done = sched.wait_until_completed(child_id, 5).await.unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.error.unwrap().contains("dependency"));
}

#[tokio::test]
async fn test_list_mixes_registry_and_store() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched, _) = single_node(Arc::clone(&store));

    // One task live on this node, one only persisted.
    let live = Task::new("long", "block");
    sched
        .submit(live.clone(), Arc::new(TestJob::blocking()))
        .await
        .unwrap();

    let mut stored = Task::new("done", "noop");
    stored.transition(TaskStatus::Queued).unwrap();
    store.save(&stored).await.unwrap();

    let tasks = sched
        .list(&[live.id, stored.id, Uuid::new_v4()])
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, live.id);
    assert_eq!(tasks[1].id, stored.id);
}

#[tokio::test]
async fn test_ticker_drives_two_node_flow() {
    let store = Arc::new(MemoryTaskStore::new());
    let (sched_a, _, sched_b, _) = two_nodes(Arc::clone(&store));

    let ticker_a = sched_a.spawn_ticker();
    let ticker_b = sched_b.spawn_ticker();

    let task = Task::new("rebuild", "noop");
    let id = task.id;
    sched_a
        .submit(task, Arc::new(TestJob::noop()))
        .await
        .unwrap();

    let done = sched_a.wait_until_completed(id, 10).await.unwrap();
    assert_eq!(done.status, TaskStatus::Success);

    sched_a.close().await;
    sched_b.close().await;
    ticker_a.await.unwrap();
    ticker_b.await.unwrap();

    // A closed scheduler rejects further work.
    let err = sched_a
        .submit(Task::new("late", "noop"), Arc::new(TestJob::noop()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Shutdown));
}
