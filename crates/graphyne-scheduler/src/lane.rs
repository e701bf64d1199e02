//! Serialized store-access lane.
//!
//! Every metadata-store call from this node funnels through one worker
//! task, in submission order. That single lane is what gives the scheduler
//! read-after-write consistency for its own operations without explicit
//! locking; the store's serialized read-modify-write is also the only
//! arbiter between racing nodes.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SchedulerError;
use crate::store::TaskStore;

const LANE_DEPTH: usize = 256;

tokio::task_local! {
    // Present only inside the lane worker's jobs.
    static IN_STORE_LANE: ();
}

type LaneJob = Box<dyn FnOnce(Arc<dyn TaskStore>) -> BoxFuture<'static, ()> + Send>;

pub(crate) struct StoreLane {
    tx: mpsc::Sender<LaneJob>,
    closed: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StoreLane {
    pub(crate) fn new(store: Arc<dyn TaskStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<LaneJob>(LANE_DEPTH);
        let closed = CancellationToken::new();
        let shutdown = closed.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => IN_STORE_LANE.scope((), job(Arc::clone(&store))).await,
                        None => break,
                    },
                }
            }
            debug!("store lane stopped");
        });
        Self {
            tx,
            closed,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Run one store operation on the lane and wait for its result.
    ///
    /// Waiting for the lane from inside the lane's own worker can never be
    /// served, so re-entry is rejected instead of deadlocking.
    pub(crate) async fn call<T, F, Fut>(&self, f: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(Arc<dyn TaskStore>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SchedulerError>> + Send + 'static,
        T: Send + 'static,
    {
        if IN_STORE_LANE.try_with(|_| ()).is_ok() {
            return Err(SchedulerError::SelfDeadlock);
        }
        if self.closed.is_cancelled() {
            return Err(SchedulerError::Shutdown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: LaneJob = Box::new(move |store| {
            Box::pin(async move {
                let _ = reply_tx.send(f(store).await);
            })
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| SchedulerError::Shutdown)?;
        reply_rx.await.map_err(|_| SchedulerError::Shutdown)?
    }

    /// Stop the worker; calls made after this fail with `Shutdown`.
    pub(crate) async fn close(&self) {
        self.closed.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
