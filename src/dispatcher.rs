//! Runs jobs concurrently and reports each completion to a single callback.
//!
//! Every started job gets its own worker task, which performs the call and
//! posts the job's id on a bounded completion channel. One monitor task, owned
//! by the [`Dispatcher`], drains that channel, marks the job done and invokes
//! the callback.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::select;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::executor::Executor;
use crate::types::job::{CompletedJob, Job, JobId};
use crate::types::states::JobStatus;

/// Capacity of the completion channel.
const COMPLETION_BACKLOG: usize = 16;

/// Shared access to a registered job. Workers hold the lock for the whole
/// call, so locking it blocks until the job has been performed.
pub type JobHandle = Arc<AsyncMutex<Job>>;

/// Invoked on the monitor task once per finished job. It must not block for
/// long: completions queue up behind it.
pub type CompletionCallback = Arc<dyn Fn(&CompletedJob) + Send + Sync>;

struct Entry {
    job: JobHandle,
    status: JobStatus,
    done_at: Option<Instant>,
}

struct Shared {
    registry: Mutex<HashMap<JobId, Entry>>,
    /// Number of workers that have not yet finished performing.
    in_flight: watch::Sender<usize>,
    executor: Executor,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        // Entries stay consistent even if a holder panicked.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a Ready job to Running, handing back its handle. Doing this under
    /// the registry lock means racing `start_job` calls start one worker.
    fn claim(&self, id: JobId) -> Option<JobHandle> {
        let mut registry = self.registry();
        let entry = registry.get_mut(&id)?;

        if entry.status != JobStatus::Ready {
            return None;
        }
        entry.status.advance(JobStatus::Running);

        Some(entry.job.clone())
    }

    fn mark_done(&self, id: JobId) {
        if let Some(entry) = self.registry().get_mut(&id) {
            if entry.status.advance(JobStatus::Done) {
                entry.done_at = Some(Instant::now());
            }
        }
    }

    fn handle(&self, id: JobId) -> Option<JobHandle> {
        self.registry().get(&id).map(|e| e.job.clone())
    }
}

/// Decrements the in-flight count when a worker ends, however it ends.
struct InFlight(Arc<Shared>);

impl InFlight {
    fn enter(shared: Arc<Shared>) -> Self {
        shared.in_flight.send_modify(|n| *n += 1);
        Self(shared)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n -= 1);
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    done_tx: mpsc::Sender<JobId>,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no completion callback. Must be called from
    /// within a tokio runtime, as it spawns the monitor task.
    pub fn new(executor: Executor) -> Self {
        Self::build(executor, None)
    }

    pub fn with_callback<F>(executor: Executor, callback: F) -> Self
    where
        F: Fn(&CompletedJob) + Send + Sync + 'static,
    {
        Self::build(executor, Some(Arc::new(callback)))
    }

    fn build(executor: Executor, callback: Option<CompletionCallback>) -> Self {
        let (in_flight, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            in_flight,
            executor,
        });
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_BACKLOG);
        let cancel = CancellationToken::new();

        let monitor = tokio::spawn(
            monitor(shared.clone(), done_rx, callback, cancel.clone())
                .instrument(info_span!("monitor")),
        );

        Self {
            shared,
            next_id: AtomicU64::new(1),
            done_tx,
            cancel,
            monitor: Some(monitor),
        }
    }

    /// Stores `job` as Ready under a fresh id. Nothing runs until
    /// [`start_job`](Self::start_job).
    pub fn register_job(&self, job: Job) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.shared.registry().insert(
            id,
            Entry {
                job: Arc::new(AsyncMutex::new(job)),
                status: JobStatus::Ready,
                done_at: None,
            },
        );
        trace!(%id, "registered job");

        id
    }

    /// Launches a worker for the job if it is registered and Ready; otherwise
    /// does nothing.
    pub fn start_job(&self, id: JobId) {
        let Some(job) = self.shared.claim(id) else {
            trace!(%id, "job missing or not ready, not starting");
            return;
        };

        let in_flight = InFlight::enter(self.shared.clone());
        let executor = self.shared.executor.clone();
        let done_tx = self.done_tx.clone();

        tokio::spawn(
            async move {
                let _in_flight = in_flight;

                {
                    let mut job = job.lock().await;
                    if let Err(error) = executor.perform(&mut job).await {
                        warn!(%error, "job failed");
                    }
                }

                if done_tx.send(id).await.is_err() {
                    debug!("dispatcher shut down, completion not reported");
                }
            }
            .instrument(info_span!("worker", %id)),
        );
    }

    /// Waits until every worker started so far has finished performing its
    /// call. Completion callbacks for those jobs may still be pending; use
    /// [`shutdown`](Self::shutdown) to also wait for them.
    pub async fn wait_sync_for_jobs(&self) {
        let mut in_flight = self.shared.in_flight.subscribe();
        // The sender lives in `shared`, which outlives this borrow.
        let _ = in_flight.wait_for(|n| *n == 0).await;
    }

    pub fn job(&self, id: JobId) -> Option<JobHandle> {
        self.shared.handle(id)
    }

    /// Status of the job, or Undefined if it isn't registered.
    pub fn status(&self, id: JobId) -> JobStatus {
        self.shared
            .registry()
            .get(&id)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    /// Removes the job from the registry, handing it back. Callers should
    /// clear jobs once they have consumed the results.
    pub fn clear_job(&self, id: JobId) -> Option<JobHandle> {
        self.shared.registry().remove(&id).map(|e| e.job)
    }

    /// Removes Done jobs that finished more than `older_than` ago, returning
    /// how many were removed.
    pub fn purge_done(&self, older_than: Duration) -> usize {
        let mut registry = self.shared.registry();
        let before = registry.len();

        registry.retain(|_, e| match e.done_at {
            Some(at) => at.elapsed() < older_than,
            None => true,
        });

        before - registry.len()
    }

    pub fn len(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the monitor after it has handled every completion already
    /// queued. Following [`wait_sync_for_jobs`](Self::wait_sync_for_jobs),
    /// this guarantees all callbacks for those jobs have run.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        if let Some(monitor) = self.monitor.take() {
            if let Err(error) = monitor.await {
                warn!(%error, "monitor task failed");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn monitor(
    shared: Arc<Shared>,
    mut done_rx: mpsc::Receiver<JobId>,
    callback: Option<CompletionCallback>,
    cancel: CancellationToken,
) {
    loop {
        let id = select! {
            id = done_rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        complete(&shared, id, callback.as_ref()).await;
    }

    // Drain what was already reported before stopping.
    done_rx.close();
    while let Ok(id) = done_rx.try_recv() {
        complete(&shared, id, callback.as_ref()).await;
    }

    debug!("monitor stopped");
}

/// Marks the job Done and runs the callback on a snapshot. The job lock is
/// released before the callback runs, so the callback may touch the
/// dispatcher, this job included.
async fn complete(
    shared: &Shared,
    id: JobId,
    callback: Option<&CompletionCallback>,
) {
    let Some(handle) = shared.handle(id) else {
        debug!(%id, "job cleared before its completion was handled");
        return;
    };

    let snapshot = {
        let job = handle.lock().await;
        shared.mark_done(id);
        job.snapshot(id)
    };
    trace!(%id, status = ?snapshot.status, "job done");

    if let Some(callback) = callback {
        callback(&snapshot);
    }
}
