//! Fixed-size worker pool.
//!
//! A [`WorkerPool`] owns a set of executor tasks that drain one shared,
//! bounded work queue. Work items are futures returning
//! [`PipelineResult<()>`]. The first item that fails records its error and
//! cancels the pool; executors then stop taking work and [`WorkerPool::wait`]
//! reports that error.
//!
//! ```text
//! go() ──→ [queue, cap 1] ──→ executor 0..n ──→ work.await
//!                                   │
//!                         first Err ┴──→ first_error + token.cancel()
//!
//! watcher: token.cancelled() ──→ queue closed
//! ```
//!
//! Cancellation is cooperative: work already running is never aborted.

use crate::errors::{PipelineError, PipelineResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

type Work = BoxFuture<'static, PipelineResult<()>>;

/// The queue holds at most one pending item, so `go` applies back-pressure
/// as soon as every executor is busy.
const QUEUE_CAPACITY: usize = 1;

/// Pool of executors draining a shared work queue.
///
/// **Cloning**: cheap, all clones drive the same pool. When the last clone is
/// dropped the pool is cancelled.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    _cancel_on_drop: Arc<DropGuard>,
}

struct PoolInner {
    queue_tx: mpsc::Sender<Work>,
    queue_rx: AsyncMutex<mpsc::Receiver<Work>>,
    token: CancellationToken,
    tracker: TaskTracker,
    first_error: Mutex<Option<PipelineError>>,
    num_workers: AtomicUsize,
}

impl WorkerPool {
    /// Start `num_workers` executors plus one watcher that closes the queue
    /// once the pool is cancelled.
    ///
    /// The pool's token is a child of `parent`: cancelling `parent` shuts the
    /// pool down, while a failure inside the pool does not touch `parent`.
    pub fn new(parent: &CancellationToken, num_workers: usize) -> Self {
        let token = parent.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);

        let tracker = TaskTracker::new();
        // Closed up front so wait() returns as soon as the tracked set drains.
        tracker.close();

        let inner = Arc::new(PoolInner {
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            token: token.clone(),
            tracker,
            first_error: Mutex::new(None),
            num_workers: AtomicUsize::new(0),
        });

        let watcher = Arc::clone(&inner);
        inner.tracker.spawn(async move {
            watcher.token.cancelled().await;
            watcher.queue_rx.lock().await.close();
        });

        let pool = Self {
            inner,
            _cancel_on_drop: Arc::new(token.drop_guard()),
        };
        pool.add_workers(num_workers);

        tracing::debug!(num_workers, "Worker pool started");
        pool
    }

    /// Start `num_workers` more executors on the same queue.
    pub fn add_workers(&self, num_workers: usize) {
        self.inner.num_workers.fetch_add(num_workers, Ordering::Relaxed);
        for _ in 0..num_workers {
            self.inner.tracker.spawn(run_executor(Arc::clone(&self.inner)));
        }
    }

    /// Number of executors started so far.
    pub fn num_workers(&self) -> usize {
        self.inner.num_workers.load(Ordering::Relaxed)
    }

    /// Submit work, suspending until the queue accepts it.
    ///
    /// Fails with the pool's first error (or [`PipelineError::Cancelled`])
    /// once the pool is shutting down.
    pub async fn go<F>(&self, work: F) -> PipelineResult<()>
    where
        F: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        self.inner.submit(Box::pin(work)).await
    }

    /// Wait until every executor and the watcher have exited.
    ///
    /// Returns the first error any work item produced, or `Ok(())` if the
    /// pool was shut down through cancellation.
    pub async fn wait(&self) -> PipelineResult<()> {
        self.inner.tracker.wait().await;
        match self.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel the pool, then wait for it to terminate.
    pub async fn close(&self) -> PipelineResult<()> {
        self.inner.token.cancel();
        self.wait().await
    }

    /// Token governing this pool. Work items may observe it to stop early.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn first_error(&self) -> Option<PipelineError> {
        self.inner.first_error.lock().clone()
    }

    /// Submission handle that does not keep the pool alive.
    ///
    /// For work items that submit more work to their own pool.
    pub(crate) fn submitter(&self) -> Submitter {
        Submitter {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Submits work to a pool without holding its cancel-on-drop guard.
pub(crate) struct Submitter {
    inner: Arc<PoolInner>,
}

impl Submitter {
    pub(crate) async fn go<F>(&self, work: F) -> PipelineResult<()>
    where
        F: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        self.inner.submit(Box::pin(work)).await
    }
}

impl PoolInner {
    async fn submit(&self, work: Work) -> PipelineResult<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.shutdown_error()),
            sent = self.queue_tx.send(work) => sent.map_err(|_| self.shutdown_error()),
        }
    }

    /// Record `err` if it is the first one, then cancel the pool.
    fn fail(&self, err: PipelineError) {
        {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                tracing::debug!(error = %err, "Worker pool failed, cancelling");
                *slot = Some(err);
            }
        }
        self.token.cancel();
    }

    fn shutdown_error(&self) -> PipelineError {
        self.first_error
            .lock()
            .clone()
            .unwrap_or(PipelineError::Cancelled)
    }
}

async fn run_executor(inner: Arc<PoolInner>) {
    loop {
        let work = {
            let mut queue = inner.queue_rx.lock().await;
            tokio::select! {
                biased;
                _ = inner.token.cancelled() => None,
                work = queue.recv() => work,
            }
        };
        let Some(work) = work else {
            break;
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => {}
            // Work that saw cancellation is a clean exit, not a failure.
            Ok(Err(PipelineError::Cancelled)) => {}
            Ok(Err(err)) => {
                inner.fail(err);
                break;
            }
            Err(panic) => {
                inner.fail(PipelineError::Panicked {
                    context: "worker pool".to_string(),
                    message: panic_message(panic.as_ref()),
                });
                break;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
