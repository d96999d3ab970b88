//! Fan-out/fan-in coordinator.
//!
//! A [`Fan`] runs every one of its tasks concurrently against the same job
//! and returns their results ordered by task index.
//!
//! ```text
//! fanout(job) ──→ distributor ──┬─→ task 0 ─┐
//!                    │          ├─→ task 1 ─┼─→ batch (index-tagged)
//!                    │          └─→ task n ─┘        │
//!                    └──── batch receiver ──→ collector ──→ [r0, r1, .. rn]
//! ```
//!
//! Distributor, collector and task invocations all run on one private
//! [`WorkerPool`] of `tasks + 2` executors.

use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::{Job, SharedTask};
use crate::pool::{Submitter, WorkerPool};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Result of one task in a batch, tagged with the task's position.
struct Tagged<J> {
    index: usize,
    result: PipelineResult<J>,
}

type Batch<J> = mpsc::Receiver<Tagged<J>>;

/// Runs a fixed set of tasks concurrently for each job.
///
/// Calls to [`fanout`](Self::fanout) are single-flight: concurrent callers
/// are served one at a time.
pub struct Fan<J: Job> {
    name: String,
    num_tasks: usize,
    pool: WorkerPool,
    jobs: mpsc::Sender<(u64, J)>,
    state: AsyncMutex<CallState<J>>,
}

/// Held for the whole of one fanout call.
struct CallState<J> {
    next_seq: u64,
    results: mpsc::Receiver<(u64, PipelineResult<Vec<J>>)>,
}

impl<J: Job> Fan<J> {
    /// Create a fan over `tasks` and start its distributor and collector.
    ///
    /// `name` identifies the owning stage in task errors. The fan's pool is
    /// cancelled together with `parent`.
    pub async fn new(
        name: impl Into<String>,
        parent: &CancellationToken,
        tasks: Vec<SharedTask<J>>,
    ) -> PipelineResult<Self> {
        let name = name.into();
        if tasks.is_empty() {
            return Err(PipelineError::config(format!(
                "fan-out `{name}` has no tasks"
            )));
        }

        let num_tasks = tasks.len();
        let pool = WorkerPool::new(parent, num_tasks + 2);

        let (jobs_tx, jobs_rx) = mpsc::channel(1);
        let (batches_tx, batches_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(1);

        let distributor = Distributor {
            name: name.clone(),
            tasks,
            jobs: jobs_rx,
            batches: batches_tx,
            pool: pool.submitter(),
            token: pool.token(),
        };
        pool.go(distributor.run()).await?;
        pool.go(collect(num_tasks, batches_rx, results_tx, pool.token()))
            .await?;

        tracing::debug!(fan = %name, num_tasks, "Fan started");

        Ok(Self {
            name,
            num_tasks,
            pool,
            jobs: jobs_tx,
            state: AsyncMutex::new(CallState {
                next_seq: 0,
                results: results_rx,
            }),
        })
    }

    /// Run every task on `job` and return their results by task index.
    ///
    /// The first task error in the batch is returned as soon as it arrives;
    /// that error also shuts the fan down, so later calls return it again.
    pub async fn fanout(&self, job: J) -> PipelineResult<Vec<J>> {
        let mut state = self.state.lock().await;
        let token = self.pool.token();

        let seq = state.next_seq;
        state.next_seq += 1;

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(self.shutdown_error()),
            sent = self.jobs.send((seq, job)) => {
                if sent.is_err() {
                    return Err(self.shutdown_error());
                }
            }
        }

        loop {
            let received = tokio::select! {
                biased;
                received = state.results.recv() => received,
                _ = token.cancelled() => None,
            };

            match received {
                Some((done, outcome)) if done == seq => return outcome,
                // Left over from a caller that gave up mid-call.
                Some(_) => continue,
                None => return Err(self.shutdown_error()),
            }
        }
    }

    /// Wait for the fan's pool to terminate.
    pub async fn wait(&self) -> PipelineResult<()> {
        self.pool.wait().await
    }

    /// Shut the fan down and wait for in-flight tasks to finish.
    pub async fn close(&self) -> PipelineResult<()> {
        self.pool.close().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks each job is handed to.
    pub fn len(&self) -> usize {
        self.num_tasks
    }

    pub fn is_empty(&self) -> bool {
        self.num_tasks == 0
    }

    fn shutdown_error(&self) -> PipelineError {
        self.pool.first_error().unwrap_or(PipelineError::Cancelled)
    }
}

struct Distributor<J: Job> {
    name: String,
    tasks: Vec<SharedTask<J>>,
    jobs: mpsc::Receiver<(u64, J)>,
    batches: mpsc::Sender<(u64, Batch<J>)>,
    pool: Submitter,
    token: CancellationToken,
}

impl<J: Job> Distributor<J> {
    async fn run(mut self) -> PipelineResult<()> {
        loop {
            let (seq, job) = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                received = self.jobs.recv() => match received {
                    Some(received) => received,
                    None => return Ok(()),
                },
            };

            // Sized to the batch so no task ever waits on the collector.
            let (batch_tx, batch_rx) = mpsc::channel(self.tasks.len());
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                sent = self.batches.send((seq, batch_rx)) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }

            for (index, task) in self.tasks.iter().enumerate() {
                let task = Arc::clone(task);
                let job = job.clone();
                let batch_tx = batch_tx.clone();
                let stage = self.name.clone();
                let token = self.token.clone();

                self.pool
                    .go(async move {
                        let result = task
                            .run_with_cancel(job, token)
                            .await
                            .map_err(|e| PipelineError::task(stage, task.name(), e));
                        let failure = result.as_ref().err().cloned();

                        let _ = batch_tx.send(Tagged { index, result }).await;

                        // Handing the error to the pool cancels the fan.
                        match failure {
                            Some(err) => Err(err),
                            None => Ok(()),
                        }
                    })
                    .await?;
            }
        }
    }
}

async fn collect<J: Job>(
    num_tasks: usize,
    mut batches: mpsc::Receiver<(u64, Batch<J>)>,
    results: mpsc::Sender<(u64, PipelineResult<Vec<J>>)>,
    token: CancellationToken,
) -> PipelineResult<()> {
    loop {
        let (seq, mut batch) = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            received = batches.recv() => match received {
                Some(received) => received,
                None => return Ok(()),
            },
        };

        let Some(outcome) = gather(num_tasks, &mut batch, &token).await else {
            return Ok(());
        };

        tokio::select! {
            biased;
            sent = results.send((seq, outcome)) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
            _ = token.cancelled() => return Ok(()),
        }
    }
}

/// Gather one batch into task order. `None` if the fan shut down first.
async fn gather<J>(
    num_tasks: usize,
    batch: &mut Batch<J>,
    token: &CancellationToken,
) -> Option<PipelineResult<Vec<J>>> {
    let mut slots: Vec<Option<J>> = (0..num_tasks).map(|_| None).collect();

    for _ in 0..num_tasks {
        let tagged = tokio::select! {
            biased;
            tagged = batch.recv() => tagged?,
            _ = token.cancelled() => return None,
        };

        match tagged.result {
            Ok(value) => slots[tagged.index] = Some(value),
            Err(err) => return Some(Err(err)),
        }
    }

    let ordered: Option<Vec<J>> = slots.into_iter().collect();
    Some(ordered.ok_or_else(|| {
        PipelineError::Internal("fan-out batch is missing a task result".to_string())
    }))
}
