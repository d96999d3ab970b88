//! Pipeline orchestration.
//!
//! Wires stages together with bounded hand-off channels, starts every stage
//! worker on one failure-propagating [`WorkerPool`] and blocks until the
//! run terminates.

use super::metrics::{PipelineMetrics, StageMetricsStorage};
use super::stage::{Stage, StageKind, StageMode};
use super::task::Job;
use super::worker::{HandOff, StageWorker};
use crate::errors::{PipelineError, PipelineResult};
use crate::options::PipelineOptions;
use crate::pool::WorkerPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Immutable per-stage data shared with that stage's workers.
struct StageEntry<J: Job> {
    name: String,
    workers: usize,
    mode: StageMode,
    kind: Arc<StageKind<J>>,
    metrics: Arc<StageMetricsStorage>,
}

/// An ordered chain of stages.
///
/// Stage *i*'s output is stage *i + 1*'s input. The first stage receives
/// `J::default()` on every invocation; the last stage's output is dropped.
///
/// Single use: once started, further `start*` calls return
/// [`PipelineError::AlreadyStarted`].
pub struct Pipeline<J: Job> {
    stages: Vec<StageEntry<J>>,
    /// First structural problem found at construction, reported by `start*`.
    invalid: Option<PipelineError>,
    options: PipelineOptions,
    started: AtomicBool,
    total_duration_ms: AtomicU64,
}

impl<J: Job> Pipeline<J> {
    pub fn new(stages: Vec<Stage<J>>) -> Self {
        Self::with_options(stages, PipelineOptions::default())
    }

    pub fn with_options(stages: Vec<Stage<J>>, options: PipelineOptions) -> Self {
        let invalid = if stages.is_empty() {
            Some(PipelineError::config("pipeline has no stages"))
        } else {
            stages.iter().find_map(|stage| stage.validate().err())
        };

        let stages = stages
            .into_iter()
            .map(|stage| StageEntry {
                name: stage.name().to_string(),
                workers: stage.workers(),
                mode: stage.mode(),
                metrics: Arc::new(StageMetricsStorage::default()),
                kind: Arc::new(stage.kind),
            })
            .collect();

        Self {
            stages,
            invalid,
            options,
            started: AtomicBool::new(false),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Run until a task fails. Blocks for as long as the pipeline runs.
    pub async fn start(&self) -> PipelineResult<()> {
        self.start_with_token(CancellationToken::new()).await
    }

    /// Run until `timeout` elapses or a task fails.
    ///
    /// Reaching the deadline is a controlled shutdown and returns `Ok(())`.
    pub async fn start_with_timeout(&self, timeout: Duration) -> PipelineResult<()> {
        let token = CancellationToken::new();
        let deadline = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        });

        let result = self.start_with_token(token).await;
        timer.abort();
        result
    }

    /// Run until `token` is cancelled or a task fails.
    ///
    /// Returns the first task error, or `Ok(())` when stopped through the
    /// token. Cancellation stops new work from being dispatched; task bodies
    /// already running are allowed to finish.
    pub async fn start_with_token(&self, token: CancellationToken) -> PipelineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }
        if let Some(err) = &self.invalid {
            return Err(err.clone());
        }

        let run_start = Instant::now();
        let total_workers: usize = self.stages.iter().map(|stage| stage.workers).sum();

        tracing::info!(
            stages = self.stages.len(),
            workers = total_workers,
            "Starting pipeline"
        );

        let pool = WorkerPool::new(&token, total_workers);
        let capacity = self.options.effective_capacity();
        let last = self.stages.len() - 1;
        let mut input: Option<HandOff<J>> = None;

        'stages: for (index, stage) in self.stages.iter().enumerate() {
            let (output, next_input) = if index < last {
                let (tx, rx) = mpsc::channel(capacity);
                (Some(tx), Some(Arc::new(AsyncMutex::new(rx))))
            } else {
                (None, None)
            };

            for instance in 0..stage.workers {
                let worker = StageWorker {
                    stage: stage.name.clone(),
                    index,
                    instance,
                    kind: Arc::clone(&stage.kind),
                    input: input.clone(),
                    output: output.clone(),
                    token: pool.token(),
                    metrics: Arc::clone(&stage.metrics),
                    debug: self.options.debug,
                };

                // Only fails once the run is already shutting down.
                if pool.go(worker.run()).await.is_err() {
                    break 'stages;
                }
            }

            input = next_input;
        }

        let result = pool.wait().await;
        self.total_duration_ms
            .store(run_start.elapsed().as_millis() as u64, Ordering::Relaxed);

        match &result {
            Ok(()) => tracing::info!(
                duration_ms = run_start.elapsed().as_millis(),
                "Pipeline stopped"
            ),
            Err(err) => tracing::warn!(
                duration_ms = run_start.elapsed().as_millis(),
                error = %err,
                "Pipeline failed"
            ),
        }

        result
    }

    /// Snapshot of the per-stage counters. Usable while the pipeline runs.
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            total_duration_ms: u128::from(self.total_duration_ms.load(Ordering::Relaxed)),
            stages: self
                .stages
                .iter()
                .enumerate()
                .map(|(index, stage)| {
                    stage
                        .metrics
                        .snapshot(index, &stage.name, stage.mode, stage.workers)
                })
                .collect(),
        }
    }
}

/// Builds a [`Pipeline`] stage by stage.
///
/// ```
/// use conveyor::{PipelineBuilder, Stage, task_fn};
///
/// let pipeline = PipelineBuilder::new()
///     .stage(Stage::new("produce", 1, task_fn("one", |_: u64| Ok(1))))
///     .stage(Stage::new("double", 2, task_fn("double", |n: u64| Ok(n * 2))))
///     .debug(true)
///     .build();
/// assert_eq!(pipeline.num_stages(), 2);
/// ```
pub struct PipelineBuilder<J: Job> {
    stages: Vec<Stage<J>>,
    options: PipelineOptions,
}

impl<J: Job> Default for PipelineBuilder<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Job> PipelineBuilder<J> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            options: PipelineOptions::default(),
        }
    }

    /// Append a stage after the ones already added.
    pub fn stage(mut self, stage: Stage<J>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.options.debug = debug;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.options.channel_capacity = capacity;
        self
    }

    pub fn build(self) -> Pipeline<J> {
        Pipeline::with_options(self.stages, self.options)
    }
}
