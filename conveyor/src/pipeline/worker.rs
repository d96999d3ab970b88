//! Stage worker loop.
//!
//! Each worker instance repeatedly takes a job from its stage's upstream
//! hand-off channel, runs the stage's effective task and forwards the result
//! downstream. Every blocking channel operation also watches the pipeline
//! token, so a cancelled pipeline never leaves workers parked.

use super::metrics::StageMetricsStorage;
use super::stage::{FaninRule, StageKind};
use super::task::{Job, SharedTask};
use crate::errors::{PipelineError, PipelineResult};
use crate::fan::Fan;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Receiving end of a hand-off channel, shared by every worker of a stage.
pub(crate) type HandOff<J> = Arc<AsyncMutex<mpsc::Receiver<J>>>;

/// What a worker calls for each job, resolved once from the stage kind.
pub(crate) enum EffectiveTask<J: Job> {
    Plain(SharedTask<J>),
    Fanout { fan: Fan<J>, fanin: FaninRule<J> },
}

impl<J: Job> EffectiveTask<J> {
    async fn build(
        stage: &str,
        kind: &StageKind<J>,
        token: &CancellationToken,
    ) -> PipelineResult<Self> {
        match kind {
            StageKind::Plain(task) => Ok(Self::Plain(Arc::clone(task))),
            StageKind::Fanout { tasks, fanin } => Ok(Self::Fanout {
                fan: Fan::new(stage, token, tasks.clone()).await?,
                fanin: Arc::clone(fanin),
            }),
        }
    }

    async fn call(&self, stage: &str, job: J, token: &CancellationToken) -> PipelineResult<J> {
        match self {
            Self::Plain(task) => task
                .run_with_cancel(job, token.clone())
                .await
                .map_err(|e| PipelineError::task(stage, task.name(), e)),
            Self::Fanout { fan, fanin } => {
                let results = fan.fanout(job).await?;
                fanin(results).map_err(|e| PipelineError::task(stage, "fanin", e))
            }
        }
    }

    async fn shutdown(self) {
        if let Self::Fanout { fan, .. } = self {
            // Failures were already reported through call().
            let _ = fan.close().await;
        }
    }
}

/// One worker instance of one stage.
pub(crate) struct StageWorker<J: Job> {
    pub(crate) stage: String,
    pub(crate) index: usize,
    pub(crate) instance: usize,
    pub(crate) kind: Arc<StageKind<J>>,
    pub(crate) input: Option<HandOff<J>>,
    pub(crate) output: Option<mpsc::Sender<J>>,
    pub(crate) token: CancellationToken,
    pub(crate) metrics: Arc<StageMetricsStorage>,
    pub(crate) debug: bool,
}

impl<J: Job> StageWorker<J> {
    /// Run until cancelled, disconnected or failed.
    ///
    /// Cancellation and a closed channel are clean exits; a task error is
    /// returned so the owning pool cancels the rest of the pipeline.
    pub(crate) async fn run(self) -> PipelineResult<()> {
        let task = match EffectiveTask::build(&self.stage, &self.kind, &self.token).await {
            Ok(task) => task,
            Err(PipelineError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        };

        tracing::debug!(
            stage = %self.stage,
            index = self.index,
            instance = self.instance,
            "Stage worker started"
        );

        let result = self.process(&task).await;
        task.shutdown().await;

        match result {
            Err(PipelineError::Cancelled) => Ok(()),
            Err(err) => {
                self.metrics.record_failure();
                tracing::warn!(
                    stage = %self.stage,
                    instance = self.instance,
                    error = %err,
                    "Stage worker failed"
                );
                Err(err)
            }
            Ok(()) => {
                tracing::debug!(
                    stage = %self.stage,
                    instance = self.instance,
                    "Stage worker stopped"
                );
                Ok(())
            }
        }
    }

    async fn process(&self, task: &EffectiveTask<J>) -> PipelineResult<()> {
        loop {
            let job = match &self.input {
                Some(input) => match self.receive(input).await {
                    Some(job) => job,
                    None => return Ok(()),
                },
                None => {
                    if self.token.is_cancelled() {
                        return Ok(());
                    }
                    J::default()
                }
            };
            self.metrics.record_received();

            let result = task.call(&self.stage, job, &self.token).await?;

            match &self.output {
                Some(output) => {
                    if !self.send(output, result).await {
                        return Ok(());
                    }
                }
                None => drop(result),
            }
            self.metrics.record_emitted();

            if self.input.is_none() {
                // Stage 0 has no channel to park on between invocations.
                tokio::task::yield_now().await;
            }
        }
    }

    async fn receive(&self, input: &HandOff<J>) -> Option<J> {
        if self.debug {
            tracing::debug!(
                stage = %self.stage,
                instance = self.instance,
                channel = self.index - 1,
                "Reading from hand-off channel"
            );
        }

        let mut input = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            guard = input.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            job = input.recv() => job,
        }
    }

    /// Returns false if the pipeline is shutting down.
    async fn send(&self, output: &mpsc::Sender<J>, result: J) -> bool {
        if self.debug {
            tracing::debug!(
                stage = %self.stage,
                instance = self.instance,
                channel = self.index,
                "Writing to hand-off channel"
            );
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = output.send(result) => sent.is_ok(),
        }
    }
}
