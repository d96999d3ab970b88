//! Multi-stage worker pipelines with fan-out/fan-in, on tokio.
//!
//! Build a [`Pipeline`] out of [`Stage`]s, each running one task (or, for a
//! fan-out stage, several tasks concurrently per job) on a fixed number of
//! worker instances. Stages are connected by bounded hand-off channels. A
//! run ends when its cancellation token fires or when any task fails; the
//! first failure is returned.
//!
//! Layers, bottom up:
//! - [`pool::WorkerPool`]: executors draining a shared queue, first error wins
//! - [`fan::Fan`]: runs a task set on one job, results ordered by task index
//! - [`Stage`] / [`Pipeline`]: declarative stages and the orchestrator

pub mod errors;
pub mod fan;
pub mod options;
pub mod pipeline;
pub mod pool;

pub use errors::{PipelineError, PipelineResult, TaskError, TaskResult};
pub use fan::Fan;
pub use options::PipelineOptions;
pub use pipeline::{
    FaninRule, Job, Pipeline, PipelineBuilder, PipelineMetrics, PipelineTask, SharedTask, Stage,
    StageMetrics, StageMode, async_task_fn, cancellable_task_fn, task_fn,
};
pub use pool::WorkerPool;
pub use tokio_util::sync::CancellationToken;
