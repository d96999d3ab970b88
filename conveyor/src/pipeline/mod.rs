//! Staged pipeline execution.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline → Stages → Worker instances → Task (plain) | Fan (fan-out)
//!
//! stage 0 ──C0──→ stage 1 ──C1──→ ... ──→ stage n (output dropped)
//!
//! - Pipeline: creates hand-off channels, runs all workers on one pool
//! - Stage: a named task (or task set) with a worker count
//! - Worker: loop of receive → effective task → send
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::{Pipeline, Stage, task_fn};
//!
//! let pipeline = Pipeline::new(vec![
//!     Stage::new("read", 1, task_fn("read", |_: String| Ok(next_line()))),
//!     Stage::fanout("store", 4, vec![
//!         task_fn("dedupe", dedupe),
//!         task_fn("save", save),
//!     ]),
//! ]);
//!
//! pipeline.start_with_token(shutdown).await?;
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;
mod worker;

pub use metrics::{PipelineMetrics, StageMetrics};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use stage::{FaninRule, Stage, StageMode};
pub use task::{
    AsyncFnTask, CancellableFnTask, FnTask, Job, PipelineTask, SharedTask, async_task_fn,
    cancellable_task_fn, task_fn,
};
