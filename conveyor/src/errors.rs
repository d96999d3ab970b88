//! Error types shared by the pool, fan and pipeline layers.

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a user task.
///
/// Boxed so any error type can cross the task boundary with `?` or `.into()`.
pub type TaskError = Box<dyn StdError + Send + Sync + 'static>;

/// Result of a single task invocation.
pub type TaskResult<T> = std::result::Result<T, TaskError>;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by the runtime.
///
/// Cloneable so the first error can be recorded by a pool and still be
/// handed to whoever is waiting on a fan-out batch.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// A task returned an error. Terminal for the whole pipeline.
    #[error("stage `{stage}` task `{task}` failed: {source}")]
    Task {
        stage: String,
        task: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },

    /// The governing token was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("pipeline has already been started")]
    AlreadyStarted,

    #[error("internal error: {0}")]
    Internal(String),

    /// A task or worker loop panicked.
    #[error("panic in {context}: {message}")]
    Panicked { context: String, message: String },
}

impl PipelineError {
    pub fn task(stage: impl Into<String>, task: impl Into<String>, source: TaskError) -> Self {
        Self::Task {
            stage: stage.into(),
            task: task.into(),
            source: Arc::from(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The exact error a failing task returned, if this is a task error.
    pub fn task_source(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Task { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Name of the stage whose task failed.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Task { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
