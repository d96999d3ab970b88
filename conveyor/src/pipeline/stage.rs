//! Stage definition for pipeline execution.

use super::task::{Job, SharedTask};
use crate::errors::{PipelineError, PipelineResult, TaskResult};
use std::sync::Arc;

/// Combines the ordered results of a fan-out into one forwarded value.
pub type FaninRule<J> = Arc<dyn Fn(Vec<J>) -> TaskResult<J> + Send + Sync>;

/// How a stage turns a job into a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    /// A single task, called directly.
    Plain,
    /// Several tasks run concurrently on the same job, then fanned in.
    Fanout,
}

pub(crate) enum StageKind<J: Job> {
    Plain(SharedTask<J>),
    Fanout {
        tasks: Vec<SharedTask<J>>,
        fanin: FaninRule<J>,
    },
}

/// One named step of a pipeline.
///
/// A stage runs `workers` concurrent instances of its effective task, all
/// reading from the same upstream channel and writing to the same
/// downstream one.
pub struct Stage<J: Job> {
    name: String,
    workers: usize,
    pub(crate) kind: StageKind<J>,
}

impl<J: Job> Stage<J> {
    /// Create a stage running a single task on `workers` instances.
    ///
    /// A worker count of zero is treated as one.
    pub fn new(name: impl Into<String>, workers: usize, task: SharedTask<J>) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
            kind: StageKind::Plain(task),
        }
    }

    /// Create a stage that fans every job out to all `tasks`.
    ///
    /// Results are fanned in with the rule set by
    /// [`with_fanin_rule`](Self::with_fanin_rule), which defaults to keeping
    /// the result of the first task. With exactly one task this is a plain
    /// stage.
    pub fn fanout(name: impl Into<String>, workers: usize, mut tasks: Vec<SharedTask<J>>) -> Self {
        let kind = if tasks.len() == 1 {
            StageKind::Plain(tasks.remove(0))
        } else {
            StageKind::Fanout {
                tasks,
                fanin: Arc::new(first_result::<J>),
            }
        };

        Self {
            name: name.into(),
            workers: workers.max(1),
            kind,
        }
    }

    /// Set the fan-in rule. Has no effect on a plain stage.
    pub fn with_fanin_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(Vec<J>) -> TaskResult<J> + Send + Sync + 'static,
    {
        if let StageKind::Fanout { fanin, .. } = &mut self.kind {
            *fanin = Arc::new(rule);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn mode(&self) -> StageMode {
        match self.kind {
            StageKind::Plain(_) => StageMode::Plain,
            StageKind::Fanout { .. } => StageMode::Fanout,
        }
    }

    /// Number of tasks each job is handed to.
    pub fn num_tasks(&self) -> usize {
        match &self.kind {
            StageKind::Plain(_) => 1,
            StageKind::Fanout { tasks, .. } => tasks.len(),
        }
    }

    pub(crate) fn validate(&self) -> PipelineResult<()> {
        if self.num_tasks() == 0 {
            return Err(PipelineError::config(format!(
                "fan-out stage `{}` has no tasks",
                self.name
            )));
        }
        Ok(())
    }
}

/// Default fan-in: keep the first task's result, drop the rest.
pub(crate) fn first_result<J>(results: Vec<J>) -> TaskResult<J> {
    results
        .into_iter()
        .next()
        .ok_or_else(|| "fan-out produced no results".into())
}
