//! Task trait and closure adapters for pipeline stages.

use crate::errors::TaskResult;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Payload type flowing through a pipeline.
///
/// `Default` provides the implicit input of the first stage; `Clone` lets a
/// fan-out stage hand the same job to every task.
pub trait Job: Clone + Default + Send + 'static {}

impl<T> Job for T where T: Clone + Default + Send + 'static {}

/// Trait for tasks that can be executed by a pipeline stage.
///
/// A task turns one job into one result. Any error is fatal to the pipeline.
#[async_trait]
pub trait PipelineTask<J>: Send + Sync
where
    J: Send + 'static,
{
    /// Process one job.
    async fn run(&self, job: J) -> TaskResult<J>;

    /// Process one job with the token governing this invocation.
    ///
    /// The runtime always calls this entry point. The default ignores the
    /// token; override it in tasks that can stop early.
    async fn run_with_cancel(&self, job: J, cancel: CancellationToken) -> TaskResult<J> {
        let _ = cancel;
        self.run(job).await
    }

    /// Get human-readable task name for logging.
    fn name(&self) -> &str;
}

/// Task shared between every worker instance of a stage.
pub type SharedTask<J> = Arc<dyn PipelineTask<J>>;

/// Task backed by a synchronous closure. See [`task_fn`].
pub struct FnTask<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<J, F> PipelineTask<J> for FnTask<F>
where
    J: Send + 'static,
    F: Fn(J) -> TaskResult<J> + Send + Sync,
{
    async fn run(&self, job: J) -> TaskResult<J> {
        (self.f)(job)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Task backed by a closure returning a future. See [`async_task_fn`].
pub struct AsyncFnTask<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<J, F, Fut> PipelineTask<J> for AsyncFnTask<F>
where
    J: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<J>> + Send + 'static,
{
    async fn run(&self, job: J) -> TaskResult<J> {
        (self.f)(job).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Task backed by a closure that also receives the cancellation token.
/// See [`cancellable_task_fn`].
pub struct CancellableFnTask<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<J, F, Fut> PipelineTask<J> for CancellableFnTask<F>
where
    J: Send + 'static,
    F: Fn(J, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<J>> + Send + 'static,
{
    async fn run(&self, job: J) -> TaskResult<J> {
        (self.f)(job, CancellationToken::new()).await
    }

    async fn run_with_cancel(&self, job: J, cancel: CancellationToken) -> TaskResult<J> {
        (self.f)(job, cancel).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a plain `(job) -> result` function as a shared task.
///
/// ```
/// use conveyor::task_fn;
///
/// let upper = task_fn("upper", |job: String| Ok(job.to_uppercase()));
/// assert_eq!(upper.name(), "upper");
/// ```
pub fn task_fn<J, F>(name: impl Into<String>, f: F) -> SharedTask<J>
where
    J: Send + 'static,
    F: Fn(J) -> TaskResult<J> + Send + Sync + 'static,
{
    Arc::new(FnTask {
        name: name.into(),
        f,
    })
}

/// Wrap an async function as a shared task.
pub fn async_task_fn<J, F, Fut>(name: impl Into<String>, f: F) -> SharedTask<J>
where
    J: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<J>> + Send + 'static,
{
    Arc::new(AsyncFnTask {
        name: name.into(),
        f,
    })
}

/// Wrap an async function that observes the pipeline's cancellation token.
///
/// Cancellation never aborts a running task; this lets long tasks return
/// early on their own.
pub fn cancellable_task_fn<J, F, Fut>(name: impl Into<String>, f: F) -> SharedTask<J>
where
    J: Send + 'static,
    F: Fn(J, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<J>> + Send + 'static,
{
    Arc::new(CancellableFnTask {
        name: name.into(),
        f,
    })
}
