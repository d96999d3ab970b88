//! End-to-end pipeline behavior.

use conveyor::{
    CancellationToken, Pipeline, PipelineBuilder, PipelineError, Stage, StageMode, TaskError,
    async_task_fn, cancellable_task_fn, task_fn,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, thiserror::Error)]
#[error("invocation {0} failed")]
struct Boom(usize);

/// Stage 0 task emitting "1", "2", "3", ... on successive invocations.
fn counter(name: &str, calls: Arc<AtomicUsize>) -> Stage<String> {
    Stage::new(
        name,
        1,
        task_fn(name.to_string(), move |_job: String| {
            Ok((calls.fetch_add(1, Ordering::SeqCst) + 1).to_string())
        }),
    )
}

fn suffix(name: &str, workers: usize, tag: &'static str) -> Stage<String> {
    Stage::new(
        name,
        workers,
        task_fn(name.to_string(), move |job: String| Ok(format!("{job}{tag}"))),
    )
}

/// Last stage recording every job; cancels `stop` once `limit` were seen.
fn recorder(
    seen: Arc<Mutex<Vec<String>>>,
    limit: usize,
    stop: CancellationToken,
) -> Stage<String> {
    Stage::new(
        "record",
        1,
        task_fn("record", move |job: String| {
            let mut seen = seen.lock();
            seen.push(job.clone());
            if seen.len() >= limit {
                stop.cancel();
            }
            Ok(job)
        }),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_stage_fifo() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        suffix("b", 1, ":b"),
        Stage::new(
            "c",
            1,
            task_fn("c", {
                let seen = Arc::clone(&seen);
                let stop = stop.clone();
                move |job: String| {
                    let job = format!("{job}:c");
                    let mut seen = seen.lock();
                    seen.push(job.clone());
                    if seen.len() == 3 {
                        stop.cancel();
                    }
                    Ok(job)
                }
            }),
        ),
    ]);

    let result = timeout(LIMIT, pipeline.start_with_token(stop)).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(*seen.lock(), vec!["1:b:c", "2:b:c", "3:b:c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_over_many_jobs() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        suffix("b", 1, "!"),
        recorder(Arc::clone(&seen), 50, stop.clone()),
    ]);

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    let expected: Vec<String> = (1..=50).map(|n| format!("{n}!")).collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_workers_behaves_as_one() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        suffix("b", 0, ":b"),
        recorder(Arc::clone(&seen), 5, stop.clone()),
    ]);

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        *seen.lock(),
        vec!["1:b", "2:b", "3:b", "4:b", "5:b"]
    );
    assert_eq!(pipeline.metrics().stage("b").unwrap().workers, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanout_stage_with_concat_fanin() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    let pipeline = Pipeline::new(vec![
        Stage::new("source", 1, task_fn("source", |_: String| Ok("job".to_string()))),
        Stage::fanout(
            "fan",
            1,
            vec![
                task_fn("x", |job: String| Ok(format!("{job}:x"))),
                task_fn("y", |job: String| Ok(format!("{job}:y"))),
            ],
        )
        .with_fanin_rule(|results: Vec<String>| Ok(format!("{} {}", results[0], results[1]))),
        recorder(Arc::clone(&seen), 1, stop.clone()),
    ]);

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(seen.lock()[0], "job:x job:y");
    assert_eq!(pipeline.metrics().stage("fan").unwrap().mode, StageMode::Fanout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanout_default_fanin_keeps_first_task() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    // The first task is the slow one, so index order differs from completion order.
    let slow = async_task_fn("slow", |job: String| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, TaskError>(format!("{job}:first"))
    });
    let fast = task_fn("fast", |job: String| Ok(format!("{job}:second")));

    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::fanout("fan", 1, vec![slow, fast]),
        recorder(Arc::clone(&seen), 3, stop.clone()),
    ]);

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*seen.lock(), vec!["1:first", "2:first", "3:first"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_on_fifth_invocation() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let pipeline = Pipeline::new(vec![
        Stage::new(
            "source",
            1,
            task_fn("emit", move |_: String| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 5 {
                    return Err(Box::new(Boom(n)) as TaskError);
                }
                Ok(n.to_string())
            }),
        ),
        Stage::new(
            "sink",
            1,
            task_fn("sink", {
                let seen = Arc::clone(&seen);
                move |job: String| {
                    seen.lock().push(job.clone());
                    Ok(job)
                }
            }),
        ),
    ]);

    let err = timeout(LIMIT, pipeline.start()).await.unwrap().unwrap_err();

    match &err {
        PipelineError::Task { stage, task, .. } => {
            assert_eq!(stage, "source");
            assert_eq!(task, "emit");
        }
        other => panic!("unexpected error: {other}"),
    }
    let boom = err.task_source().unwrap().downcast_ref::<Boom>().unwrap();
    assert_eq!(boom.0, 5);

    let seen = seen.lock();
    assert!(seen.len() <= 4);
    assert!(!seen.iter().any(|job| job == "5" || job == "6"));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.stage("source").unwrap().failures, 1);
    assert_eq!(metrics.total_failures(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_stops_downstream_stages() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::new(
            "validate",
            1,
            task_fn("validate", |job: String| {
                if job == "3" {
                    return Err("job 3 is invalid".into());
                }
                Ok(job)
            }),
        ),
        Stage::new(
            "sink",
            1,
            task_fn("sink", {
                let seen = Arc::clone(&seen);
                move |job: String| {
                    seen.lock().push(job.clone());
                    Ok(job)
                }
            }),
        ),
    ]);

    let err = timeout(LIMIT, pipeline.start()).await.unwrap().unwrap_err();
    assert_eq!(err.stage(), Some("validate"));
    assert_eq!(err.task_source().unwrap().to_string(), "job 3 is invalid");

    let seen = seen.lock();
    assert!(seen.iter().all(|job| job == "1" || job == "2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanout_task_error_fails_pipeline() {
    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::fanout(
            "store",
            2,
            vec![
                task_fn("dedupe", Ok),
                task_fn("save", |job: String| {
                    if job == "4" {
                        return Err("disk full".into());
                    }
                    Ok(job)
                }),
            ],
        ),
    ]);

    let err = timeout(LIMIT, pipeline.start()).await.unwrap().unwrap_err();
    match err {
        PipelineError::Task { stage, task, .. } => {
            assert_eq!(stage, "store");
            assert_eq!(task, "save");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanin_rule_error_fails_pipeline() {
    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::fanout("merge", 1, vec![task_fn("l", Ok), task_fn("r", Ok)])
            .with_fanin_rule(|_results: Vec<String>| Err("cannot merge".into())),
    ]);

    let err = timeout(LIMIT, pipeline.start()).await.unwrap().unwrap_err();
    match err {
        PipelineError::Task { stage, task, .. } => {
            assert_eq!(stage, "merge");
            assert_eq!(task, "fanin");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_stage_workers_run_in_parallel() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();
    let barrier = Arc::new(Barrier::new(4));

    // Every job waits for three others, so progress needs four live workers.
    // The token releases jobs left waiting once the recorder has enough.
    let gated = cancellable_task_fn("gated", move |job: String, cancel: CancellationToken| {
        let barrier = Arc::clone(&barrier);
        async move {
            tokio::select! {
                _ = barrier.wait() => {}
                _ = cancel.cancelled() => {}
            }
            Ok::<_, TaskError>(job)
        }
    });

    let pipeline = PipelineBuilder::new()
        .stage(counter("a", Arc::new(AtomicUsize::new(0))))
        .stage(Stage::new("gated", 4, gated))
        .stage(recorder(Arc::clone(&seen), 8, stop.clone()))
        .build();

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    let mut seen: Vec<usize> = seen.lock().iter().map(|job| job.parse().unwrap()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_cancel_is_clean() {
    let stop = CancellationToken::new();
    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        suffix("b", 2, ":b"),
    ]);

    let canceller = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = timeout(LIMIT, pipeline.start_with_token(stop)).await.unwrap();
    assert!(result.is_ok());

    let metrics = pipeline.metrics();
    assert!(metrics.stage("a").unwrap().jobs_emitted > 0);
    assert_eq!(metrics.total_failures(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_is_clean() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(vec![
        counter("a", Arc::clone(&calls)),
        suffix("b", 1, ":b"),
    ]);

    let result = timeout(LIMIT, pipeline.start_with_timeout(Duration::from_millis(50)))
        .await
        .unwrap();

    assert!(result.is_ok());
    assert!(calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_stage_pipeline() {
    let calls = Arc::new(AtomicUsize::new(0));
    let stop = CancellationToken::new();

    let counted = Arc::clone(&calls);
    let canceller = stop.clone();
    let pipeline = Pipeline::new(vec![Stage::new(
        "only",
        1,
        task_fn("tick", move |job: String| {
            if counted.fetch_add(1, Ordering::SeqCst) + 1 == 100 {
                canceller.cancel();
            }
            Ok(job)
        }),
    )]);

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellable_task_observes_shutdown() {
    let stop = CancellationToken::new();

    // Would block forever without the token.
    let waiting = cancellable_task_fn("wait", |job: String, cancel: CancellationToken| async move {
        cancel.cancelled().await;
        Ok::<_, TaskError>(job)
    });

    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::new("wait", 1, waiting),
    ]);

    let canceller = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    assert!(timeout(LIMIT, pipeline.start_with_token(stop)).await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_panic_fails_pipeline() {
    let pipeline = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::new(
            "explode",
            1,
            task_fn("explode", |job: String| {
                if job == "2" {
                    panic!("bad job");
                }
                Ok(job)
            }),
        ),
    ]);

    let err = timeout(LIMIT, pipeline.start()).await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Panicked { ref message, .. } if message == "bad job"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_is_single_use() {
    let pipeline = Pipeline::new(vec![counter("a", Arc::new(AtomicUsize::new(0)))]);

    assert!(
        timeout(LIMIT, pipeline.start_with_timeout(Duration::from_millis(10)))
            .await
            .unwrap()
            .is_ok()
    );

    let err = pipeline.start().await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyStarted));
}

#[tokio::test]
async fn test_invalid_pipelines_are_rejected() {
    let empty: Pipeline<String> = Pipeline::new(Vec::new());
    assert!(matches!(empty.start().await, Err(PipelineError::Config(_))));

    let no_tasks = Pipeline::new(vec![
        counter("a", Arc::new(AtomicUsize::new(0))),
        Stage::fanout("empty", 1, Vec::new()),
    ]);
    let err = no_tasks.start().await.unwrap_err();
    assert!(err.to_string().contains("empty"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_debug_tracing_and_larger_channels() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    let pipeline = PipelineBuilder::new()
        .stage(counter("a", Arc::new(AtomicUsize::new(0))))
        .stage(suffix("b", 1, ":b"))
        .stage(recorder(Arc::clone(&seen), 10, stop.clone()))
        .debug(true)
        .channel_capacity(8)
        .build();
    assert!(pipeline.options().debug);

    timeout(LIMIT, pipeline.start_with_token(stop))
        .await
        .unwrap()
        .unwrap();

    let expected: Vec<String> = (1..=10).map(|n| format!("{n}:b")).collect();
    assert_eq!(*seen.lock(), expected);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.stage("record").unwrap().jobs_received, 10);
    assert!(metrics.stage("a").unwrap().jobs_received >= 10);
}
