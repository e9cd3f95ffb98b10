//! End-to-end engine behaviour against the local adapter

#![cfg(unix)]

use futures::StreamExt;
use std::time::{Duration, Instant};
use xrun_command::{CommandSpec, Segment};
use xrun_engine::{ExecutionEngine, Job, ParallelOptions};
use xrun_foundation::{
    Backoff, EngineConfig, Error, ErrorKind, EventKind, ExecutionOptions, ExitCodeRetry,
    RetryPolicy, Target,
};

fn engine() -> ExecutionEngine {
    ExecutionEngine::new(EngineConfig::default()).unwrap()
}

fn sh(line: &str) -> CommandSpec {
    CommandSpec::raw(line).unwrap()
}

#[tokio::test]
async fn test_echo_scenario() {
    let spec = CommandSpec::build([Segment::literal("echo "), Segment::value("a b")]).unwrap();
    let result = engine()
        .execute(&spec, &ExecutionOptions::new(), &Target::local())
        .await
        .unwrap();

    assert_eq!(result.stdout(), "a b\n");
    assert_eq!(result.exit_code(), Some(0));
    assert!(result.success());
    assert_eq!(result.attempts(), 1);
    assert_eq!(result.command(), "echo 'a b'");
    assert_eq!(result.target(), "local");
}

#[tokio::test]
async fn test_nothrow_is_idempotent() {
    let engine = engine();
    let spec = CommandSpec::template("echo {}", ["same"]).unwrap();
    let options = ExecutionOptions::new().nothrow();

    let first = engine.execute(&spec, &options, &Target::local()).await.unwrap();
    let second = engine.execute(&spec, &options, &Target::local()).await.unwrap();
    assert_eq!(first.stdout(), second.stdout());
    assert_eq!(first.exit_code(), second.exit_code());
}

#[tokio::test]
async fn test_non_zero_exit_is_a_result() {
    let result = engine()
        .execute(&sh("echo oops >&2; exit 3"), &ExecutionOptions::new(), &Target::local())
        .await
        .unwrap();

    assert!(!result.success());
    assert_eq!(result.exit_code(), Some(3));
    assert_eq!(result.stderr(), "oops\n");
    assert!(result.cause().is_none());
}

#[tokio::test]
async fn test_timeout_cancels_command() {
    let options = ExecutionOptions::new().with_timeout(Duration::from_millis(200));
    let started = Instant::now();

    let err = engine()
        .execute(&sh("exec sleep 10"), &options, &Target::local())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_timeout_under_nothrow_keeps_partial_output() {
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_millis(300))
        .nothrow();

    let result = engine()
        .execute(&sh("echo started; exec sleep 10"), &options, &Target::local())
        .await
        .unwrap();

    assert!(!result.success());
    assert_eq!(result.stdout(), "started\n");
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_timeout_stops_compound_command() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("late");
    let spec = CommandSpec::template("(sleep 1; touch {}); true", [marker.display().to_string()]).unwrap();
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_millis(200))
        .nothrow();

    let result = engine().execute(&spec, &options, &Target::local()).await.unwrap();
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Timeout));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "subshell kept running after the timeout");
}

#[tokio::test]
async fn test_timeout_with_background_job_holding_stdout() {
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_millis(300))
        .nothrow();
    let started = Instant::now();

    let result = engine()
        .execute(&sh("sleep 10 & echo hi"), &options, &Target::local())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1200));
    assert_eq!(result.stdout(), "hi\n");
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_validation_failure_and_nothrow() {
    let engine = engine();
    let options = ExecutionOptions::new().with_env("NOT-VALID", "x");

    let err = engine
        .execute(&sh("true"), &options, &Target::local())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let result = engine
        .execute(&sh("true"), &options.clone().nothrow(), &Target::local())
        .await
        .unwrap();
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Validation));
    assert_eq!(result.attempts(), 0);
}

#[tokio::test]
async fn test_exit_code_retry_is_opt_in() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let spec = CommandSpec::template(
        "n=$(cat {} 2>/dev/null || echo 0); n=$((n + 1)); echo $n > {}; [ $n -ge 3 ]",
        [counter.to_string_lossy().into_owned(), counter.to_string_lossy().into_owned()],
    )
    .unwrap();
    let engine = engine();

    // structural-only policy leaves the exit alone
    let options = ExecutionOptions::new().with_retry(RetryPolicy::attempts(5));
    let result = engine.execute(&spec, &options, &Target::local()).await.unwrap();
    assert_eq!(result.exit_code(), Some(1));
    assert_eq!(result.attempts(), 1);

    let policy = RetryPolicy::attempts(5)
        .with_backoff(Backoff::fixed(Duration::from_millis(10)))
        .with_exit_codes(ExitCodeRetry::AnyNonZero);
    let result = engine
        .execute(&spec, &ExecutionOptions::new().with_retry(policy), &Target::local())
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.attempts(), 2);
}

#[tokio::test]
async fn test_progress_events() {
    let engine = engine();
    let mut events = engine.events();
    engine
        .execute(&sh("printf hello"), &ExecutionOptions::new(), &Target::local())
        .await
        .unwrap();

    let mut names = Vec::new();
    let mut data = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.kind.name());
        if let EventKind::Data { data: chunk, .. } = event.kind {
            data.extend(chunk);
        }
    }
    assert_eq!(names.first(), Some(&"started"));
    assert_eq!(names.last(), Some(&"finished"));
    assert_eq!(data, b"hello");
}

#[tokio::test]
async fn test_quiet_suppresses_data_events() {
    let engine = engine();
    let mut events = engine.events();
    engine
        .execute(&sh("printf hello"), &ExecutionOptions::new().quiet(), &Target::local())
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.kind.name());
    }
    assert_eq!(names, vec!["started", "finished"]);
}

#[tokio::test]
async fn test_streaming_matches_buffered_result() {
    let engine = engine();
    let mut run = engine.execute_streaming(
        &sh("echo one; sleep 0.1; echo two >&2; echo three"),
        &ExecutionOptions::new(),
        &Target::local(),
    );

    let mut live = Vec::new();
    while let Some(chunk) = run.chunks.next().await {
        live.push(chunk);
    }
    let result = run.result.await.unwrap();

    let stdout: Vec<u8> = live
        .iter()
        .filter(|c| c.stream == xrun_foundation::OutputStream::Stdout)
        .flat_map(|c| c.data.clone())
        .collect();
    assert_eq!(stdout, result.stdout().as_bytes());
    assert_eq!(result.stdout(), "one\nthree\n");
    assert_eq!(result.stderr(), "two\n");
}

#[tokio::test]
async fn test_streaming_cancel() {
    let engine = engine();
    let run = engine.execute_streaming(&sh("exec sleep 10"), &ExecutionOptions::new(), &Target::local());
    tokio::time::sleep(Duration::from_millis(100)).await;
    run.cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(3), run.result)
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_parallel_keeps_input_order() {
    let jobs = vec![
        Job::new(sh("sleep 0.3; echo 0"), Target::local()),
        Job::new(sh("echo 1"), Target::local()),
        Job::new(sh("sleep 0.1; echo 2"), Target::local()),
        Job::new(sh("exit 4"), Target::local()),
    ];

    let results = engine().execute_all(jobs, ParallelOptions::default()).await;
    assert_eq!(results.len(), 4);
    for (i, result) in results.iter().take(3).enumerate() {
        assert_eq!(result.as_ref().unwrap().text(), i.to_string());
    }
    // one failure does not cancel the others
    assert_eq!(results[3].as_ref().unwrap().exit_code(), Some(4));
}

#[tokio::test]
async fn test_parallel_fail_fast() {
    let jobs = vec![
        Job::new(sh("exit 1"), Target::local()),
        Job::new(sh("exec sleep 10"), Target::local()),
        Job::new(sh("exec sleep 10"), Target::local()),
    ];
    let started = Instant::now();

    let results = engine()
        .execute_all(
            jobs,
            ParallelOptions {
                max_concurrency: Some(2),
                fail_fast: true,
            },
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(results[0].as_ref().unwrap().exit_code(), Some(1));
    assert!(matches!(results[1], Err(Error::Cancelled)));
    assert!(matches!(results[2], Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_shutdown_rejects_later_calls() {
    let engine = engine();
    engine.shutdown().await;
    assert!(engine.is_closed());

    let err = engine
        .execute(&sh("true"), &ExecutionOptions::new(), &Target::local())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
