//! Local adapter against a real `sh`

#![cfg(unix)]

use std::time::{Duration, Instant};
use xrun_adapter::{Adapter, AdapterState, CollectedOutput, LocalAdapter};
use xrun_command::CommandSpec;
use xrun_foundation::{Error, ExecutionOptions, LocalTarget, Result, StdinSource, Target};

async fn run(
    adapter: &LocalAdapter,
    spec: &CommandSpec,
    options: &ExecutionOptions,
    target: &Target,
) -> Result<CollectedOutput> {
    let prepared = adapter.prepare(spec, options, target)?;
    adapter.execute(prepared).await?.collect().await
}

#[tokio::test]
async fn test_echo_escaped_value() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::template("echo {}", ["a b"]).unwrap();

    let out = run(&adapter, &spec, &ExecutionOptions::new(), &Target::local()).await.unwrap();
    assert_eq!(out.stdout, b"a b\n");
    assert!(out.stderr.is_empty());
    assert!(out.status.success());
    assert_eq!(adapter.state(), AdapterState::Connected);
}

#[tokio::test]
async fn test_injection_stays_inert() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::template("printf %s {}", ["x; echo pwned"]).unwrap();

    let out = run(&adapter, &spec, &ExecutionOptions::new(), &Target::local()).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "x; echo pwned");
}

#[tokio::test]
async fn test_cwd_from_options_and_target() {
    let adapter = LocalAdapter::new();
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    let spec = CommandSpec::raw("pwd -P").unwrap();

    let options = ExecutionOptions::new().with_cwd(dir.path().to_string_lossy());
    let out = run(&adapter, &spec, &options, &Target::local()).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), expected.to_string_lossy());

    let target = Target::Local(LocalTarget {
        cwd: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    let out = run(&adapter, &spec, &ExecutionOptions::new(), &target).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), expected.to_string_lossy());
}

#[tokio::test]
async fn test_env_overlays_target_defaults() {
    let adapter = LocalAdapter::new();
    let mut target = LocalTarget::default();
    target.env.insert("XRUN_A".into(), "target".into());
    target.env.insert("XRUN_B".into(), "target".into());
    let target = Target::Local(target);

    let spec = CommandSpec::raw("printf '%s-%s' \"$XRUN_A\" \"$XRUN_B\"").unwrap();
    let options = ExecutionOptions::new().with_env("XRUN_B", "call");

    let out = run(&adapter, &spec, &options, &target).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "target-call");
}

#[tokio::test]
async fn test_stdin_is_piped() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("tr a-z A-Z").unwrap();
    let options = ExecutionOptions::new().with_stdin(StdinSource::Text("hello\n".into()));

    let out = run(&adapter, &spec, &options, &Target::local()).await.unwrap();
    assert_eq!(out.stdout, b"HELLO\n");
}

#[tokio::test]
async fn test_null_stdin_reads_eof() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("cat").unwrap();

    let out = run(&adapter, &spec, &ExecutionOptions::new(), &Target::local()).await.unwrap();
    assert!(out.stdout.is_empty());
    assert!(out.status.success());
}

#[tokio::test]
async fn test_non_zero_exit_and_stderr() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("echo out; echo err >&2; exit 3").unwrap();

    let out = run(&adapter, &spec, &ExecutionOptions::new(), &Target::local()).await.unwrap();
    assert_eq!(out.stdout, b"out\n");
    assert_eq!(out.stderr, b"err\n");
    assert_eq!(out.status.code, Some(3));
    assert!(!out.status.success());
}

#[tokio::test]
async fn test_killed_by_signal() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("kill -9 $$").unwrap();

    let out = run(&adapter, &spec, &ExecutionOptions::new(), &Target::local()).await.unwrap();
    assert_eq!(out.status.code, None);
    assert_eq!(out.status.signal.as_deref(), Some("SIGKILL"));
}

#[tokio::test]
async fn test_cancel_kills_process() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("exec sleep 10").unwrap();
    let prepared = adapter.prepare(&spec, &ExecutionOptions::new(), &Target::local()).unwrap();

    let started = Instant::now();
    let handle = adapter.execute(prepared).await.unwrap();
    let (_chunks, exit, cancel) = handle.into_parts();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), exit.wait()).await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancel_reaches_subprocesses() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("touched");
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::template("sleep 1; touch {}", [marker.display().to_string()]).unwrap();
    let prepared = adapter.prepare(&spec, &ExecutionOptions::new(), &Target::local()).unwrap();

    let (_chunks, exit, cancel) = adapter.execute(prepared).await.unwrap().into_parts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(3), exit.wait()).await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "the shell's child outlived the cancel");
}

#[tokio::test]
async fn test_cancel_with_background_job_holding_stdout() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("sleep 10 & echo hi").unwrap();
    let prepared = adapter.prepare(&spec, &ExecutionOptions::new(), &Target::local()).unwrap();

    let (mut chunks, exit, cancel) = adapter.execute(prepared).await.unwrap().into_parts();
    let first = tokio::time::timeout(Duration::from_secs(3), chunks.recv()).await.unwrap().unwrap();
    assert_eq!(first.data, b"hi\n");

    let started = Instant::now();
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(3), exit.wait()).await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_unknown_shell_is_execution_error() {
    let adapter = LocalAdapter::new();
    let spec = CommandSpec::raw("true").unwrap();
    let options = ExecutionOptions::new().with_shell("/nonexistent/xrun-shell");
    let prepared = adapter.prepare(&spec, &options, &Target::local()).unwrap();

    let err = adapter.execute(prepared).await.err().unwrap();
    assert!(matches!(err, Error::Execution(_)));
}

#[tokio::test]
async fn test_validate_rejects_other_kinds() {
    let adapter = LocalAdapter::new();
    adapter.validate(&Target::local()).await.unwrap();

    let docker = Target::Docker(xrun_foundation::DockerTarget::container("web"));
    let err = adapter.validate(&docker).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
