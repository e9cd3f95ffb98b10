//! Retry, timeout and connection accounting with a scripted adapter

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xrun_adapter::{Adapter, AdapterState, ExecutionHandle, PreparedInvocation, StateTracker};
use xrun_command::CommandSpec;
use xrun_engine::ExecutionEngine;
use xrun_foundation::{
    Backoff, EngineConfig, Error, ErrorKind, ExecutionOptions, ExitStatus, OutputStream,
    PoolConfig, Result, RetryPolicy, Target, TargetKind,
};
use xrun_pool::{ConnectionFactory, ConnectionPool};

const KEY: &str = "fake-host";

#[derive(Clone, Copy)]
enum Failure {
    Connect,
    Auth,
}

/// Fails the first `failures` handshakes
struct FlakyFactory {
    failures: AtomicU32,
    failure: Failure,
    connects: Arc<AtomicU32>,
}

#[async_trait]
impl ConnectionFactory for FlakyFactory {
    type Key = String;
    type Handle = u32;

    async fn connect(&self, key: &String) -> Result<u32> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(match self.failure {
                Failure::Connect => Error::connection(key.clone(), "handshake failed"),
                Failure::Auth => Error::authentication(key.clone(), "key rejected"),
            });
        }
        Ok(n)
    }

    async fn health_check(&self, _handle: &u32) -> bool {
        true
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Echo,
    Hang,
}

struct ScriptedAdapter {
    pool: ConnectionPool<FlakyFactory>,
    behaviour: Behaviour,
    state: Arc<StateTracker>,
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Local
    }

    async fn execute(&self, _invocation: PreparedInvocation) -> Result<ExecutionHandle> {
        let conn = self.pool.acquire(&KEY.to_string()).await?;
        let guard = self.state.begin();
        let (mut sink, handle) = ExecutionHandle::channel();
        let behaviour = self.behaviour;

        tokio::spawn(async move {
            let result = match behaviour {
                Behaviour::Echo => {
                    sink.send(OutputStream::Stdout, b"ok\n".to_vec());
                    Ok(ExitStatus::code(0))
                }
                Behaviour::Hang => {
                    sink.send(OutputStream::Stdout, b"partial".to_vec());
                    sink.cancelled().await;
                    Err(Error::Cancelled)
                }
            };
            drop(conn);
            drop(guard);
            sink.finish(result);
        });
        Ok(handle)
    }

    async fn validate(&self, _target: &Target) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }
}

struct Harness {
    engine: ExecutionEngine,
    pool: ConnectionPool<FlakyFactory>,
    connects: Arc<AtomicU32>,
}

fn harness(failures: u32, failure: Failure, behaviour: Behaviour) -> Harness {
    let connects = Arc::new(AtomicU32::new(0));
    let factory = FlakyFactory {
        failures: AtomicU32::new(failures),
        failure,
        connects: connects.clone(),
    };
    let pool = ConnectionPool::new(
        factory,
        PoolConfig {
            max_connections_per_key: 1,
            ..PoolConfig::default()
        },
    );
    let adapter = ScriptedAdapter {
        pool: pool.clone(),
        behaviour,
        state: StateTracker::new("scripted", AdapterState::Connected),
    };
    let engine = ExecutionEngine::builder(EngineConfig::default())
        .adapter(Arc::new(adapter))
        .build()
        .unwrap();
    Harness {
        engine,
        pool,
        connects,
    }
}

fn retries(max_attempts: u32) -> ExecutionOptions {
    ExecutionOptions::new().with_retry(
        RetryPolicy::attempts(max_attempts).with_backoff(Backoff::fixed(Duration::from_millis(5))),
    )
}

fn spec() -> CommandSpec {
    CommandSpec::raw("anything").unwrap()
}

#[tokio::test]
async fn test_k_failures_with_k_plus_one_attempts_succeeds() {
    let h = harness(2, Failure::Connect, Behaviour::Echo);

    let result = h.engine.execute(&spec(), &retries(3), &Target::local()).await.unwrap();
    assert!(result.success());
    assert_eq!(result.stdout(), "ok\n");
    assert_eq!(result.attempts(), 3);
    assert_eq!(h.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_k_failures_with_k_attempts_is_connection_error() {
    let h = harness(2, Failure::Connect, Behaviour::Echo);

    let err = h.engine.execute(&spec(), &retries(2), &Target::local()).await.unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert_eq!(h.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_connection_error_under_nothrow() {
    let h = harness(5, Failure::Connect, Behaviour::Echo);

    let result = h
        .engine
        .execute(&spec(), &retries(2).nothrow(), &Target::local())
        .await
        .unwrap();
    assert!(!result.success());
    assert_eq!(result.attempts(), 2);
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Connection));
}

#[tokio::test]
async fn test_authentication_is_not_retried() {
    let h = harness(1, Failure::Auth, Behaviour::Echo);

    let err = h.engine.execute(&spec(), &retries(3), &Target::local()).await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }));
    assert_eq!(h.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_events() {
    let h = harness(1, Failure::Connect, Behaviour::Echo);
    let mut events = h.engine.events();

    h.engine.execute(&spec(), &retries(2), &Target::local()).await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.kind.name());
    }
    assert_eq!(names, vec!["started", "retry", "started", "data", "finished"]);
}

#[tokio::test]
async fn test_timeout_returns_connection_to_idle() {
    let h = harness(0, Failure::Connect, Behaviour::Hang);
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_millis(100))
        .nothrow();

    let result = h.engine.execute(&spec(), &options, &Target::local()).await.unwrap();
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Timeout));
    assert_eq!(result.stdout(), "partial");

    let key = KEY.to_string();
    assert_eq!(h.pool.active_count(&key), 0);
    assert_eq!(h.pool.idle_count(&key), 1);

    // the same connection serves the next call
    let result = h.engine.execute(&spec(), &options, &Target::local()).await.unwrap();
    assert_eq!(result.cause().map(|c| c.kind), Some(ErrorKind::Timeout));
    assert_eq!(h.connects.load(Ordering::SeqCst), 1);
}
