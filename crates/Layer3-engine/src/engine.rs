//! Execution Engine - adapter selection, timeout, retry and result normalisation

use crate::attempt::{AttemptContext, Captured};
use crate::cancel::CancelToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use xrun_adapter::{
    Adapter, DockerAdapter, KubernetesAdapter, LocalAdapter, OutputChunk, PreparedInvocation,
    RemoteDockerAdapter, SshAdapter, SshPool,
};
use xrun_command::CommandSpec;
use xrun_foundation::{
    EngineConfig, Error, ErrorKind, EventBus, EventKind, ExecutionEvent, ExecutionId, ExecutionOptions,
    ExecutionResult, ExitStatus, FailureCause, Result, Target, TargetKind,
};

// ============================================================================
// Builder
// ============================================================================

/// Assembles an [`ExecutionEngine`]
///
/// Adapters not supplied explicitly get the built-in implementation for
/// their kind. The SSH and remote-docker adapters share one session pool.
pub struct EngineBuilder {
    config: EngineConfig,
    adapters: HashMap<TargetKind, Arc<dyn Adapter>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            adapters: HashMap::new(),
        }
    }

    /// Use `adapter` for every target of its kind
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Validate the config and fill in every adapter not registered explicitly
    ///
    /// Fails with a config error before any adapter is constructed.
    pub fn build(mut self) -> Result<ExecutionEngine> {
        self.config.validate()?;
        let config = &self.config;

        let needs_ssh_pool = !self.adapters.contains_key(&TargetKind::Ssh)
            || !self.adapters.contains_key(&TargetKind::RemoteDocker);
        if needs_ssh_pool {
            let pool = SshPool::from_config(config);
            self.adapters
                .entry(TargetKind::Ssh)
                .or_insert_with(|| Arc::new(SshAdapter::with_pool(pool.clone())) as Arc<dyn Adapter>);
            self.adapters
                .entry(TargetKind::RemoteDocker)
                .or_insert_with(|| Arc::new(RemoteDockerAdapter::new(pool, config)) as Arc<dyn Adapter>);
        }
        self.adapters
            .entry(TargetKind::Local)
            .or_insert_with(|| Arc::new(LocalAdapter::new()) as Arc<dyn Adapter>);
        self.adapters
            .entry(TargetKind::Docker)
            .or_insert_with(|| Arc::new(DockerAdapter::new(config)) as Arc<dyn Adapter>);
        self.adapters
            .entry(TargetKind::Kubernetes)
            .or_insert_with(|| Arc::new(KubernetesAdapter::new(config)) as Arc<dyn Adapter>);

        let events = EventBus::new(self.config.event_capacity);
        Ok(ExecutionEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                adapters: self.adapters,
                events,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    config: EngineConfig,
    adapters: HashMap<TargetKind, Arc<dyn Adapter>>,
    events: EventBus,
    closed: AtomicBool,
}

/// Runs commands against any [`Target`]
///
/// Cheap to clone; clones share adapters, pools and the event bus.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

/// How a call ended before normalisation
struct Outcome {
    captured: Captured,
    attempts: u32,
    result: Result<ExitStatus>,
}

impl ExecutionEngine {
    /// Engine with the built-in adapters
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Progress events of every call on this engine
    pub fn events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.receiver()
    }

    /// Bus for push-style listeners
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Adapter serving `kind` targets
    pub fn adapter(&self, kind: TargetKind) -> Result<Arc<dyn Adapter>> {
        self.inner
            .adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no adapter registered for {} targets", kind)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Validation("execution engine is shut down".into()));
        }
        Ok(())
    }

    /// Check reachability and credentials of `target`
    pub async fn validate(&self, target: &Target) -> Result<()> {
        self.ensure_open()?;
        target.validate()?;
        self.adapter(target.kind())?.validate(target).await
    }

    /// Establish the transport for `target` ahead of the first call
    pub async fn connect(&self, target: &Target) -> Result<()> {
        self.ensure_open()?;
        target.validate()?;
        self.adapter(target.kind())?.connect(target).await
    }

    /// Run `spec` on `target`
    ///
    /// A non-zero exit is a normal result. Structural failures are errors,
    /// unless `options.nothrow` asks for them to be returned in the result.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
    ) -> Result<ExecutionResult> {
        self.run(spec, options, target, None, &CancelToken::new())
            .await
    }

    /// [`execute`](Self::execute) with a caller-held cancel token
    pub async fn execute_with_cancel(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        self.run(spec, options, target, None, cancel).await
    }

    pub(crate) async fn run(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
        tap: Option<&mpsc::UnboundedSender<OutputChunk>>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        let id = ExecutionId::new();
        let label = target.label();
        let started = Instant::now();

        let (outcome, command) = match self.setup(spec, options, target) {
            Ok((adapter, prepared)) => {
                let command = prepared.command_line.clone();
                let ctx = AttemptContext {
                    id,
                    label: &label,
                    adapter,
                    events: &self.inner.events,
                    timeout: options.timeout.or_else(|| self.inner.config.default_timeout()),
                    cancel_grace: self.inner.config.cancel_grace(),
                    quiet: options.quiet,
                    tap,
                    cancel,
                };
                (self.attempts(&ctx, prepared, options).await, command)
            }
            Err(e) => (
                Outcome {
                    captured: Captured::default(),
                    attempts: 0,
                    result: Err(e),
                },
                spec.to_string(),
            ),
        };

        let duration = started.elapsed();
        let Outcome {
            captured,
            attempts,
            result,
        } = outcome;
        let (stdout, stderr) = captured.into_strings();

        match result {
            Ok(status) => {
                if options.quiet {
                    debug!(endpoint = %label, exit_code = ?status.code, signal = ?status.signal, attempts, "Command finished");
                } else {
                    info!(endpoint = %label, exit_code = ?status.code, signal = ?status.signal, attempts, "Command finished");
                }
                self.publish(
                    id,
                    &label,
                    EventKind::Finished {
                        exit_code: status.code,
                        signal: status.signal.clone(),
                        success: status.success(),
                        duration,
                    },
                )
                .await;
                Ok(ExecutionResult::completed(
                    stdout, stderr, status, duration, attempts, label, command,
                ))
            }
            Err(err) => {
                warn!(endpoint = %label, error = %err, attempts, "Command failed");
                self.publish(
                    id,
                    &label,
                    EventKind::Failed {
                        cause: FailureCause::from(&err),
                    },
                )
                .await;
                if options.nothrow {
                    Ok(ExecutionResult::failed(
                        &err, stdout, stderr, duration, attempts, label, command,
                    ))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Validation and adapter selection; nothing touches the transport yet
    fn setup(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
    ) -> Result<(Arc<dyn Adapter>, PreparedInvocation)> {
        self.ensure_open()?;
        options.validate()?;
        target.validate()?;
        let adapter = self.adapter(target.kind())?;
        let prepared = adapter.prepare(spec, options, target)?;
        Ok((adapter, prepared))
    }

    async fn attempts(
        &self,
        ctx: &AttemptContext<'_>,
        prepared: PreparedInvocation,
        options: &ExecutionOptions,
    ) -> Outcome {
        let policy = options.retry_policy();
        let mut attempt = 1;
        loop {
            let (captured, result) = ctx.run(prepared.clone(), attempt).await;

            let retry = match &result {
                Ok(status) => policy.should_retry_exit(status.code, attempt),
                Err(Error::Cancelled) => false,
                Err(e) => policy.should_retry_error(e, attempt),
            };
            if !retry {
                return Outcome {
                    captured,
                    attempts: attempt,
                    result,
                };
            }

            let delay = policy.delay_for(attempt);
            let cause = match &result {
                Ok(status) => FailureCause {
                    kind: ErrorKind::Execution,
                    message: format!("exit status {:?}", status.code),
                },
                Err(e) => FailureCause::from(e),
            };
            info!(
                endpoint = %ctx.label,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                cause = %cause,
                "Retrying"
            );
            self.publish(
                ctx.id,
                ctx.label,
                EventKind::Retry {
                    attempt,
                    max_attempts: policy.max_attempts,
                    delay,
                    cause,
                },
            )
            .await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => {
                    return Outcome {
                        captured,
                        attempts: attempt,
                        result: Err(Error::Cancelled),
                    };
                }
            }
            attempt += 1;
        }
    }

    async fn publish(&self, id: ExecutionId, label: &str, kind: EventKind) {
        self.inner
            .events
            .publish(ExecutionEvent::new(id, label, kind))
            .await;
    }

    /// Close every pool and client; later calls fail with a validation error
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down execution engine");
        for (kind, adapter) in &self.inner.adapters {
            if let Err(e) = adapter.shutdown().await {
                warn!(adapter = kind.as_str(), error = %e, "Adapter shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.inner.adapters.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ExecutionEngine")
            .field("adapters", &kinds)
            .field("closed", &self.is_closed())
            .finish()
    }
}
