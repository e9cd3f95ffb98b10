//! Adapter trait - one implementation per target kind

use crate::handle::ExecutionHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use xrun_command::{CommandSpec, ShellDialect};
use xrun_foundation::{Error, ExecutionOptions, Result, StdinSource, Target, TargetKind};

/// Lifecycle state of an adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Disconnected,
    Connecting,
    Connected,
    Executing,
    Broken,
}

impl AdapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Executing => "executing",
            Self::Broken => "broken",
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Native invocation ready to run
///
/// `command_line` is already escaped for the adapter's shell dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInvocation {
    pub target: Target,
    pub command_line: String,
    pub dialect: ShellDialect,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    /// Target defaults overlaid with the call's environment
    pub env: BTreeMap<String, String>,
    pub stdin: StdinSource,
}

impl PreparedInvocation {
    /// Render `spec` for `dialect` and merge options over the target defaults
    pub fn new(
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
        dialect: ShellDialect,
    ) -> Self {
        Self {
            target: target.clone(),
            command_line: spec.to_shell_string(dialect),
            dialect,
            shell: options.shell.clone(),
            cwd: options.cwd.clone(),
            env: options.merged_env(target),
            stdin: options.stdin.clone(),
        }
    }

    pub fn label(&self) -> String {
        self.target.label()
    }
}

/// Transport adapter
///
/// `prepare` is pure. `execute` returns once the invocation is running;
/// output and exit status arrive through the returned handle.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Dialect used to escape interpolated values
    fn dialect(&self, options: &ExecutionOptions) -> ShellDialect {
        options
            .shell
            .as_deref()
            .map(ShellDialect::from_shell)
            .unwrap_or(ShellDialect::Posix)
    }

    fn prepare(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
    ) -> Result<PreparedInvocation> {
        ensure_kind(self.kind(), target)?;
        Ok(PreparedInvocation::new(spec, options, target, self.dialect(options)))
    }

    async fn execute(&self, invocation: PreparedInvocation) -> Result<ExecutionHandle>;

    /// Establish (or pre-warm) the transport for `target`
    async fn connect(&self, _target: &Target) -> Result<()> {
        Ok(())
    }

    /// Drop every transport resource held by the adapter
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Release everything for good; the engine calls this once on shutdown
    async fn shutdown(&self) -> Result<()> {
        self.disconnect().await
    }

    /// Confirm reachability and credentials before first use
    async fn validate(&self, target: &Target) -> Result<()>;

    fn state(&self) -> AdapterState;
}

/// Reject a target meant for another adapter
pub fn ensure_kind(expected: TargetKind, target: &Target) -> Result<()> {
    if target.kind() == expected {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} adapter cannot run {} target {}",
            expected.as_str(),
            target.kind().as_str(),
            target.label()
        )))
    }
}

/// Shared adapter state with an in-flight execution count
///
/// `Executing` while at least one execution runs, then back to `Connected`.
#[derive(Debug)]
pub struct StateTracker {
    adapter: &'static str,
    state: Mutex<AdapterState>,
    in_flight: AtomicUsize,
}

impl StateTracker {
    pub fn new(adapter: &'static str, initial: AdapterState) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            state: Mutex::new(initial),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn get(&self) -> AdapterState {
        *self.state.lock()
    }

    pub fn set(&self, next: AdapterState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(adapter = self.adapter, from = state.as_str(), to = next.as_str(), "Adapter state change");
            *state = next;
        }
    }

    /// Mark one execution as started; the guard ends it
    pub fn begin(self: &Arc<Self>) -> ExecutingGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.set(AdapterState::Executing);
        ExecutingGuard {
            tracker: Arc::clone(self),
            broken: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Ends one in-flight execution on drop
///
/// The tracker returns to `Connected` once nothing is in flight, or moves
/// to `Broken` if this guard was marked.
#[derive(Debug)]
pub struct ExecutingGuard {
    tracker: Arc<StateTracker>,
    broken: bool,
}

impl ExecutingGuard {
    /// The transport failed; leave the adapter `Broken`
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for ExecutingGuard {
    fn drop(&mut self) {
        let remaining = self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.broken {
            self.tracker.set(AdapterState::Broken);
        } else if remaining == 0 && self.tracker.get() == AdapterState::Executing {
            self.tracker.set(AdapterState::Connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tracker_reentrant() {
        let tracker = StateTracker::new("test", AdapterState::Connected);
        let first = tracker.begin();
        let second = tracker.begin();
        assert_eq!(tracker.get(), AdapterState::Executing);
        assert_eq!(tracker.in_flight(), 2);

        drop(first);
        assert_eq!(tracker.get(), AdapterState::Executing);
        drop(second);
        assert_eq!(tracker.get(), AdapterState::Connected);
    }

    #[test]
    fn test_broken_guard() {
        let tracker = StateTracker::new("test", AdapterState::Connected);
        let mut guard = tracker.begin();
        guard.mark_broken();
        drop(guard);
        assert_eq!(tracker.get(), AdapterState::Broken);
    }

    #[test]
    fn test_prepare_merges_env() {
        let spec = CommandSpec::template("echo {}", ["a b"]).unwrap();
        let mut target = xrun_foundation::LocalTarget::default();
        target.env.insert("A".into(), "target".into());
        target.env.insert("B".into(), "target".into());
        let target = Target::Local(target);
        let options = ExecutionOptions::new().with_env("B", "call");

        let prepared = PreparedInvocation::new(&spec, &options, &target, ShellDialect::Posix);
        assert_eq!(prepared.command_line, "echo 'a b'");
        assert_eq!(prepared.env.get("A").map(String::as_str), Some("target"));
        assert_eq!(prepared.env.get("B").map(String::as_str), Some("call"));
    }

    #[test]
    fn test_ensure_kind() {
        assert!(ensure_kind(TargetKind::Local, &Target::local()).is_ok());
        let err = ensure_kind(TargetKind::Ssh, &Target::local()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
