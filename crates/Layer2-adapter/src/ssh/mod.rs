//! SSH adapter - pooled russh sessions, one exec channel per invocation

mod channel;
mod session;

pub use channel::remote_command_line;
pub(crate) use channel::run_remote;
pub use session::{SshClient, SshConnection, SshEndpoint, SshFactory, SshPool, SshSession};

use crate::adapter::{ensure_kind, Adapter, AdapterState, PreparedInvocation, StateTracker};
use crate::handle::ExecutionHandle;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use xrun_foundation::{EngineConfig, Error, Result, Target, TargetKind};

/// Runs commands over pooled SSH sessions
///
/// A session is checked out per invocation and returned when the channel
/// closes. Transport failures mark it broken so the pool discards it.
pub struct SshAdapter {
    pool: SshPool,
    state: Arc<StateTracker>,
}

impl SshAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_pool(SshPool::from_config(config))
    }

    /// Share an existing session pool (e.g. with the remote-docker adapter)
    pub fn with_pool(pool: SshPool) -> Self {
        Self {
            pool,
            state: StateTracker::new("ssh", AdapterState::Disconnected),
        }
    }

    pub fn pool(&self) -> &SshPool {
        &self.pool
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Ssh
    }

    async fn execute(&self, invocation: PreparedInvocation) -> Result<ExecutionHandle> {
        let Target::Ssh(target) = &invocation.target else {
            ensure_kind(TargetKind::Ssh, &invocation.target)?;
            return Err(Error::Internal("ssh target expected".into()));
        };

        let line = remote_command_line(
            &invocation.command_line,
            invocation.cwd.as_deref(),
            &invocation.env,
            invocation.shell.as_deref(),
        );
        let stdin = invocation.stdin.as_bytes().map(<[u8]>::to_vec);
        let guard = self.state.begin();
        run_remote(&self.pool, target, line, stdin, guard, None).await
    }

    async fn connect(&self, target: &Target) -> Result<()> {
        let Target::Ssh(ssh) = target else {
            return ensure_kind(TargetKind::Ssh, target);
        };
        self.state.set(AdapterState::Connecting);
        match self.pool.acquire(ssh).await {
            Ok(conn) => {
                info!(endpoint = %ssh.label(), connection = conn.id(), "SSH session ready");
                self.state.set(AdapterState::Connected);
                Ok(())
            }
            Err(e) => {
                self.state.set(AdapterState::Disconnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let closed = self.pool.drain().await;
        debug!(closed, "Closed idle SSH sessions");
        self.state.set(AdapterState::Disconnected);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.pool.close().await;
        self.state.set(AdapterState::Disconnected);
        Ok(())
    }

    async fn validate(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::Ssh, target)?;
        target.validate()?;
        self.connect(target).await
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }
}
