//! SSH sessions - connection factory and shared pool

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh_keys::key;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use xrun_foundation::{EngineConfig, Error, PoolConfig, Result, SshConfig, SshTarget};
use xrun_pool::{ConnectionFactory, ConnectionPool, PooledConnection};

/// Pool identity of an SSH target: host, port and user
///
/// Carries the whole target so the factory has the credentials, but
/// credentials take no part in equality.
#[derive(Debug, Clone)]
pub struct SshEndpoint(pub SshTarget);

impl PartialEq for SshEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.0.host == other.0.host && self.0.port == other.0.port && self.0.user == other.0.user
    }
}

impl Eq for SshEndpoint {}

impl Hash for SshEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.host.hash(state);
        self.0.port.hash(state);
        self.0.user.hash(state);
    }
}

impl std::fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.label())
    }
}

/// russh client callbacks
pub struct SshClient {
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, port = self.port, "Host key not in known_hosts, accepting");
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => {
                error!(host = %self.host, port = self.port, line, "Host key changed, refusing connection");
                Ok(false)
            }
            Err(e) => {
                debug!(host = %self.host, error = %e, "known_hosts unavailable, accepting host key");
                Ok(true)
            }
        }
    }
}

/// Authenticated SSH session
pub struct SshSession {
    pub(crate) handle: client::Handle<SshClient>,
}

impl SshSession {
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Opens and authenticates SSH sessions
pub struct SshFactory {
    config: SshConfig,
}

impl SshFactory {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn client_config(&self, target: &SshTarget) -> client::Config {
        client::Config {
            inactivity_timeout: self.config.inactivity_timeout(),
            keepalive_interval: target.keep_alive.then(|| self.config.keepalive_interval()),
            ..Default::default()
        }
    }

    async fn authenticate(
        handle: &mut client::Handle<SshClient>,
        target: &SshTarget,
    ) -> Result<()> {
        let label = target.label();
        let mut accepted = false;

        if let Some(path) = &target.private_key {
            let pair = russh_keys::load_secret_key(path, target.passphrase.as_deref()).map_err(|e| {
                Error::authentication(
                    &label,
                    format!("cannot load private key {}: {}", path.display(), e),
                )
            })?;
            accepted = handle
                .authenticate_publickey(&target.user, Arc::new(pair))
                .await
                .map_err(|e| Error::connection(&label, format!("public key authentication failed: {}", e)))?;
        }

        if !accepted {
            if let Some(password) = &target.password {
                accepted = handle
                    .authenticate_password(&target.user, password)
                    .await
                    .map_err(|e| Error::connection(&label, format!("password authentication failed: {}", e)))?;
            }
        }

        if accepted {
            Ok(())
        } else {
            Err(Error::authentication(label, "server rejected the supplied credentials"))
        }
    }
}

#[async_trait]
impl ConnectionFactory for SshFactory {
    type Key = SshEndpoint;
    type Handle = SshSession;

    async fn connect(&self, key: &SshEndpoint) -> Result<SshSession> {
        let target = &key.0;
        let label = target.label();
        let handler = SshClient {
            host: target.host.clone(),
            port: target.port,
        };
        let limit = self.config.connect_timeout();

        debug!(endpoint = %label, "Opening SSH session");
        let connecting = client::connect(
            Arc::new(self.client_config(target)),
            (target.host.as_str(), target.port),
            handler,
        );
        let mut handle = tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| Error::connection(&label, format!("connect timed out after {:?}", limit)))?
            .map_err(|e| Error::connection(&label, e.to_string()))?;

        Self::authenticate(&mut handle, target).await?;
        Ok(SshSession { handle })
    }

    async fn health_check(&self, session: &SshSession) -> bool {
        !session.is_closed()
    }

    async fn close(&self, session: SshSession) {
        if let Err(e) = session
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Checked-out session; returns to the pool on drop
pub type SshConnection = PooledConnection<SshFactory>;

/// SSH session pool shared by the SSH and remote-docker adapters
///
/// The idle reaper starts with the first acquisition.
#[derive(Clone)]
pub struct SshPool {
    pool: ConnectionPool<SshFactory>,
    reaper: Arc<Mutex<Option<JoinHandle<()>>>>,
    reap_interval: Duration,
    idle_timeout: Duration,
}

impl SshPool {
    pub fn new(ssh: SshConfig, pool: PoolConfig) -> Self {
        let reap_interval = pool.reap_interval();
        let idle_timeout = pool.idle_timeout();
        Self {
            pool: ConnectionPool::new(SshFactory::new(ssh), pool),
            reaper: Arc::new(Mutex::new(None)),
            reap_interval,
            idle_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.ssh.clone(), config.pool.clone())
    }

    /// Reuse or open a session for `target`, bounded by the per-key limit
    pub async fn acquire(&self, target: &SshTarget) -> Result<SshConnection> {
        self.ensure_reaper();
        self.pool.acquire(&SshEndpoint(target.clone())).await
    }

    fn ensure_reaper(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(self.pool.spawn_reaper(self.reap_interval, self.idle_timeout));
        }
    }

    /// Close idle sessions now
    pub async fn drain(&self) -> usize {
        self.pool.evict_idle(Duration::ZERO).await
    }

    /// Stop the reaper and close every idle session
    pub async fn close(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.pool.close().await;
    }

    pub fn pool(&self) -> &ConnectionPool<SshFactory> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_endpoint_identity_ignores_credentials() {
        let a = SshEndpoint(SshTarget::new("web-1", "deploy").with_password("one"));
        let b = SshEndpoint(SshTarget::new("web-1", "deploy").with_private_key("/k"));
        let c = SshEndpoint(SshTarget::new("web-1", "deploy").with_port(2222).with_password("one"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_keepalive_follows_target() {
        let factory = SshFactory::new(SshConfig::default());
        let mut target = SshTarget::new("h", "u").with_password("p");
        assert!(factory.client_config(&target).keepalive_interval.is_some());
        target.keep_alive = false;
        assert!(factory.client_config(&target).keepalive_interval.is_none());
    }
}
