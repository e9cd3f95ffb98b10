//! Engine Config - pool, transport and engine tunables
//!
//! Loaded from JSON or TOML (chosen by file extension). Every field has a
//! default, so an empty file is a valid configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for `pool.maxConnectionsPerKey`
pub const ENV_MAX_CONNECTIONS: &str = "XRUN_MAX_CONNECTIONS";

/// Environment override for `defaultTimeoutMs`
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "XRUN_DEFAULT_TIMEOUT_MS";

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Concurrently active connections per target identity
    pub max_connections_per_key: usize,
    /// Connections being established at the same time, across all keys
    pub max_concurrent_creates: usize,
    /// Idle connections older than this are evicted
    pub idle_timeout_ms: u64,
    /// Reaper sweep period
    pub reap_interval_ms: u64,
    /// Give up waiting for capacity after this long
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_key: 4,
            max_concurrent_creates: 8,
            idle_timeout_ms: 300_000,
            reap_interval_ms: 30_000,
            acquire_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

// ============================================================================
// Transports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshConfig {
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub inactivity_timeout_ms: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            keepalive_interval_ms: 15_000,
            inactivity_timeout_ms: None,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerConfig {
    /// `unix:///var/run/docker.sock`, `/path/to.sock` or `tcp://host:2375`;
    /// local defaults when unset
    pub host: Option<String>,
    pub max_concurrent_execs: usize,
    pub default_shell: String,
    /// Docker CLI used on the far side of a remote-docker target
    pub remote_cli: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            max_concurrent_execs: 8,
            default_shell: "/bin/sh".to_string(),
            remote_cli: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesConfig {
    /// kubectl binary; resolved on PATH when unset
    pub kubectl: Option<PathBuf>,
    pub max_concurrent_execs: usize,
    pub default_shell: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl: None,
            max_concurrent_execs: 8,
            default_shell: "/bin/sh".to_string(),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub ssh: SshConfig,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    /// Applied when a call sets no timeout
    pub default_timeout_ms: Option<u64>,
    /// Default fan-out bound for `execute_all`
    pub max_parallel: Option<usize>,
    /// How long a cancelled invocation may take to wind down
    pub cancel_grace_ms: u64,
    /// Progress event channel capacity
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            ssh: SshConfig::default(),
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            default_timeout_ms: None,
            max_parallel: None,
            cancel_grace_ms: 2_000,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Load from a `.json` or `.toml` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `XRUN_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ENV_MAX_CONNECTIONS) {
            self.pool.max_connections_per_key = value.parse().map_err(|_| {
                Error::Config(format!("{} must be an integer, got {:?}", ENV_MAX_CONNECTIONS, value))
            })?;
        }
        if let Ok(value) = std::env::var(ENV_DEFAULT_TIMEOUT_MS) {
            self.default_timeout_ms = Some(value.parse().map_err(|_| {
                Error::Config(format!("{} must be an integer, got {:?}", ENV_DEFAULT_TIMEOUT_MS, value))
            })?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.pool.max_connections_per_key, "pool.maxConnectionsPerKey"),
            (self.pool.max_concurrent_creates, "pool.maxConcurrentCreates"),
            (self.docker.max_concurrent_execs, "docker.maxConcurrentExecs"),
            (self.kubernetes.max_concurrent_execs, "kubernetes.maxConcurrentExecs"),
            (self.event_capacity, "eventCapacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be greater than zero", name)));
            }
        }
        if self.max_parallel == Some(0) {
            return Err(Error::Validation("maxParallel must be greater than zero".into()));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(Error::Validation("defaultTimeoutMs must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
