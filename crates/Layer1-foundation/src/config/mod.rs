//! Configuration
//!
//! - `EngineConfig` - pool, SSH, Docker, Kubernetes and engine tunables

mod engine;

pub use engine::{
    DockerConfig, EngineConfig, KubernetesConfig, PoolConfig, SshConfig, ENV_DEFAULT_TIMEOUT_MS,
    ENV_MAX_CONNECTIONS,
};
