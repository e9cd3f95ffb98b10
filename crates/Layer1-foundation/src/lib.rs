//! # xrun-foundation
//!
//! Foundation layer for xrun:
//! - Error: structural failure taxonomy (`Error`, `ErrorKind`, `FailureCause`)
//! - Core: `Target`, `ExecutionOptions`, `RetryPolicy`, `ExecutionResult`
//! - Config: `EngineConfig` (JSON / TOML)
//! - Event: progress events and the `EventBus`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Layer3  ExecutionEngine (timeout / retry / fan-out)     │
//! │                     │                                   │
//! │          ┌──────────┴──────────┐                        │
//! │          ▼                     ▼                        │
//! │  Layer2  Adapters ───────▶ ConnectionPool               │
//! │  (local, ssh, docker,                                   │
//! │   kubernetes, remote-docker)                            │
//! │          │                                              │
//! │          ▼                                              │
//! │  Layer2  CommandSpec (escaping)                         │
//! │                                                         │
//! │  Layer1  Error · Target · Options · Result · Events     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorKind, FailureCause, Result};

// ============================================================================
// Core
// ============================================================================
pub use crate::core::{
    is_valid_env_name, Backoff, DockerTarget, ExecutionOptions, ExecutionResult, ExitCodeRetry, ExitStatus,
    KubernetesTarget, LocalTarget, RemoteDockerTarget, RetryPolicy, SshTarget, StdinSource, Target,
    TargetKind,
};

// ============================================================================
// Config
// ============================================================================
pub use config::{DockerConfig, EngineConfig, KubernetesConfig, PoolConfig, SshConfig};

// ============================================================================
// Event
// ============================================================================
pub use event::{
    EventBus, EventKind, EventListener, ExecutionEvent, ExecutionId, ListenerId, OutputStream,
};
