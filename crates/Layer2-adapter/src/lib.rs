//! # xrun-adapter
//!
//! Transport adapters for the xrun execution engine.
//!
//! ## Adapters
//!
//! - `LocalAdapter` - child processes through the platform shell
//! - `SshAdapter` - pooled russh sessions
//! - `DockerAdapter` - exec in a running container, or an ephemeral one from an image
//! - `KubernetesAdapter` - `kubectl exec` into a pod
//! - `RemoteDockerAdapter` - `docker exec` on a host reached over SSH
//!
//! Every adapter returns an `ExecutionHandle`: chunked output, a cancel
//! handle and the final exit status.

pub mod adapter;
pub mod docker;
pub mod handle;
pub mod kubernetes;
pub mod local;
mod process;
pub mod remote_docker;
pub mod ssh;

pub use adapter::{
    ensure_kind, Adapter, AdapterState, ExecutingGuard, PreparedInvocation, StateTracker,
};
pub use handle::{
    CancelHandle, ChunkSender, ChunkStream, CollectedOutput, ExecutionHandle, ExitReceiver,
    HandleSink, OutputChunk,
};

pub use docker::DockerAdapter;
pub use kubernetes::KubernetesAdapter;
pub use local::LocalAdapter;
pub use remote_docker::RemoteDockerAdapter;
pub use ssh::{SshAdapter, SshPool};

#[cfg(unix)]
pub use process::signal_name;
pub use process::normalize_signal;
