//! Core data model shared by every layer

pub mod options;
pub mod result;
pub mod target;

pub use options::{is_valid_env_name, Backoff, ExecutionOptions, ExitCodeRetry, RetryPolicy, StdinSource};
pub use result::{ExecutionResult, ExitStatus};
pub use target::{
    DockerTarget, KubernetesTarget, LocalTarget, RemoteDockerTarget, SshTarget, Target, TargetKind,
};
