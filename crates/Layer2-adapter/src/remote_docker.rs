//! Remote docker adapter - `docker exec` on an SSH host
//!
//! Shares the session pool with the SSH adapter, so a host reached by both
//! kinds of target holds one set of sessions.

use crate::adapter::{ensure_kind, Adapter, AdapterState, PreparedInvocation, StateTracker};
use crate::handle::ExecutionHandle;
use crate::process::ExitClassifier;
use crate::ssh::{run_remote, SshPool};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use xrun_command::{join, ShellDialect};
use xrun_foundation::{
    DockerConfig, DockerTarget, EngineConfig, Error, ExitStatus, Result, Target, TargetKind,
};

/// Remote login-shell line running the command inside `container`
pub fn docker_exec_line(
    cli: &str,
    container: &str,
    docker: &DockerTarget,
    invocation: &PreparedInvocation,
    default_shell: &str,
) -> String {
    let mut tokens: Vec<String> = vec![cli.to_string(), "exec".to_string()];
    if !invocation.stdin.is_null() {
        tokens.push("-i".to_string());
    }
    if docker.tty {
        tokens.push("-t".to_string());
    }
    if let Some(user) = &docker.user {
        tokens.push("-u".to_string());
        tokens.push(user.clone());
    }
    if let Some(dir) = invocation.cwd.as_ref().or(docker.workdir.as_ref()) {
        tokens.push("-w".to_string());
        tokens.push(dir.clone());
    }
    for (k, v) in &invocation.env {
        tokens.push("-e".to_string());
        tokens.push(format!("{}={}", k, v));
    }
    tokens.push(container.to_string());
    tokens.push(invocation.shell.clone().unwrap_or_else(|| default_shell.to_string()));
    tokens.push("-c".to_string());
    tokens.push(invocation.command_line.clone());
    join(&tokens, ShellDialect::Posix)
}

/// Separate docker CLI failures from the command's own exit
pub fn classify_docker_cli(container: &str, status: &ExitStatus, stderr: &[u8]) -> Option<Error> {
    let code = status.code?;
    let text = String::from_utf8_lossy(stderr);
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default().trim();

    if code == 127 && (text.contains("docker: command not found") || text.contains("docker: not found")) {
        return Some(Error::Execution(format!("docker CLI missing on remote host: {}", first)));
    }
    if code != 0 && text.contains("Cannot connect to the Docker daemon") {
        return Some(Error::connection(format!("docker daemon for {}", container), first));
    }
    if code != 0 && text.contains("Error response from daemon") {
        // the CLI hides the API status; recover the common ones
        let status = if text.contains("No such container") {
            Some(404)
        } else if text.contains("is not running") || text.contains("is paused") {
            Some(409)
        } else {
            Some(500)
        };
        return Some(Error::Docker {
            message: first.to_string(),
            status,
            container: Some(container.to_string()),
        });
    }
    None
}

/// `docker exec` through an SSH session to the Docker host
///
/// CLI failures (daemon down, no such container) are told apart from the
/// command's own exit through `classify_docker_cli`.
pub struct RemoteDockerAdapter {
    pool: SshPool,
    config: DockerConfig,
    state: Arc<StateTracker>,
}

impl RemoteDockerAdapter {
    pub fn new(pool: SshPool, config: &EngineConfig) -> Self {
        Self {
            pool,
            config: config.docker.clone(),
            state: StateTracker::new("remote-docker", AdapterState::Disconnected),
        }
    }
}

#[async_trait]
impl Adapter for RemoteDockerAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::RemoteDocker
    }

    async fn execute(&self, invocation: PreparedInvocation) -> Result<ExecutionHandle> {
        let Target::RemoteDocker(target) = &invocation.target else {
            ensure_kind(TargetKind::RemoteDocker, &invocation.target)?;
            return Err(Error::Internal("remote docker target expected".into()));
        };
        let Some(container) = target.docker.container.as_deref() else {
            return Err(Error::Validation(
                "remote docker target requires a running container".into(),
            ));
        };

        let line = docker_exec_line(
            &self.config.remote_cli,
            container,
            &target.docker,
            &invocation,
            &self.config.default_shell,
        );
        debug!(endpoint = %target.label(), "docker exec over ssh");

        let name = container.to_string();
        let classify: ExitClassifier =
            Box::new(move |status: &ExitStatus, stderr: &[u8]| classify_docker_cli(&name, status, stderr));
        let stdin = invocation.stdin.as_bytes().map(<[u8]>::to_vec);
        let guard = self.state.begin();
        run_remote(&self.pool, &target.ssh, line, stdin, guard, Some(classify)).await
    }

    async fn connect(&self, target: &Target) -> Result<()> {
        let Target::RemoteDocker(remote) = target else {
            return ensure_kind(TargetKind::RemoteDocker, target);
        };
        self.state.set(AdapterState::Connecting);
        match self.pool.acquire(&remote.ssh).await {
            Ok(_) => {
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
        self.pool.drain().await;
        self.state.set(AdapterState::Disconnected);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.pool.close().await;
        self.state.set(AdapterState::Disconnected);
        Ok(())
    }

    /// Checks the SSH credentials, then that the container is running
    async fn validate(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::RemoteDocker, target)?;
        target.validate()?;
        let Target::RemoteDocker(remote) = target else {
            return Ok(());
        };
        let Some(container) = remote.docker.container.as_deref() else {
            return Ok(());
        };

        let line = join(
            &[
                self.config.remote_cli.as_str(),
                "inspect",
                "-f",
                "{{.State.Running}}",
                container,
            ],
            ShellDialect::Posix,
        );
        let guard = self.state.begin();
        let out = run_remote(&self.pool, &remote.ssh, line, None, guard, None)
            .await?
            .collect()
            .await?;

        let running = String::from_utf8_lossy(&out.stdout).trim() == "true";
        if out.status.success() && running {
            info!(endpoint = %remote.label(), "Remote container running");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        Err(Error::Docker {
            message: if stderr.trim().is_empty() {
                format!("container {} is not running", container)
            } else {
                stderr.trim().to_string()
            },
            status: None,
            container: Some(container.to_string()),
        })
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrun_command::CommandSpec;
    use xrun_foundation::{ExecutionOptions, RemoteDockerTarget, SshTarget, StdinSource};

    fn prepared(docker: DockerTarget, options: &ExecutionOptions) -> PreparedInvocation {
        let target = Target::RemoteDocker(RemoteDockerTarget {
            ssh: SshTarget::new("build-1", "ci").with_password("x"),
            docker,
        });
        let spec = CommandSpec::template("ls {}", ["a b"]).unwrap();
        PreparedInvocation::new(&spec, options, &target, ShellDialect::Posix)
    }

    #[test]
    fn test_exec_line() {
        let docker = DockerTarget::container("web").with_user("app");
        let options = ExecutionOptions::new()
            .with_cwd("/srv/my app")
            .with_env("MODE", "prod");
        let inv = prepared(docker.clone(), &options);
        assert_eq!(
            docker_exec_line("docker", "web", &docker, &inv, "/bin/sh"),
            "docker exec -u app -w '/srv/my app' -e MODE=prod web /bin/sh -c 'ls '\\''a b'\\'''"
        );
    }

    #[test]
    fn test_exec_line_stdin_and_shell() {
        let docker = DockerTarget::container("web").with_workdir("/app");
        let options = ExecutionOptions::new()
            .with_shell("/bin/bash")
            .with_stdin(StdinSource::Text("hi".into()));
        let inv = prepared(docker.clone(), &options);
        assert_eq!(
            docker_exec_line("podman", "web", &docker, &inv, "/bin/sh"),
            "podman exec -i -w /app web /bin/bash -c 'ls '\\''a b'\\'''"
        );
    }

    #[test]
    fn test_classify_docker_cli() {
        let err = classify_docker_cli(
            "web",
            &ExitStatus::code(1),
            b"Error response from daemon: No such container: web\n",
        )
        .unwrap();
        assert!(matches!(
            err,
            Error::Docker { status: Some(404), ref container, .. } if container.as_deref() == Some("web")
        ));
        assert!(!err.is_retryable());

        let err = classify_docker_cli(
            "web",
            &ExitStatus::code(1),
            b"Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?\n",
        )
        .unwrap();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(err.is_retryable());

        let err = classify_docker_cli("web", &ExitStatus::code(127), b"bash: docker: command not found\n").unwrap();
        assert!(matches!(err, Error::Execution(_)));

        assert!(classify_docker_cli("web", &ExitStatus::code(3), b"app failed\n").is_none());
        assert!(classify_docker_cli("web", &ExitStatus::code(0), b"").is_none());
    }
}
