//! Kubernetes adapter - `kubectl exec` through the local process driver

use crate::adapter::{ensure_kind, Adapter, AdapterState, PreparedInvocation, StateTracker};
use crate::handle::ExecutionHandle;
use crate::process::{self, ExitClassifier};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use xrun_command::{posix_group, quote, ShellDialect};
use xrun_foundation::{
    EngineConfig, Error, ExitStatus, KubernetesConfig, KubernetesTarget, Result, Target, TargetKind,
};

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Arguments for `kubectl` (program name excluded)
///
/// kubectl hands the argv after `--` straight to the container runtime, so
/// only the `sh -c` line itself needs quoting, and only for the `cd` prefix.
pub fn kubectl_args(
    target: &KubernetesTarget,
    invocation: &PreparedInvocation,
    default_shell: &str,
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(kubeconfig) = &target.kubeconfig {
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig.display().to_string());
    }
    if let Some(context) = &target.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args.push("exec".to_string());
    if !invocation.stdin.is_null() {
        args.push("-i".to_string());
    }
    if target.tty {
        args.push("-t".to_string());
    }
    args.push("-n".to_string());
    args.push(target.namespace.clone());
    args.push(target.pod.clone());
    if let Some(container) = &target.container {
        args.push("-c".to_string());
        args.push(container.clone());
    }
    args.push("--".to_string());

    if !invocation.env.is_empty() {
        args.push("env".to_string());
        args.extend(invocation.env.iter().map(|(k, v)| format!("{}={}", k, v)));
    }

    let line = match &invocation.cwd {
        Some(dir) => format!(
            "cd {} && {}",
            quote(dir, ShellDialect::Posix),
            posix_group(&invocation.command_line)
        ),
        None => invocation.command_line.clone(),
    };
    args.push(invocation.shell.clone().unwrap_or_else(|| default_shell.to_string()));
    args.push("-c".to_string());
    args.push(line);
    args
}

/// Decide whether kubectl itself failed rather than the remote command
///
/// kubectl exits 1 and prints its own diagnostics on stderr in that case.
pub fn classify_kubectl(target: &KubernetesTarget, status: &ExitStatus, stderr: &[u8]) -> Option<Error> {
    if status.code != Some(1) {
        return None;
    }
    let text = String::from_utf8_lossy(stderr);
    if text.contains("Unable to connect to the server") {
        return Some(Error::connection(target.label(), first_line(&text)));
    }
    if text.contains("Error from server") || text.contains("unable to upgrade connection") {
        return Some(Error::Kubernetes {
            message: first_line(&text),
            pod: target.pod.clone(),
            namespace: target.namespace.clone(),
            stderr: text.into_owned(),
        });
    }
    None
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

pub struct KubernetesAdapter {
    config: KubernetesConfig,
    kubectl: Mutex<Option<PathBuf>>,
    execs: Arc<Semaphore>,
    state: Arc<StateTracker>,
}

impl KubernetesAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            execs: Arc::new(Semaphore::new(config.kubernetes.max_concurrent_execs.max(1))),
            config: config.kubernetes.clone(),
            kubectl: Mutex::new(None),
            state: StateTracker::new("kubernetes", AdapterState::Disconnected),
        }
    }

    /// Resolve the kubectl binary once
    fn kubectl(&self) -> Result<PathBuf> {
        let mut cached = self.kubectl.lock();
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }
        let path = match &self.config.kubectl {
            Some(path) => path.clone(),
            None => which::which("kubectl")
                .map_err(|e| Error::Execution(format!("kubectl not found on PATH: {}", e)))?,
        };
        debug!(kubectl = %path.display(), "Resolved kubectl");
        *cached = Some(path.clone());
        self.state.set(AdapterState::Connected);
        Ok(path)
    }
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Kubernetes
    }

    async fn execute(&self, invocation: PreparedInvocation) -> Result<ExecutionHandle> {
        let Target::Kubernetes(target) = &invocation.target else {
            ensure_kind(TargetKind::Kubernetes, &invocation.target)?;
            return Err(Error::Internal("kubernetes target expected".into()));
        };

        let kubectl = self.kubectl()?;
        let args = kubectl_args(target, &invocation, &self.config.default_shell);
        let mut cmd = Command::new(&kubectl);
        cmd.args(&args);

        let permit = Arc::clone(&self.execs)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("kubernetes exec limiter closed".into()))?;
        let pod = target.clone();
        // holds the exec permit until the process has exited
        let classify: ExitClassifier = Box::new(move |status: &ExitStatus, stderr: &[u8]| {
            drop(permit);
            classify_kubectl(&pod, status, stderr)
        });

        debug!(endpoint = %target.label(), command = %invocation.command_line, "kubectl exec");
        let stdin = invocation.stdin.as_bytes().map(<[u8]>::to_vec);
        let guard = self.state.begin();
        process::spawn(cmd, "kubectl", stdin, guard, Some(classify))
    }

    async fn connect(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::Kubernetes, target)?;
        self.kubectl().map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.kubectl.lock().take();
        self.state.set(AdapterState::Disconnected);
        Ok(())
    }

    /// `kubectl get pod` confirms the context, credentials and pod
    async fn validate(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::Kubernetes, target)?;
        target.validate()?;
        let Target::Kubernetes(pod) = target else {
            return Ok(());
        };

        let mut cmd = Command::new(self.kubectl()?);
        if let Some(kubeconfig) = &pod.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &pod.context {
            cmd.arg("--context").arg(context);
        }
        cmd.args(["get", "pod", pod.pod.as_str(), "-n", pod.namespace.as_str(), "-o", "name"])
            .kill_on_drop(true);

        let output = tokio::time::timeout(VALIDATE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::timeout("kubectl get pod", VALIDATE_TIMEOUT))?
            .map_err(|e| Error::Execution(format!("failed to run kubectl: {}", e)))?;

        if output.status.success() {
            info!(endpoint = %pod.label(), "Pod reachable");
            return Ok(());
        }
        let status = process::exit_status(output.status);
        Err(classify_kubectl(pod, &ExitStatus::code(1), &output.stderr).unwrap_or_else(|| {
            Error::Kubernetes {
                message: format!("kubectl get pod exited with {:?}", status.code),
                pod: pod.pod.clone(),
                namespace: pod.namespace.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
        }))
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrun_command::CommandSpec;
    use xrun_foundation::{ExecutionOptions, StdinSource};

    fn prepared(target: &KubernetesTarget, options: &ExecutionOptions) -> PreparedInvocation {
        let spec = CommandSpec::template("ls {}", ["my dir"]).unwrap();
        PreparedInvocation::new(&spec, options, &Target::Kubernetes(target.clone()), ShellDialect::Posix)
    }

    #[test]
    fn test_minimal_args() {
        let target = KubernetesTarget::new("api-1");
        let args = kubectl_args(&target, &prepared(&target, &ExecutionOptions::new()), "/bin/sh");
        assert_eq!(
            args,
            vec!["exec", "-n", "default", "api-1", "--", "/bin/sh", "-c", "ls 'my dir'"]
        );
    }

    #[test]
    fn test_full_args() {
        let mut target = KubernetesTarget::new("api-1")
            .with_namespace("staging")
            .with_container("app")
            .with_context("prod-eu");
        target.kubeconfig = Some(PathBuf::from("/etc/kube/config"));
        let options = ExecutionOptions::new()
            .with_cwd("/srv/app")
            .with_env("MODE", "prod")
            .with_stdin(StdinSource::Text("x".into()));

        let args = kubectl_args(&target, &prepared(&target, &options), "/bin/sh");
        assert_eq!(
            args,
            vec![
                "--kubeconfig",
                "/etc/kube/config",
                "--context",
                "prod-eu",
                "exec",
                "-i",
                "-n",
                "staging",
                "api-1",
                "-c",
                "app",
                "--",
                "env",
                "MODE=prod",
                "/bin/sh",
                "-c",
                "cd /srv/app && { ls 'my dir'\n}",
            ]
        );
    }

    #[test]
    fn test_classify_kubectl() {
        let target = KubernetesTarget::new("api-1");
        let failed = ExitStatus::code(1);

        let err = classify_kubectl(
            &target,
            &failed,
            b"Error from server (NotFound): pods \"api-1\" not found\n",
        )
        .unwrap();
        assert!(matches!(err, Error::Kubernetes { ref pod, .. } if pod == "api-1"));

        let err = classify_kubectl(
            &target,
            &failed,
            b"Unable to connect to the server: dial tcp 10.0.0.1:6443: i/o timeout\n",
        )
        .unwrap();
        assert!(matches!(err, Error::Connection { .. }));

        // the remote command's own failure
        assert!(classify_kubectl(&target, &failed, b"grep: no match\n").is_none());
        assert!(classify_kubectl(&target, &ExitStatus::code(2), b"Error from server").is_none());
    }
}
