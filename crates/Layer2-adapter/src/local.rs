//! Local adapter - runs commands as child processes of this host

use crate::adapter::{ensure_kind, Adapter, AdapterState, PreparedInvocation, StateTracker};
use crate::handle::ExecutionHandle;
use crate::process;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;
use xrun_command::ShellDialect;
use xrun_foundation::{Error, ExecutionOptions, Result, Target, TargetKind};

/// Program and arguments that make `shell` run `line`
pub fn shell_invocation(shell: Option<&str>, line: &str) -> (String, Vec<String>) {
    let line = line.to_string();
    match shell {
        Some(shell) => {
            let args = match ShellDialect::from_shell(shell) {
                ShellDialect::Cmd => vec!["/C".to_string(), line],
                ShellDialect::PowerShell => {
                    vec!["-NoProfile".to_string(), "-Command".to_string(), line]
                }
                ShellDialect::Posix => vec!["-c".to_string(), line],
            };
            (shell.to_string(), args)
        }
        None if cfg!(windows) => ("cmd".to_string(), vec!["/C".to_string(), line]),
        None => ("sh".to_string(), vec!["-c".to_string(), line]),
    }
}

#[cfg(windows)]
fn apply_args(cmd: &mut Command, program: &str, args: &[String]) {
    if ShellDialect::from_shell(program) == ShellDialect::Cmd && args.len() == 2 {
        // cmd.exe does its own parsing; MSVC-style quoting would corrupt the line
        cmd.arg(&args[0]).raw_arg(&args[1]);
    } else {
        cmd.args(args);
    }
}

#[cfg(not(windows))]
fn apply_args(cmd: &mut Command, _program: &str, args: &[String]) {
    cmd.args(args);
}

/// Child processes on the local host
///
/// No connection to manage, so the adapter is always `Connected` between runs.
pub struct LocalAdapter {
    state: Arc<StateTracker>,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self {
            state: StateTracker::new("local", AdapterState::Connected),
        }
    }

    fn command(invocation: &PreparedInvocation) -> Result<(Command, String)> {
        let Target::Local(target) = &invocation.target else {
            ensure_kind(TargetKind::Local, &invocation.target)?;
            return Err(Error::Internal("local target expected".into()));
        };

        let (program, args) = shell_invocation(invocation.shell.as_deref(), &invocation.command_line);
        let mut cmd = Command::new(&program);
        apply_args(&mut cmd, &program, &args);
        cmd.envs(&invocation.env);

        let cwd = invocation.cwd.as_ref().map(PathBuf::from).or_else(|| target.cwd.clone());
        if let Some(dir) = cwd {
            if !dir.is_dir() {
                return Err(Error::Execution(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
            cmd.current_dir(dir);
        }

        Ok((cmd, program))
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Local
    }

    fn dialect(&self, options: &ExecutionOptions) -> ShellDialect {
        options
            .shell
            .as_deref()
            .map(ShellDialect::from_shell)
            .unwrap_or_else(ShellDialect::native)
    }

    async fn execute(&self, invocation: PreparedInvocation) -> Result<ExecutionHandle> {
        let (cmd, program) = Self::command(&invocation)?;
        debug!(command = %invocation.command_line, "Running local command");

        let stdin = invocation.stdin.as_bytes().map(<[u8]>::to_vec);
        let guard = self.state.begin();
        process::spawn(cmd, &program, stdin, guard, None)
    }

    async fn validate(&self, target: &Target) -> Result<()> {
        ensure_kind(TargetKind::Local, target)?;
        target.validate()?;
        let shell = if cfg!(windows) { "cmd" } else { "sh" };
        which::which(shell)
            .map(|_| ())
            .map_err(|e| Error::Execution(format!("{} not found: {}", shell, e)))
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_invocation() {
        assert_eq!(
            shell_invocation(Some("/bin/bash"), "echo hi"),
            ("/bin/bash".to_string(), vec!["-c".to_string(), "echo hi".to_string()])
        );
        assert_eq!(
            shell_invocation(Some("pwsh"), "Get-Date").1,
            vec!["-NoProfile", "-Command", "Get-Date"]
        );
        let (program, _) = shell_invocation(None, "true");
        assert_eq!(program, if cfg!(windows) { "cmd" } else { "sh" });
    }

    #[test]
    fn test_missing_cwd_is_execution_error() {
        let spec = xrun_command::CommandSpec::raw("true").unwrap();
        let options = ExecutionOptions::new().with_cwd("/definitely/not/here");
        let adapter = LocalAdapter::new();
        let prepared = adapter.prepare(&spec, &options, &Target::local()).unwrap();

        let err = LocalAdapter::command(&prepared).err().unwrap();
        assert!(matches!(err, Error::Execution(_)));
    }
}
