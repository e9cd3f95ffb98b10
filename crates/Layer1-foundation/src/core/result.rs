//! Execution results

use crate::error::{Error, FailureCause};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an invocation ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    pub code: Option<i32>,
    /// Signal name (e.g. `SIGKILL`) if the command was killed
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Terminal value of one `execute` call
///
/// Immutable once produced. The engine never retains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    signal: Option<String>,
    duration: Duration,
    attempts: u32,
    target: String,
    command: String,
    cause: Option<FailureCause>,
}

impl ExecutionResult {
    /// Result of a command that ran to completion (whatever its exit code)
    pub fn completed(
        stdout: String,
        stderr: String,
        status: ExitStatus,
        duration: Duration,
        attempts: u32,
        target: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: status.code,
            signal: status.signal,
            duration,
            attempts,
            target: target.into(),
            command: command.into(),
            cause: None,
        }
    }

    /// Structural failure absorbed under `nothrow`
    ///
    /// Any output captured before the failure is kept.
    pub fn failed(
        error: &Error,
        stdout: String,
        stderr: String,
        duration: Duration,
        attempts: u32,
        target: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: None,
            signal: None,
            duration,
            attempts,
            target: target.into(),
            command: command.into(),
            cause: Some(FailureCause::from(error)),
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn signal(&self) -> Option<&str> {
        self.signal.as_deref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        self.cause.as_ref()
    }

    /// Exit code zero, no signal, no structural failure
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && self.cause.is_none()
    }

    /// Trimmed stdout, handy for single-value commands
    pub fn text(&self) -> &str {
        self.stdout.trim_end_matches(['\n', '\r'])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_predicate() {
        let ok = ExecutionResult::completed(
            "a b\n".into(),
            String::new(),
            ExitStatus::code(0),
            Duration::from_millis(3),
            1,
            "local",
            "echo 'a b'",
        );
        assert!(ok.success());
        assert_eq!(ok.text(), "a b");

        let failed = ExecutionResult::completed(
            String::new(),
            "boom".into(),
            ExitStatus::code(2),
            Duration::ZERO,
            1,
            "local",
            "false",
        );
        assert!(!failed.success());
        assert_eq!(failed.exit_code(), Some(2));

        let killed = ExecutionResult::completed(
            String::new(),
            String::new(),
            ExitStatus::signal("SIGKILL"),
            Duration::ZERO,
            1,
            "local",
            "sleep 9",
        );
        assert!(!killed.success());
        assert_eq!(killed.signal(), Some("SIGKILL"));
    }

    #[test]
    fn test_failed_keeps_cause() {
        let err = Error::connection("ssh://u@h:22", "refused");
        let result = ExecutionResult::failed(
            &err,
            String::new(),
            String::new(),
            Duration::ZERO,
            3,
            "ssh://u@h:22",
            "uptime",
        );
        assert!(!result.success());
        assert_eq!(result.attempts(), 3);
        assert_eq!(
            result.cause().map(|c| c.kind),
            Some(crate::error::ErrorKind::Connection)
        );
    }
}
