//! Per-call execution options and retry policy

use super::target::Target;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the command reads on stdin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StdinSource {
    /// Closed stdin
    #[default]
    Null,
    Text(String),
    Bytes(Vec<u8>),
}

impl StdinSource {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Payload to write, if any
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.as_bytes()),
            Self::Bytes(b) => Some(b),
        }
    }
}

/// Backoff between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Spread each delay by up to ±20%
    #[serde(default)]
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Which non-zero exits the retry policy re-attempts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitCodeRetry {
    /// Exit codes are results, never retried
    #[default]
    Never,
    AnyNonZero,
    Codes(Vec<i32>),
}

/// Retry policy applied by the engine
///
/// Structural failures (connection, timeout) are retried by default. A command
/// that ran and exited non-zero is only retried when `retry_on_exit` opts in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub retry_on_exit: ExitCodeRetry,
    #[serde(default)]
    pub retry_authentication: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
            retry_on_exit: ExitCodeRetry::Never,
            retry_authentication: false,
        }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::none()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_exit_codes(mut self, retry: ExitCodeRetry) -> Self {
        self.retry_on_exit = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Validation(
                "retry policy needs at least one attempt".into(),
            ));
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            return Err(Error::Validation(
                "backoff multiplier must be a finite value >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Whether `err` on attempt `attempt` (1-based) warrants another attempt
    pub fn should_retry_error(&self, err: &Error, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match err {
            Error::Authentication { .. } => self.retry_authentication,
            other => other.is_retryable(),
        }
    }

    /// Whether a completed run with `exit_code` warrants another attempt
    pub fn should_retry_exit(&self, exit_code: Option<i32>, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match (&self.retry_on_exit, exit_code) {
            (ExitCodeRetry::Never, _) => false,
            (_, Some(0)) => false,
            (ExitCodeRetry::AnyNonZero, _) => true,
            (ExitCodeRetry::Codes(codes), Some(code)) => codes.contains(&code),
            (ExitCodeRetry::Codes(_), None) => false,
        }
    }

    /// Delay before attempt `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let base = self.backoff.initial.as_secs_f64() * self.backoff.multiplier.powi(exp);
        let capped = base.min(self.backoff.max.as_secs_f64());
        let secs = if self.backoff.jitter {
            capped * rand::thread_rng().gen_range(0.8..=1.2)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Per-call options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Overlay merged over the target's default environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Shell binary used to run the command line (e.g. `/bin/bash`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Return structural failures as data instead of errors
    #[serde(default)]
    pub nothrow: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub stdin: StdinSource,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn with_stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    /// Effective retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    /// Target defaults overlaid with this call's environment
    pub fn merged_env(&self, target: &Target) -> BTreeMap<String, String> {
        let mut env = target.env().clone();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(Error::Validation("timeout must be greater than zero".into()));
            }
        }
        for key in self.env.keys() {
            if !is_valid_env_name(key) {
                return Err(Error::Validation(format!(
                    "invalid environment variable name: {:?}",
                    key
                )));
            }
        }
        if let Some(shell) = &self.shell {
            if shell.trim().is_empty() {
                return Err(Error::Validation("shell override must not be empty".into()));
            }
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
