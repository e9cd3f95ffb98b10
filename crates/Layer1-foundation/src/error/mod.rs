//! Error types for xrun
//!
//! Every structural failure the engine can raise is classified here. A command
//! that ran and exited non-zero is never an `Error`; it is an ordinary
//! `ExecutionResult` with `success() == false`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// xrun error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Input
    // ========================================================================
    /// Malformed command spec, options or target. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// Connect or handshake failure.
    #[error("Connection error: {target} - {message}")]
    Connection { target: String, message: String },

    /// Credentials rejected by the remote side.
    #[error("Authentication failed: {target} - {message}")]
    Authentication { target: String, message: String },

    #[error("Docker error: {message}")]
    Docker {
        message: String,
        /// HTTP status returned by the daemon, if any
        status: Option<u16>,
        container: Option<String>,
    },

    #[error("Kubernetes error: {namespace}/{pod} - {message}")]
    Kubernetes {
        message: String,
        pod: String,
        namespace: String,
        /// Raw kubectl diagnostic output
        stderr: String,
    },

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Timeout: '{command}' exceeded {}ms", .timeout.as_millis())]
    Timeout { command: String, timeout: Duration },

    /// The command could never be invoked (spawn failure, exec creation failure).
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // External conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable classification of an [`Error`], used in results and by the CLI
/// layer to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    Config,
    Connection,
    Authentication,
    Docker,
    Kubernetes,
    Timeout,
    Execution,
    Cancelled,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
            Self::Timeout => "timeout",
            Self::Execution => "execution",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }

    /// Process exit code for this class of failure.
    ///
    /// Codes stay clear of the 0-125 range a remote command may itself return
    /// and of the 126-165 range shells use for exec failures and signals.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation => 200,
            Self::Config => 201,
            Self::Connection => 202,
            Self::Authentication => 203,
            Self::Timeout => 204,
            Self::Execution => 205,
            Self::Docker => 206,
            Self::Kubernetes => 207,
            Self::Cancelled => 208,
            Self::Io => 209,
            Self::Internal => 210,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Config(_) | Error::Toml(_) => ErrorKind::Config,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::Docker { .. } => ErrorKind::Docker,
            Error::Kubernetes { .. } => ErrorKind::Kubernetes,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Execution(_) => ErrorKind::Execution,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry policy may re-attempt after this error.
    ///
    /// Authentication failures are excluded here; a policy can opt them in
    /// explicitly. Docker errors retry only on daemon-side (5xx) failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::Timeout { .. } | Error::Io(_) => true,
            Error::Docker { status, .. } => matches!(status, Some(s) if *s >= 500),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Connection error helper
    pub fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Authentication error helper
    pub fn authentication(target: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Authentication {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Docker error helper
    pub fn docker(message: impl Into<String>, status: Option<u16>) -> Self {
        Error::Docker {
            message: message.into(),
            status,
            container: None,
        }
    }

    pub fn timeout(command: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            command: command.into(),
            timeout,
        }
    }
}

/// Serializable snapshot of an error, kept in an `ExecutionResult` when the
/// caller asked for `nothrow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCause {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for FailureCause {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
