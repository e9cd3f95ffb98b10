//! Event Types - progress events emitted during execution

use crate::error::FailureCause;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Execution ID
// ============================================================================

/// Identifies one `execute` call across all of its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ============================================================================
// Output Stream
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

// ============================================================================
// Event Kind
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// An attempt is starting
    Started { command: String, attempt: u32 },
    /// A chunk of output arrived
    Data { stream: OutputStream, data: Vec<u8> },
    /// An attempt failed and another one is scheduled
    Retry {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        cause: FailureCause,
    },
    /// The call finished, successfully or not
    Finished {
        exit_code: Option<i32>,
        signal: Option<String>,
        success: bool,
        duration: Duration,
    },
    /// The call ended with a structural failure
    Failed { cause: FailureCause },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Data { .. } => "data",
            Self::Retry { .. } => "retry",
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }
}

// ============================================================================
// ExecutionEvent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn new(execution_id: ExecutionId, target: impl Into<String>, kind: EventKind) -> Self {
        Self {
            execution_id,
            target: target.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Finished { .. } | EventKind::Failed { .. })
    }
}
