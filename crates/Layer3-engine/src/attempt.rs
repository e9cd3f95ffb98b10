//! One attempt: start the invocation, pump its output, race the deadline

use crate::cancel::CancelToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use xrun_adapter::{
    Adapter, CancelHandle, ChunkStream, ExitReceiver, OutputChunk, PreparedInvocation,
};
use xrun_foundation::{
    Error, EventBus, EventKind, ExecutionEvent, ExecutionId, ExitStatus, OutputStream, Result,
};

/// Output buffered across the attempt
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Captured {
    fn push(&mut self, chunk: &OutputChunk) {
        match chunk.stream {
            OutputStream::Stdout => self.stdout.extend_from_slice(&chunk.data),
            OutputStream::Stderr => self.stderr.extend_from_slice(&chunk.data),
        }
    }

    /// Lossy UTF-8 `(stdout, stderr)`
    pub fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

/// Per-call settings shared by every attempt
pub(crate) struct AttemptContext<'a> {
    pub id: ExecutionId,
    pub label: &'a str,
    pub adapter: Arc<dyn Adapter>,
    pub events: &'a EventBus,
    pub timeout: Option<Duration>,
    pub cancel_grace: Duration,
    pub quiet: bool,
    pub tap: Option<&'a mpsc::UnboundedSender<OutputChunk>>,
    pub cancel: &'a CancelToken,
}

enum Step {
    Chunk(OutputChunk),
    Closed,
    Exited(Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl AttemptContext<'_> {
    async fn event(&self, kind: EventKind) {
        self.events
            .publish(ExecutionEvent::new(self.id, self.label, kind))
            .await;
    }

    fn timeout_error(&self, command: &str) -> Error {
        Error::timeout(command, self.timeout.unwrap_or_default())
    }

    /// Run `invocation` once
    ///
    /// The deadline covers connection setup as well as the command itself.
    /// Output captured before a failure is returned alongside the error.
    pub async fn run(&self, invocation: PreparedInvocation, attempt: u32) -> (Captured, Result<ExitStatus>) {
        let mut captured = Captured::default();
        let command = invocation.command_line.clone();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        self.event(EventKind::Started {
            command: command.clone(),
            attempt,
        })
        .await;

        let started = tokio::select! {
            handle = self.adapter.execute(invocation) => Ok(handle),
            _ = &mut expired => Err(self.timeout_error(&command)),
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        };
        let handle = match started {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) | Err(e) => return (captured, Err(e)),
        };

        let (mut chunks, mut exit, cancel) = handle.into_parts();
        let mut closed = false;
        loop {
            let step = tokio::select! {
                chunk = chunks.recv(), if !closed => match chunk {
                    Some(chunk) => Step::Chunk(chunk),
                    None => Step::Closed,
                },
                status = &mut exit, if closed => Step::Exited(status),
                _ = &mut expired => Step::TimedOut,
                _ = self.cancel.cancelled() => Step::Cancelled,
            };

            match step {
                Step::Chunk(chunk) => self.deliver(&mut captured, chunk).await,
                Step::Closed => closed = true,
                Step::Exited(status) => return (captured, status),
                Step::TimedOut => {
                    let err = self.timeout_error(&command);
                    self.abort(&mut captured, chunks, exit, cancel, closed, &err).await;
                    return (captured, Err(err));
                }
                Step::Cancelled => {
                    self.abort(&mut captured, chunks, exit, cancel, closed, &Error::Cancelled)
                        .await;
                    return (captured, Err(Error::Cancelled));
                }
            }
        }
    }

    async fn deliver(&self, captured: &mut Captured, chunk: OutputChunk) {
        captured.push(&chunk);
        if let Some(tap) = self.tap {
            // a dropped stream receiver only stops live delivery
            let _ = tap.send(chunk.clone());
        }
        if !self.quiet {
            self.event(EventKind::Data {
                stream: chunk.stream,
                data: chunk.data,
            })
            .await;
        }
    }

    /// Cancel the invocation and wait for it to release its transport
    async fn abort(
        &self,
        captured: &mut Captured,
        mut chunks: ChunkStream,
        exit: ExitReceiver,
        cancel: CancelHandle,
        closed: bool,
        reason: &Error,
    ) {
        debug!(endpoint = %self.label, reason = %reason, "Cancelling invocation");
        cancel.cancel();

        let drained = tokio::time::timeout(self.cancel_grace, async {
            if !closed {
                while let Some(chunk) = chunks.recv().await {
                    captured.push(&chunk);
                    if let Some(tap) = self.tap {
                        let _ = tap.send(chunk);
                    }
                }
            }
            exit.await
        })
        .await;

        match drained {
            Ok(Ok(status)) => debug!(endpoint = %self.label, ?status, "Invocation exited after cancel"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                endpoint = %self.label,
                grace_ms = self.cancel_grace.as_millis() as u64,
                "Invocation did not stop within the cancel grace period"
            ),
        }
    }
}
