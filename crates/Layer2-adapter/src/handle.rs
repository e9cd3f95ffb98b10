//! Execution handle - output chunks, exit notification and cancellation
//!
//! An adapter returns an [`ExecutionHandle`] as soon as the invocation is
//! running. The matching [`HandleSink`] stays with the adapter's driver task.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use xrun_foundation::{Error, ExitStatus, OutputStream, Result};

/// One piece of output, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }
}

/// Lazy, finite chunk sequence. Ends when the invocation closes its output.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<OutputChunk>,
}

impl ChunkStream {
    /// Next chunk in arrival order, `None` once the stream closed
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }
}

impl Stream for ChunkStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<OutputChunk>> {
        self.rx.poll_recv(cx)
    }
}

/// Requests cancellation of a running invocation
///
/// Clones share one signal. Once every clone is dropped the driver treats
/// the invocation as abandoned and cancels it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Idempotent. The driver kills the invocation and reports `Cancelled`.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves with the invocation's exit status once all output was delivered
#[derive(Debug)]
pub struct ExitReceiver {
    rx: oneshot::Receiver<Result<ExitStatus>>,
}

impl ExitReceiver {
    /// A driver that vanished without reporting is an internal error
    pub async fn wait(self) -> Result<ExitStatus> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::Internal("execution driver exited without a status".into())))
    }
}

impl std::future::Future for ExitReceiver {
    type Output = Result<ExitStatus>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| {
            r.unwrap_or_else(|_| Err(Error::Internal("execution driver exited without a status".into())))
        })
    }
}

/// Running invocation as seen by the caller
#[derive(Debug)]
pub struct ExecutionHandle {
    chunks: ChunkStream,
    exit: ExitReceiver,
    cancel: CancelHandle,
}

/// Collected output of a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
}

impl ExecutionHandle {
    /// New handle plus the driver-side sink
    pub fn channel() -> (HandleSink, ExecutionHandle) {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let sink = HandleSink {
            chunks: Some(chunk_tx),
            exit: Some(exit_tx),
            cancel: cancel_rx,
        };
        let handle = ExecutionHandle {
            chunks: ChunkStream { rx: chunk_rx },
            exit: ExitReceiver { rx: exit_rx },
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
        };
        (sink, handle)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Split for callers that consume chunks and await the exit on separate tasks
    pub fn into_parts(self) -> (ChunkStream, ExitReceiver, CancelHandle) {
        (self.chunks, self.exit, self.cancel)
    }

    /// Drain every chunk, then wait for the exit status
    pub async fn collect(self) -> Result<CollectedOutput> {
        let (mut chunks, exit, _cancel) = self.into_parts();
        let mut out = CollectedOutput::default();
        while let Some(chunk) = chunks.recv().await {
            match chunk.stream {
                OutputStream::Stdout => out.stdout.extend_from_slice(&chunk.data),
                OutputStream::Stderr => out.stderr.extend_from_slice(&chunk.data),
            }
        }
        out.status = exit.await?;
        Ok(out)
    }
}

/// Driver side of an [`ExecutionHandle`]
#[derive(Debug)]
pub struct HandleSink {
    chunks: Option<mpsc::UnboundedSender<OutputChunk>>,
    exit: Option<oneshot::Sender<Result<ExitStatus>>>,
    cancel: watch::Receiver<bool>,
}

impl HandleSink {
    /// Forward a chunk; empty chunks are skipped
    pub fn send(&self, stream: OutputStream, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        if let Some(tx) = &self.chunks {
            // receiver gone means nobody reads output any more
            let _ = tx.send(OutputChunk { stream, data });
        }
    }

    /// Extra sender for reader tasks
    pub fn chunk_sender(&self) -> Option<ChunkSender> {
        self.chunks.clone().map(|tx| ChunkSender { tx })
    }

    /// True after `cancel()` or once every handle was dropped
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    /// Resolves once cancellation was requested or every handle was dropped
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancel.borrow_and_update() {
                return;
            }
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the chunk stream, then publish the exit status
    pub fn finish(mut self, result: Result<ExitStatus>) {
        self.chunks.take();
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(result);
        }
    }
}

/// Cloneable chunk sender for per-stream reader tasks
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::UnboundedSender<OutputChunk>,
}

impl ChunkSender {
    /// Empty chunks are dropped. A closed stream is ignored.
    pub fn send(&self, stream: OutputStream, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if !data.is_empty() {
            let _ = self.tx.send(OutputChunk { stream, data });
        }
    }
}
