//! Streaming execution - live chunks plus the fully buffered result

use crate::cancel::CancelToken;
use crate::engine::ExecutionEngine;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use xrun_adapter::OutputChunk;
use xrun_command::CommandSpec;
use xrun_foundation::{Error, ExecutionOptions, ExecutionResult, Result, Target};

/// Live output of a streaming call
///
/// Finite and non-restartable: it ends when the last attempt's output closes.
/// Retried attempts appear back to back.
#[derive(Debug)]
pub struct LiveChunks {
    rx: mpsc::UnboundedReceiver<OutputChunk>,
}

impl LiveChunks {
    /// Next chunk, `None` after the final attempt finished
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }
}

impl Stream for LiveChunks {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<OutputChunk>> {
        self.rx.poll_recv(cx)
    }
}

/// Final result of a streaming call, with every chunk buffered
#[derive(Debug)]
pub struct PendingResult {
    task: JoinHandle<Result<ExecutionResult>>,
}

impl Future for PendingResult {
    type Output = Result<ExecutionResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| Err(Error::Internal(format!("execution task failed: {}", e))))
        })
    }
}

/// Running streaming call
///
/// `chunks` and `result` may be consumed independently; dropping `chunks`
/// does not affect the buffered result.
#[derive(Debug)]
pub struct StreamingExecution {
    pub chunks: LiveChunks,
    pub result: PendingResult,
    pub cancel: CancelToken,
}

impl ExecutionEngine {
    /// Run on a background task, delivering output as it arrives
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute_streaming(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
        target: &Target,
    ) -> StreamingExecution {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();

        let engine = self.clone();
        let spec = spec.clone();
        let options = options.clone();
        let target = target.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            engine
                .run(&spec, &options, &target, Some(&tx), &token)
                .await
        });

        StreamingExecution {
            chunks: LiveChunks { rx },
            result: PendingResult { task },
            cancel,
        }
    }
}
