//! Parallel fan-out over independent (spec, target) pairs

use crate::cancel::CancelToken;
use crate::engine::ExecutionEngine;
use futures::stream::{self, StreamExt};
use tracing::debug;
use xrun_command::CommandSpec;
use xrun_foundation::{Error, ExecutionOptions, ExecutionResult, Result, Target};

/// One unit of a fan-out
#[derive(Debug, Clone)]
pub struct Job {
    pub spec: CommandSpec,
    pub options: ExecutionOptions,
    pub target: Target,
}

impl Job {
    /// Job with default options
    pub fn new(spec: CommandSpec, target: Target) -> Self {
        Self {
            spec,
            options: ExecutionOptions::default(),
            target,
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Fan-out limits for `execute_all`
#[derive(Debug, Clone, Default)]
pub struct ParallelOptions {
    /// Jobs in flight at once; defaults to the engine's `maxParallel`, else unbounded
    pub max_concurrency: Option<usize>,
    /// Cancel the remaining jobs after the first failure or unsuccessful result
    pub fail_fast: bool,
}

impl ExecutionEngine {
    /// Run every job, reporting each outcome individually in input order
    ///
    /// With `fail_fast`, jobs still running are cancelled and jobs not yet
    /// started report [`Error::Cancelled`].
    pub async fn execute_all(
        &self,
        jobs: Vec<Job>,
        parallel: ParallelOptions,
    ) -> Vec<Result<ExecutionResult>> {
        let total = jobs.len();
        let limit = parallel
            .max_concurrency
            .or(self.config().max_parallel)
            .unwrap_or(total)
            .max(1);
        let fail_fast = parallel.fail_fast;
        let abort = CancelToken::new();
        debug!(jobs = total, limit, fail_fast, "Fan-out");

        let runs = jobs.into_iter().enumerate().map(|(index, job)| {
            let abort = &abort;
            async move {
                if abort.is_cancelled() {
                    return (index, Err(Error::Cancelled));
                }
                let result = self
                    .run(&job.spec, &job.options, &job.target, None, abort)
                    .await;
                let failed = !matches!(&result, Ok(r) if r.success());
                if fail_fast && failed {
                    abort.cancel();
                }
                (index, result)
            }
        });
        let mut indexed: Vec<(usize, Result<ExecutionResult>)> =
            stream::iter(runs).buffer_unordered(limit).collect().await;

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}
