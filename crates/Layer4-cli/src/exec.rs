//! `exec` and `check` subcommands

use crate::target::TargetArgs;
use clap::Args;
use futures::StreamExt;
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use xrun_command::{CommandBuilder, CommandSpec};
use xrun_engine::ExecutionEngine;
use xrun_foundation::{
    is_valid_env_name, Error, ExecutionOptions, ExecutionResult, OutputStream, Result, RetryPolicy,
};

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Working directory on the target
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Environment variable for the command (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Shell that runs the command line
    #[arg(long, value_name = "SHELL")]
    pub shell: Option<String>,

    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Extra attempts after a connection failure or timeout
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub retries: u32,

    /// Report structural failures in the result instead of failing
    #[arg(long)]
    pub nothrow: bool,

    /// Don't echo output while the command runs
    #[arg(long)]
    pub quiet: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// A single word is a shell line; several words are escaped as arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl ExecArgs {
    pub fn spec(&self) -> Result<CommandSpec> {
        match self.command.as_slice() {
            [line] => CommandSpec::raw(line.clone()),
            [program, args @ ..] => CommandBuilder::new(program.as_str()).args(args.iter().map(String::as_str)).build(),
            [] => Err(Error::Validation("no command given".into())),
        }
    }

    pub fn options(&self) -> Result<ExecutionOptions> {
        let mut options = ExecutionOptions::new();
        if let Some(cwd) = &self.cwd {
            options = options.with_cwd(cwd);
        }
        for pair in &self.env {
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| is_valid_env_name(key))
                .ok_or_else(|| Error::Validation(format!("expected KEY=VALUE, got {:?}", pair)))?;
            options = options.with_env(key, value);
        }
        if let Some(shell) = &self.shell {
            options = options.with_shell(shell);
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        if self.retries > 0 {
            options = options.with_retry(RetryPolicy::attempts(self.retries + 1));
        }
        if self.nothrow {
            options = options.nothrow();
        }
        if self.quiet {
            options = options.quiet();
        }
        Ok(options)
    }
}

/// Process exit code for a finished command
pub fn result_exit_code(result: &ExecutionResult) -> i32 {
    if let Some(cause) = result.cause() {
        return cause.kind.exit_code();
    }
    match (result.exit_code(), result.signal()) {
        (Some(code), _) => code,
        (None, Some(_)) => 1,
        (None, None) => 0,
    }
}

pub async fn exec(engine: &ExecutionEngine, args: ExecArgs) -> Result<i32> {
    let target = args.target.to_target()?;
    let spec = args.spec()?;
    let options = args.options()?;
    debug!(target_label = %target.label(), command = %spec, "exec");

    let result = if args.json || args.quiet {
        engine.execute(&spec, &options, &target).await?
    } else {
        let mut run = engine.execute_streaming(&spec, &options, &target);
        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        loop {
            tokio::select! {
                chunk = run.chunks.next() => match chunk {
                    Some(chunk) => {
                        // a closed stdout only loses the echo
                        let _ = match chunk.stream {
                            OutputStream::Stdout => stdout.write_all(&chunk.data).and_then(|_| stdout.flush()),
                            OutputStream::Stderr => stderr.write_all(&chunk.data).and_then(|_| stderr.flush()),
                        };
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    run.cancel.cancel();
                }
            }
        }
        run.result.await?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(cause) = result.cause() {
        eprintln!("xrun: {}", cause);
    }
    Ok(result_exit_code(&result))
}

pub async fn check(engine: &ExecutionEngine, target: TargetArgs) -> Result<i32> {
    let target = target.to_target()?;
    engine.validate(&target).await?;
    println!("{}: ok", target.label());
    Ok(0)
}
