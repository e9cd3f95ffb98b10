//! xrun CLI - Main entry point

mod exec;
mod target;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xrun_engine::ExecutionEngine;
use xrun_foundation::EngineConfig;

/// xrun - run one command on a local, SSH, Docker or Kubernetes target
#[derive(Parser, Debug)]
#[command(name = "xrun")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Engine config file (.json or .toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command
    Exec(exec::ExecArgs),
    /// Check that a target is reachable and accepts our credentials
    Check {
        #[command(flatten)]
        target: target::TargetArgs,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(args.config.as_ref())?;
    let engine = ExecutionEngine::new(config)?;

    let outcome = match args.command {
        Command::Exec(exec_args) => exec::exec(&engine, exec_args).await,
        Command::Check { target } => exec::check(&engine, target).await,
    };
    engine.shutdown().await;

    let code = match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("xrun: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
