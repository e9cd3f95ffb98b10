//! # xrun-engine
//!
//! Orchestration layer for xrun.
//!
//! - `ExecutionEngine` - selects the adapter, applies timeout / retry /
//!   nothrow and normalises output into `ExecutionResult`
//! - `execute_streaming` - live chunks plus the buffered result
//! - `execute_all` - bounded, order-preserving fan-out
//! - `default_engine` - optional shared instance
//!
//! ```ignore
//! let engine = ExecutionEngine::new(EngineConfig::default())?;
//! let spec = CommandSpec::template("echo {}", ["a b"])?;
//! let result = engine.execute(&spec, &ExecutionOptions::new(), &Target::local()).await?;
//! assert_eq!(result.stdout(), "a b\n");
//! ```

mod attempt;
pub mod cancel;
pub mod engine;
pub mod global;
pub mod parallel;
pub mod streaming;

pub use cancel::CancelToken;
pub use engine::{EngineBuilder, ExecutionEngine};
pub use global::{default_engine, shutdown_default};
pub use parallel::{Job, ParallelOptions};
pub use streaming::{LiveChunks, PendingResult, StreamingExecution};
