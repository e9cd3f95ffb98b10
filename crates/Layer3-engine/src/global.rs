//! Process-wide default engine, created on first use

use crate::engine::ExecutionEngine;
use parking_lot::Mutex;
use std::sync::OnceLock;
use tracing::debug;
use xrun_foundation::{EngineConfig, Result};

static DEFAULT_ENGINE: OnceLock<Mutex<Option<ExecutionEngine>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<ExecutionEngine>> {
    DEFAULT_ENGINE.get_or_init(|| Mutex::new(None))
}

/// Shared engine built from the default config plus `XRUN_*` overrides
///
/// Prefer an explicit [`ExecutionEngine`] where one can be passed around.
pub fn default_engine() -> Result<ExecutionEngine> {
    let mut slot = slot().lock();
    if let Some(engine) = slot.as_ref() {
        return Ok(engine.clone());
    }
    let engine = ExecutionEngine::new(EngineConfig::default().with_env_overrides()?)?;
    debug!("Created default execution engine");
    *slot = Some(engine.clone());
    Ok(engine)
}

/// Shut down the default engine; the next [`default_engine`] builds a fresh one
pub async fn shutdown_default() {
    let engine = slot().lock().take();
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
}
