//! Event System - progress events (start, data chunk, retry, end)
//!
//! ```ignore
//! let mut rx = engine.events();
//! while let Ok(event) = rx.recv().await {
//!     println!("{} {}", event.execution_id, event.kind.name());
//! }
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventListener, ListenerId};
pub use types::{EventKind, ExecutionEvent, ExecutionId, OutputStream};
