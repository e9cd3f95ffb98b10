//! Event Bus - progress event broadcast
//!
//! Events go to every broadcast receiver and to every registered listener.
//! Publishing never blocks on slow receivers; lagging receivers lose events.

use super::types::ExecutionEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

// ============================================================================
// EventListener Trait
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Push-style consumer, e.g. a progress UI
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &ExecutionEvent);
}

// ============================================================================
// EventBus
// ============================================================================

pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
    listeners: RwLock<HashMap<ListenerId, Arc<dyn EventListener>>>,
    listener_counter: AtomicU64,
    event_count: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));
        debug!(listener_name = listener.name(), listener_id = %id, "Registering event listener");
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.write().await.remove(&id).is_some()
    }

    /// Broadcast receiver (pull style)
    pub fn receiver(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub async fn publish(&self, event: ExecutionEvent) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        trace!(
            execution_id = %event.execution_id,
            event = event.kind.name(),
            "Publishing event"
        );

        // no receivers is fine
        let _ = self.sender.send(event.clone());

        let listeners = self.listeners.read().await;
        for listener in listeners.values() {
            listener.on_event(&event).await;
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
