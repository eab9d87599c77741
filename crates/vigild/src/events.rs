use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use vigil_core::events::{SupervisorEvent, SupervisorEventKind};
use vigil_core::types::TaskKey;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out channel for lifecycle events. Publishing never blocks and never
/// fails when nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
    published: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, key: &TaskKey, kind: SupervisorEventKind) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(SupervisorEvent::now(key.clone(), kind));
    }

    /// Total events published since creation, delivered or not.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
