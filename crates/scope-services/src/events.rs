//! Broadcast event bus — publishes lifecycle notifications to subscribers.

use std::sync::atomic::{AtomicU64, Ordering};

use scope_protocol::{LifecycleEvent, LifecycleNotification, ScopeError};
use tokio::sync::broadcast;
use tracing::trace;

use crate::EventBus;

pub type NotificationReceiver = broadcast::Receiver<LifecycleNotification>;

pub struct BroadcastEventBus {
    tx: broadcast::Sender<LifecycleNotification>,
    fired: AtomicU64,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            fired: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.tx.subscribe()
    }

    /// Total notifications fired, whether or not anyone was listening.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn fire(&self, subject: &str, event: LifecycleEvent) -> Result<(), ScopeError> {
        self.fired.fetch_add(1, Ordering::Relaxed);
        trace!(subject, method = event.method(), "Lifecycle notification");
        // No subscribers is not an error
        let _ = self.tx.send(LifecycleNotification::new(event, subject));
        Ok(())
    }
}
