//! Event stream for registry activity

use discovery_types::{DiscoveryEvent, DiscoveryEventEnvelope};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity for the event stream
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcasts registry events to any number of subscribers
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DiscoveryEventEnvelope>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit(&self, event: DiscoveryEvent) {
        let envelope = DiscoveryEventEnvelope::new(event);
        trace!(event_id = %envelope.id, "Emitting discovery event");
        // No subscribers is fine
        let _ = self.tx.send(envelope);
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
