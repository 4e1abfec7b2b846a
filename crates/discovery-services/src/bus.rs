//! In-process message bus
//!
//! Event-bus services and message sources are reached through addresses on a
//! bus. [`LocalBus`] keeps one broadcast channel per address, which is enough
//! for services living in the same process as their consumers.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-address channel capacity
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Address-keyed broadcast bus
#[derive(Clone)]
pub struct LocalBus {
    channels: Arc<DashMap<String, broadcast::Sender<Value>>>,
    capacity: usize,
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` messages per address, at least one.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, address: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Send a message to every consumer of `address`.
    ///
    /// Returns the number of consumers reached.
    pub fn publish(&self, address: &str, message: Value) -> usize {
        let delivered = self.sender(address).send(message).unwrap_or(0);
        trace!(address, delivered, "Published bus message");
        delivered
    }

    pub fn subscribe(&self, address: &str) -> broadcast::Receiver<Value> {
        self.sender(address).subscribe()
    }

    pub fn consumer_count(&self, address: &str) -> usize {
        self.channels
            .get(address)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
