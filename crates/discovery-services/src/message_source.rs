//! Message sources
//!
//! A message source publishes messages on a bus address. Its record names
//! the address and the type of the messages (metadata key `message.type`).

use crate::bus::LocalBus;
use async_trait::async_trait;
use discovery_registry::{
    get_service, BindConfig, BindError, BoundService, RecordFilter, Result, ServiceDiscovery,
    ServiceFactory, ServiceHandle,
};
use discovery_types::{Record, ServiceType};
use serde_json::Value;
use std::fmt;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Metadata key naming the payload type of a message source
pub const MESSAGE_TYPE: &str = "message.type";

/// Record builders and typed lookup for message sources
pub struct MessageSource;

impl MessageSource {
    pub fn create_record(name: &str, address: &str, message_type: Option<&str>) -> Record {
        let record =
            Record::new(name, ServiceType::MessageSource).with_location_entry("endpoint", address);
        match message_type {
            Some(message_type) => record.with_metadata_entry(MESSAGE_TYPE, message_type),
            None => record,
        }
    }

    /// Look up a message source and bind a consumer to it.
    ///
    /// Every consumer gets its own receiver and sees every message.
    pub async fn get_consumer(
        discovery: &ServiceDiscovery,
        filter: &RecordFilter,
    ) -> Result<BoundService<MessageConsumer>> {
        get_service::<MessageConsumer>(discovery, filter, Some(BindConfig::new())).await
    }
}

/// Receives the messages published by a source
pub struct MessageConsumer {
    address: String,
    message_type: Option<String>,
    receiver: Mutex<broadcast::Receiver<Value>>,
}

impl MessageConsumer {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    /// Next message, or `None` once the source is gone.
    ///
    /// Messages dropped because the consumer fell behind are skipped.
    pub async fn recv(&self) -> Option<Value> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(address = %self.address, skipped, "Message consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("address", &self.address)
            .field("message_type", &self.message_type)
            .finish()
    }
}

/// Builds [`MessageConsumer`]s for `message-source` records
pub struct MessageConsumerFactory {
    bus: LocalBus,
}

impl MessageConsumerFactory {
    pub fn new(bus: LocalBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ServiceFactory for MessageConsumerFactory {
    fn service_type(&self) -> ServiceType {
        ServiceType::MessageSource
    }

    async fn create(
        &self,
        record: &Record,
        _config: &BindConfig,
    ) -> std::result::Result<ServiceHandle, BindError> {
        let address = record
            .location()
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| BindError::MissingLocation("endpoint".into()))?;

        Ok(ServiceHandle::new(
            ServiceType::MessageSource,
            MessageConsumer {
                address: address.to_string(),
                message_type: record
                    .metadata()
                    .get(MESSAGE_TYPE)
                    .and_then(Value::as_str)
                    .map(str::to_string),
                receiver: Mutex::new(self.bus.subscribe(address)),
            },
        ))
    }
}
