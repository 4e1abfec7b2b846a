//! Event-bus services
//!
//! A service listening on a bus address is advertised with the interface it
//! implements (metadata key `service.interface`). Consumers look it up by
//! interface and talk to it through an [`EventBusProxy`].

use crate::bus::LocalBus;
use async_trait::async_trait;
use discovery_registry::{
    get_service, BindConfig, BindError, BoundService, RecordFilter, Result, ServiceDiscovery,
    ServiceFactory, ServiceHandle,
};
use discovery_types::{JsonObject, Record, ServiceType};
use serde_json::Value;
use std::fmt;

/// Metadata key naming the interface a service implements
pub const SERVICE_INTERFACE: &str = "service.interface";

/// Record builders and typed lookups for event-bus services
pub struct EventBusService;

impl EventBusService {
    pub fn create_record(
        name: &str,
        address: &str,
        interface: &str,
        mut metadata: JsonObject,
    ) -> Record {
        metadata.insert(SERVICE_INTERFACE.to_string(), Value::from(interface));
        Record::new(name, ServiceType::EventBus)
            .with_location_entry("endpoint", address)
            .with_metadata(metadata)
    }

    /// Bind the service implementing `interface`.
    pub async fn get_proxy(
        discovery: &ServiceDiscovery,
        interface: &str,
    ) -> Result<BoundService<EventBusProxy>> {
        let filter = RecordFilter::all()
            .and("type", ServiceType::EventBus.as_str())
            .and(SERVICE_INTERFACE, interface);
        get_service::<EventBusProxy>(discovery, &filter, None).await
    }

    /// Bind the event-bus service matching `filter`.
    pub async fn get_service_proxy_with_filter(
        discovery: &ServiceDiscovery,
        filter: &RecordFilter,
    ) -> Result<BoundService<EventBusProxy>> {
        get_service::<EventBusProxy>(discovery, filter, None).await
    }
}

/// Client side of a service reachable on the bus
pub struct EventBusProxy {
    address: String,
    interface: Option<String>,
    bus: LocalBus,
}

impl EventBusProxy {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Send a message to the service. Returns the number of listeners reached.
    pub fn send(&self, body: Value) -> usize {
        self.bus.publish(&self.address, body)
    }
}

impl fmt::Debug for EventBusProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusProxy")
            .field("address", &self.address)
            .field("interface", &self.interface)
            .finish()
    }
}

/// Builds [`EventBusProxy`]s for `event-bus` records
pub struct EventBusProxyFactory {
    bus: LocalBus,
}

impl EventBusProxyFactory {
    pub fn new(bus: LocalBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ServiceFactory for EventBusProxyFactory {
    fn service_type(&self) -> ServiceType {
        ServiceType::EventBus
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
            ServiceType::EventBus,
            EventBusProxy {
                address: address.to_string(),
                interface: record
                    .metadata()
                    .get(SERVICE_INTERFACE)
                    .and_then(Value::as_str)
                    .map(str::to_string),
                bus: self.bus.clone(),
            },
        ))
    }
}
