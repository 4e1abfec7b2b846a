//! Discovery Services - Built-in service types
//!
//! Each service type comes with a record builder for providers, a factory
//! turning records into client objects and typed lookups for consumers:
//!
//! - **HttpEndpoint**: REST APIs, bound to an [`HttpClient`]
//! - **EventBusService**: services on a bus address, bound to an [`EventBusProxy`]
//! - **DataSource**: databases, bound to a [`DataSourceClient`]
//! - **MessageSource**: message publishers, bound to a [`MessageConsumer`]

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod bus;
pub mod data_source;
pub mod event_bus;
pub mod http;
pub mod message_source;

pub use bus::LocalBus;
pub use data_source::{DataSource, DataSourceClient, DataSourceFactory};
pub use event_bus::{EventBusProxy, EventBusProxyFactory, EventBusService, SERVICE_INTERFACE};
pub use http::{HttpClient, HttpClientFactory, HttpEndpoint};
pub use message_source::{MessageConsumer, MessageConsumerFactory, MessageSource, MESSAGE_TYPE};

use discovery_registry::ServiceDiscovery;
use std::sync::Arc;

/// Register the factories of every built-in service type.
///
/// Event-bus services and message sources are reached through `bus`.
pub fn register_builtin_factories(discovery: &ServiceDiscovery, bus: &LocalBus) {
    discovery.register_factory(Arc::new(HttpClientFactory));
    discovery.register_factory(Arc::new(EventBusProxyFactory::new(bus.clone())));
    discovery.register_factory(Arc::new(DataSourceFactory));
    discovery.register_factory(Arc::new(MessageConsumerFactory::new(bus.clone())));
}
