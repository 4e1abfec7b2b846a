//! Discovery Registry - Service registry and reference-counted binding engine
//!
//! This crate provides:
//!
//! - **RecordStore**: stores published records and answers filtered queries
//! - **Matcher**: exact-match and predicate filters over records
//! - **ReferenceTracker**: binds records to service handles and counts their uses
//! - **Binder**: maps service types to the factories that build their handles
//! - **ServiceDiscovery**: the facade providers and consumers share
//!
//! ## Handle lifecycle
//!
//! A handle is created by its factory on the first bind of a record and
//! shared by later binds with the same configuration. It is destroyed when
//! its last use is released, when the record's bindings are force-released,
//! or when the registry is closed.
//!
//! ## In-Memory vs Persistent
//!
//! The record store provided here lives in process memory. Stores backed by a
//! shared database can implement the same trait.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod binder;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod factory;
pub mod logging;
pub mod matcher;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod testing;

// Re-exports
pub use binder::{get_service, with_service, Binder, BoundService};
pub use config::{BindingConfig, DiscoveryConfig, EventsConfig, LoggingConfig, SelectionPolicy};
pub use discovery::ServiceDiscovery;
pub use error::{BindError, DiscoveryError, Result};
pub use events::EventPublisher;
pub use factory::{BindConfig, HandleKey, ServiceFactory, ServiceHandle};
pub use logging::init_tracing;
pub use matcher::{matches, RecordFilter, WILDCARD};
pub use store::{InMemoryRecordStore, RecordStore, StatusScope};
pub use tracker::{BindMode, BindingSnapshot, ReferenceTracker, ServiceReference};
