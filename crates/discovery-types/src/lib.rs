//! Discovery Types - Core types for service discovery
//!
//! A provider advertises a service instance by publishing a [`Record`]. A
//! consumer finds records through the registry and binds them to live,
//! typed service handles.
//!
//! ## Key Concepts
//!
//! - **Record**: advertisement of one service instance (name, type, location, metadata, status)
//! - **ServiceType**: kind of service a record describes, used to pick a factory
//! - **Status**: availability; only `UP` records are returned by default queries
//! - **RecordId / ReferenceId**: strongly-typed identifiers
//! - **Events**: lifecycle notifications emitted by the registry

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod ids;
pub mod record;

pub use events::{DiscoveryEvent, DiscoveryEventEnvelope};
pub use ids::{RecordId, ReferenceId};
pub use record::{Record, RecordValidationError, ServiceType, Status};

/// Free-form JSON object used for record locations, metadata and bind configuration.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;
