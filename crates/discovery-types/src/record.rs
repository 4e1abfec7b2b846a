//! Service records
//!
//! A [`Record`] is what a provider publishes: the name of the service, its
//! type, where to reach it and free-form metadata. The registry assigns the
//! registration id and owns the stored copy; records handed back to callers
//! are snapshots.

use crate::ids::RecordId;
use crate::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Kind of service a record describes
///
/// The type selects the factory used to turn a record into a service handle.
/// It is serialized as a plain string (`"http-endpoint"`, `"event-bus"`, ...);
/// any unrecognized string is kept as [`ServiceType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceType {
    /// Service proxy reachable over the event bus
    EventBus,
    /// REST / HTTP endpoint
    HttpEndpoint,
    /// Source of messages published on an address
    MessageSource,
    /// Database or other data source
    DataSource,
    /// Application-defined type
    Custom(String),
    /// Not set
    #[default]
    Unknown,
}

impl ServiceType {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceType::EventBus => "event-bus",
            ServiceType::HttpEndpoint => "http-endpoint",
            ServiceType::MessageSource => "message-source",
            ServiceType::DataSource => "data-source",
            ServiceType::Custom(name) => name,
            ServiceType::Unknown => "unknown",
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        ServiceType::from(name.into())
    }

    /// Whether this type identifies a concrete kind of service.
    pub fn is_known(&self) -> bool {
        match self {
            ServiceType::Unknown => false,
            ServiceType::Custom(name) => !name.trim().is_empty(),
            _ => true,
        }
    }
}

impl From<String> for ServiceType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "event-bus" => ServiceType::EventBus,
            "http-endpoint" => ServiceType::HttpEndpoint,
            "message-source" => ServiceType::MessageSource,
            "data-source" => ServiceType::DataSource,
            "unknown" | "" => ServiceType::Unknown,
            _ => ServiceType::Custom(value),
        }
    }
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> Self {
        ServiceType::from(value.to_string())
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        match value {
            ServiceType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of a published service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    OutOfService,
    /// Not set; the store turns this into `Up` on publish
    #[default]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::OutOfService => "OUT_OF_SERVICE",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advertisement of one service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    registration: Option<RecordId>,

    name: String,

    #[serde(rename = "type", default)]
    service_type: ServiceType,

    #[serde(default)]
    location: JsonObject,

    #[serde(default)]
    metadata: JsonObject,

    #[serde(default)]
    status: Status,
}

impl Record {
    /// Create an unpublished record.
    pub fn new(name: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            registration: None,
            name: name.into(),
            service_type,
            location: JsonObject::new(),
            metadata: JsonObject::new(),
            status: Status::Unknown,
        }
    }

    pub fn with_location(mut self, location: JsonObject) -> Self {
        self.location = location;
        self
    }

    pub fn with_location_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.location.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonObject) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Registration id, present once the record has been published.
    pub fn id(&self) -> Option<&RecordId> {
        self.registration.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub fn location(&self) -> &JsonObject {
        &self.location
    }

    pub fn metadata(&self) -> &JsonObject {
        &self.metadata
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_published(&self) -> bool {
        self.registration.is_some()
    }

    /// Check the record can be published.
    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if self.name.trim().is_empty() {
            return Err(RecordValidationError::MissingName);
        }

        if !self.service_type.is_known() {
            return Err(RecordValidationError::MissingType);
        }

        if let Some(id) = &self.registration {
            return Err(RecordValidationError::AlreadyRegistered(id.clone()));
        }

        Ok(())
    }

    /// Validate the record and stamp it with a registration id.
    ///
    /// Used by record stores on insert. A record with status `UNKNOWN` is
    /// published as `UP`.
    pub fn register(mut self, id: RecordId) -> Result<Self, RecordValidationError> {
        self.validate()?;
        self.registration = Some(id);
        if self.status == Status::Unknown {
            self.status = Status::Up;
        }
        Ok(self)
    }

    /// Status transition applied by the owning store.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Merge metadata entries; a `null` value removes the key.
    pub fn merge_metadata(&mut self, updates: JsonObject) {
        for (key, value) in updates {
            if value.is_null() {
                self.metadata.remove(&key);
            } else {
                self.metadata.insert(key, value);
            }
        }
    }
}

/// Record validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordValidationError {
    #[error("Record name cannot be empty")]
    MissingName,

    #[error("Record type must be set")]
    MissingType,

    #[error("Record is already registered as {0}")]
    AlreadyRegistered(RecordId),

    #[error("Record '{0}' has not been published")]
    NotRegistered(String),
}
