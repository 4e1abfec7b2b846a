//! Registry error types

use discovery_types::{RecordId, RecordValidationError, ServiceType};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid record: {0}")]
    Validation(#[from] RecordValidationError),

    #[error("No record matches filter {0}")]
    NotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Failed to bind service '{name}': {source}")]
    Bind {
        name: String,
        #[source]
        source: Arc<BindError>,
    },

    #[error("No factory registered for service type '{0}'")]
    UnsupportedType(ServiceType),

    #[error("Service object is a {actual}, not a {expected}")]
    Cast {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid release: {0}")]
    Use(String),

    #[error("Service discovery is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    pub(crate) fn bind(name: impl Into<String>, source: impl Into<Arc<BindError>>) -> Self {
        DiscoveryError::Bind {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Failure raised by a service factory while creating or destroying a handle
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Record location is missing '{0}'")]
    MissingLocation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Handle creation did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Record was withdrawn while its handle was being created")]
    Revoked,

    #[error("{0}")]
    Other(String),
}

impl BindError {
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BindError::Transport(Box::new(err))
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
