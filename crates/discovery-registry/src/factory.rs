//! Service factories and type-erased service handles
//!
//! A [`ServiceFactory`] turns a record into a live client object (an HTTP
//! client, a database pool, an event-bus proxy) and tears it down again. The
//! registry never looks inside the object; it stores it as a
//! [`ServiceHandle`] tagged with its concrete type so consumers can narrow it
//! back with a checked [`ServiceHandle::get_as`].

use crate::error::{BindError, DiscoveryError, Result};
use async_trait::async_trait;
use discovery_types::{JsonObject, Record, ServiceType};
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

/// Consumer-supplied configuration passed to a factory at bind time.
pub type BindConfig = JsonObject;

/// Identity of a service object, used to find its binding on release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey(usize);

impl HandleKey {
    /// Identity of the object behind `object`.
    pub fn of<T: ?Sized>(object: &Arc<T>) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}

/// Type-erased service object with its capability tag
#[derive(Clone)]
pub struct ServiceHandle {
    service_type: ServiceType,
    capability: &'static str,
    object: Arc<dyn Any + Send + Sync>,
}

impl ServiceHandle {
    pub fn new<T: Any + Send + Sync>(service_type: ServiceType, object: T) -> Self {
        Self::from_arc(service_type, Arc::new(object))
    }

    pub fn from_arc<T: Any + Send + Sync>(service_type: ServiceType, object: Arc<T>) -> Self {
        Self {
            service_type,
            capability: type_name::<T>(),
            object,
        }
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    /// Rust type name of the wrapped object.
    pub fn capability(&self) -> &'static str {
        self.capability
    }

    pub fn key(&self) -> HandleKey {
        HandleKey::of(&self.object)
    }

    pub fn is<T: Any>(&self) -> bool {
        self.object.is::<T>()
    }

    /// Narrow the handle to the expected service object type.
    pub fn get_as<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        Arc::clone(&self.object)
            .downcast::<T>()
            .map_err(|_| DiscoveryError::Cast {
                expected: type_name::<T>(),
                actual: self.capability,
            })
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_type", &self.service_type)
            .field("capability", &self.capability)
            .finish()
    }
}

/// Constructor/destructor pair for one service type
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    /// Service type this factory handles
    fn service_type(&self) -> ServiceType;

    /// Build a service object for the record. May perform I/O.
    async fn create(
        &self,
        record: &Record,
        config: &BindConfig,
    ) -> std::result::Result<ServiceHandle, BindError>;

    /// Release the resources held by a handle.
    ///
    /// Called once, when the last use of the handle is released. Errors are
    /// logged by the caller.
    async fn destroy(&self, handle: ServiceHandle) -> std::result::Result<(), BindError> {
        drop(handle);
        Ok(())
    }
}
