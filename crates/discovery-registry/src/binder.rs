//! Service binding: factory dispatch and typed lookups
//!
//! The [`Binder`] maps each [`ServiceType`] to the factory able to build
//! handles for it. [`get_service`] and [`with_service`] compose a lookup, a
//! bind and the checked narrowing to the expected client type into a single
//! call, for long-lived and one-shot usage respectively.

use crate::discovery::ServiceDiscovery;
use crate::error::{DiscoveryError, Result};
use crate::factory::{BindConfig, ServiceFactory};
use crate::matcher::RecordFilter;
use crate::tracker::ServiceReference;
use dashmap::DashMap;
use discovery_types::ServiceType;
use std::any::Any;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

/// Factory table keyed by service type
#[derive(Default)]
pub struct Binder {
    factories: DashMap<ServiceType, Arc<dyn ServiceFactory>>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for its service type, returning the one it replaces.
    pub fn register(&self, factory: Arc<dyn ServiceFactory>) -> Option<Arc<dyn ServiceFactory>> {
        let service_type = factory.service_type();
        debug!(service_type = %service_type, "Registering service factory");
        self.factories.insert(service_type, factory)
    }

    pub fn unregister(&self, service_type: &ServiceType) -> Option<Arc<dyn ServiceFactory>> {
        self.factories.remove(service_type).map(|(_, factory)| factory)
    }

    pub fn factory_for(&self, service_type: &ServiceType) -> Result<Arc<dyn ServiceFactory>> {
        self.factories
            .get(service_type)
            .map(|factory| Arc::clone(factory.value()))
            .ok_or_else(|| DiscoveryError::UnsupportedType(service_type.clone()))
    }

    pub fn supports(&self, service_type: &ServiceType) -> bool {
        self.factories.contains_key(service_type)
    }

    pub fn supported_types(&self) -> Vec<ServiceType> {
        self.factories.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// A typed service object together with the reference that keeps it bound
pub struct BoundService<T> {
    service: Arc<T>,
    reference: ServiceReference,
}

impl<T> BoundService<T> {
    pub fn service(&self) -> &Arc<T> {
        &self.service
    }

    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    /// Release the binding.
    pub async fn release(self) -> Result<()> {
        self.reference.release().await
    }

    /// Split into the service object and its reference.
    pub fn into_parts(self) -> (Arc<T>, ServiceReference) {
        (self.service, self.reference)
    }

    /// Keep only the service object. The binding is then released with
    /// [`ServiceDiscovery::release_service_object`].
    pub fn into_service(self) -> Arc<T> {
        self.service
    }
}

impl<T> Deref for BoundService<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.service
    }
}

/// Look up a record, bind it and narrow the handle to `T`.
///
/// Without `config` the handle is shared with other consumers of the same
/// record; with `config` a fresh handle is created for this caller. The
/// binding stays alive until released, either through the returned value or,
/// once its reference is dropped, with
/// [`ServiceDiscovery::release_service_object`].
pub async fn get_service<T: Any + Send + Sync>(
    discovery: &ServiceDiscovery,
    filter: &RecordFilter,
    config: Option<BindConfig>,
) -> Result<BoundService<T>> {
    let record = discovery.get_record(filter).await?;
    let reference = match config {
        Some(config) => {
            discovery
                .get_reference_with_configuration(&record, config)
                .await?
        }
        None => discovery.get_reference(&record).await?,
    };

    match reference.get_as::<T>() {
        Ok(service) => Ok(BoundService { service, reference }),
        Err(err) => {
            if let Err(release_err) = reference.release().await {
                warn!(
                    reference = %reference.id(),
                    error = %release_err,
                    "Failed to release reference after cast error"
                );
            }
            Err(err)
        }
    }
}

/// Bind a service for the duration of one operation.
///
/// The reference is released once the future returned by `f` completes.
pub async fn with_service<T, F, Fut, R>(
    discovery: &ServiceDiscovery,
    filter: &RecordFilter,
    config: Option<BindConfig>,
    f: F,
) -> Result<R>
where
    T: Any + Send + Sync,
    F: FnOnce(Arc<T>) -> Fut,
    Fut: Future<Output = R>,
{
    let bound = get_service::<T>(discovery, filter, config).await?;
    let (service, reference) = bound.into_parts();

    let output = f(service).await;
    reference.release().await?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::testing::{CountingFactory, TestClient};
    use discovery_types::Record;
    use std::sync::atomic::Ordering;

    async fn discovery_with(factory: Arc<CountingFactory>) -> ServiceDiscovery {
        let discovery = ServiceDiscovery::new(DiscoveryConfig::default());
        discovery.register_factory(factory);
        discovery
            .publish(
                Record::new("svc-a", ServiceType::HttpEndpoint)
                    .with_location_entry("host", "localhost"),
            )
            .await
            .unwrap();
        discovery
    }

    #[test]
    fn test_factory_dispatch() {
        let binder = Binder::new();
        assert!(matches!(
            binder.factory_for(&ServiceType::HttpEndpoint),
            Err(DiscoveryError::UnsupportedType(ServiceType::HttpEndpoint))
        ));

        assert!(binder.register(Arc::new(CountingFactory::new())).is_none());
        assert!(binder.supports(&ServiceType::HttpEndpoint));
        assert!(binder.register(Arc::new(CountingFactory::new())).is_some());
        assert_eq!(binder.supported_types(), vec![ServiceType::HttpEndpoint]);

        assert!(binder.unregister(&ServiceType::HttpEndpoint).is_some());
        assert!(!binder.supports(&ServiceType::HttpEndpoint));
    }

    #[tokio::test]
    async fn test_get_service_long_lived() {
        let factory = Arc::new(CountingFactory::new());
        let discovery = discovery_with(factory.clone()).await;

        let client = get_service::<TestClient>(&discovery, &RecordFilter::by_name("svc-a"), None)
            .await
            .unwrap();
        assert_eq!(client.serial, 0);
        assert_eq!(client.reference().use_count(), 1);

        client.release().await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_service_cast_error_releases() {
        let factory = Arc::new(CountingFactory::new());
        let discovery = discovery_with(factory.clone()).await;

        let result = get_service::<String>(&discovery, &RecordFilter::by_name("svc-a"), None).await;
        assert!(matches!(result, Err(DiscoveryError::Cast { .. })));
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(discovery.references().is_empty());
    }

    #[tokio::test]
    async fn test_with_service_releases_after_use() {
        let factory = Arc::new(CountingFactory::new());
        let discovery = discovery_with(factory.clone()).await;

        let serial = with_service(
            &discovery,
            &RecordFilter::by_name("svc-a"),
            None,
            |client: Arc<TestClient>| async move { client.serial },
        )
        .await
        .unwrap();

        assert_eq!(serial, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(discovery.references().is_empty());
    }

    #[tokio::test]
    async fn test_get_service_with_config_is_unshared() {
        let factory = Arc::new(CountingFactory::new());
        let discovery = discovery_with(factory.clone()).await;
        let filter = RecordFilter::by_name("svc-a");

        let shared = get_service::<TestClient>(&discovery, &filter, None).await.unwrap();
        let mut config = BindConfig::new();
        config.insert("username".into(), "clement".into());
        let fresh = get_service::<TestClient>(&discovery, &filter, Some(config))
            .await
            .unwrap();

        assert_ne!(shared.reference().id(), fresh.reference().id());
        assert!(!fresh.reference().is_shared());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_service_no_match() {
        let factory = Arc::new(CountingFactory::new());
        let discovery = discovery_with(factory).await;

        let result =
            get_service::<TestClient>(&discovery, &RecordFilter::by_name("missing"), None).await;
        assert!(matches!(result, Err(DiscoveryError::NotFound(_))));
    }
}
