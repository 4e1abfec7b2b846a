//! The service discovery facade
//!
//! [`ServiceDiscovery`] is the entry point providers and consumers share. It
//! owns the record store, the factory table and the reference tracker, and
//! reports every state change on its event stream.
//!
//! ```ignore
//! let discovery = ServiceDiscovery::new(DiscoveryConfig::default());
//! discovery.register_factory(Arc::new(MyFactory));
//!
//! let id = discovery.publish(Record::new("svc-a", ServiceType::HttpEndpoint)).await?;
//! let record = discovery.get_record(&RecordFilter::by_name("svc-a")).await?;
//! let reference = discovery.get_reference(&record).await?;
//! let client = reference.get_as::<MyClient>()?;
//! // ...
//! discovery.release(&reference).await?;
//! ```

use crate::binder::Binder;
use crate::config::{DiscoveryConfig, SelectionPolicy};
use crate::error::{DiscoveryError, Result};
use crate::events::EventPublisher;
use crate::factory::{BindConfig, HandleKey, ServiceFactory};
use crate::matcher::RecordFilter;
use crate::store::{InMemoryRecordStore, RecordStore, StatusScope};
use crate::tracker::{BindMode, BindingSnapshot, ReferenceTracker, ServiceReference};
use discovery_types::{
    DiscoveryEvent, DiscoveryEventEnvelope, JsonObject, Record, RecordId, RecordValidationError,
    Status,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

/// Service registry and binding engine
pub struct ServiceDiscovery {
    config: DiscoveryConfig,
    store: Arc<dyn RecordStore>,
    binder: Binder,
    tracker: ReferenceTracker,
    events: EventPublisher,
    closed: AtomicBool,
    rotation: AtomicUsize,
}

impl ServiceDiscovery {
    /// Create a registry backed by an in-memory store.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryRecordStore::new()))
    }

    /// Create a registry backed by the given store.
    pub fn with_store(config: DiscoveryConfig, store: Arc<dyn RecordStore>) -> Self {
        let events = EventPublisher::new(config.events.capacity);
        let tracker = ReferenceTracker::new(events.clone(), config.binding.create_timeout());
        Self {
            config,
            store,
            binder: Binder::new(),
            tracker,
            events,
            closed: AtomicBool::new(false),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    /// Register the factory for its service type, returning the one it replaces.
    pub fn register_factory(
        &self,
        factory: Arc<dyn ServiceFactory>,
    ) -> Option<Arc<dyn ServiceFactory>> {
        self.binder.register(factory)
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEventEnvelope> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DiscoveryError::Closed);
        }
        Ok(())
    }

    // ========== Providers ==========

    /// Publish a record and return its registration id.
    #[instrument(skip(self, record), fields(name = %record.name()))]
    pub async fn publish(&self, record: Record) -> Result<RecordId> {
        self.ensure_open()?;

        let stored = self.store.insert(record).await?;
        let id = stored
            .id()
            .cloned()
            .ok_or_else(|| RecordValidationError::NotRegistered(stored.name().to_string()))?;

        info!(
            record = %id,
            service_type = %stored.service_type(),
            "Published record"
        );
        self.events.emit(DiscoveryEvent::RecordPublished {
            record_id: id.clone(),
            name: stored.name().to_string(),
            service_type: stored.service_type().to_string(),
        });

        Ok(id)
    }

    /// Withdraw a record. Returns whether a record was removed.
    ///
    /// Live references to the record stay valid until released, unless
    /// `binding.release_on_unpublish` is set.
    #[instrument(skip(self))]
    pub async fn unpublish(&self, id: &RecordId) -> Result<bool> {
        self.ensure_open()?;

        let Some(removed) = self.store.remove(id).await? else {
            debug!(record = %id, "Record already withdrawn");
            return Ok(false);
        };

        info!(record = %id, name = %removed.name(), "Unpublished record");
        self.events.emit(DiscoveryEvent::RecordUnpublished {
            record_id: id.clone(),
            name: removed.name().to_string(),
        });

        if self.config.binding.release_on_unpublish {
            let closed = self.tracker.release_all(id).await;
            if closed > 0 {
                info!(record = %id, bindings = closed, "Released bindings of unpublished record");
            }
        }

        Ok(true)
    }

    /// Change the status of a published record.
    pub async fn update_status(&self, id: &RecordId, status: Status) -> Result<Record> {
        self.ensure_open()?;

        let (previous, record) = self.store.update_status(id, status).await?;
        if previous != status {
            info!(record = %id, from = %previous, to = %status, "Record status changed");
            self.events.emit(DiscoveryEvent::StatusChanged {
                record_id: id.clone(),
                from: previous,
                to: status,
            });
        }
        Ok(record)
    }

    /// Merge metadata entries into a published record; `null` removes a key.
    pub async fn update_metadata(&self, id: &RecordId, metadata: JsonObject) -> Result<Record> {
        self.ensure_open()?;

        let record = self.store.update_metadata(id, metadata).await?;
        debug!(record = %id, "Record metadata updated");
        self.events.emit(DiscoveryEvent::MetadataUpdated {
            record_id: id.clone(),
        });
        Ok(record)
    }

    // ========== Consumers ==========

    /// The record matching the filter.
    ///
    /// Only `UP` records are considered unless the filter names a status.
    /// When several match, the configured [`SelectionPolicy`] picks one.
    pub async fn get_record(&self, filter: &RecordFilter) -> Result<Record> {
        let mut matched = self.get_records(filter).await?;
        if matched.is_empty() {
            return Err(DiscoveryError::NotFound(filter.to_string()));
        }

        let index = match self.config.selection {
            SelectionPolicy::MostRecent => matched.len() - 1,
            SelectionPolicy::FirstPublished => 0,
            SelectionPolicy::RoundRobin => {
                self.rotation.fetch_add(1, Ordering::Relaxed) % matched.len()
            }
        };
        Ok(matched.swap_remove(index))
    }

    pub async fn get_record_by_id(&self, id: &RecordId) -> Result<Record> {
        self.ensure_open()?;
        self.store.get(id).await
    }

    /// Every `UP` record matching the filter, in publish order.
    pub async fn get_records(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        self.get_records_in_scope(filter, StatusScope::UpOnly).await
    }

    /// Records matching the filter within a status scope, in publish order.
    pub async fn get_records_in_scope(
        &self,
        filter: &RecordFilter,
        scope: StatusScope,
    ) -> Result<Vec<Record>> {
        self.ensure_open()?;
        self.store.query(filter, scope).await
    }

    /// Bind a record to a service handle, sharing it with other consumers.
    pub async fn get_reference(&self, record: &Record) -> Result<ServiceReference> {
        self.bind(record, BindConfig::new(), BindMode::Shared).await
    }

    /// Bind a record with consumer-supplied configuration.
    ///
    /// The configuration is handed to the factory and the resulting handle is
    /// never shared.
    pub async fn get_reference_with_configuration(
        &self,
        record: &Record,
        config: BindConfig,
    ) -> Result<ServiceReference> {
        self.bind(record, config, BindMode::Exclusive).await
    }

    async fn bind(
        &self,
        record: &Record,
        config: BindConfig,
        mode: BindMode,
    ) -> Result<ServiceReference> {
        self.ensure_open()?;

        let id = record
            .id()
            .ok_or_else(|| RecordValidationError::NotRegistered(record.name().to_string()))?;
        let current = self.store.get(id).await?;
        let factory = self.binder.factory_for(current.service_type())?;

        let reference = self.tracker.acquire(&current, factory, config, mode).await?;

        // Lost a race with close(): the drain may have missed this binding
        if self.is_closed() {
            if let Err(err) = self.tracker.release(&reference).await {
                debug!(reference = %reference.id(), error = %err, "Binding already drained");
            }
            return Err(DiscoveryError::Closed);
        }

        // Unpublished while binding: the force-release may have missed it
        if self.config.binding.release_on_unpublish {
            if let Err(err @ DiscoveryError::RecordNotFound(_)) = self.store.get(id).await {
                if let Err(release) = self.tracker.release(&reference).await {
                    debug!(reference = %reference.id(), error = %release, "Binding already released");
                }
                return Err(err);
            }
        }
        Ok(reference)
    }

    /// Release one use of a reference. Returns the remaining use count.
    pub async fn release(&self, reference: &ServiceReference) -> Result<usize> {
        self.tracker.release(reference).await
    }

    /// Release one use of the binding that produced a service object.
    pub async fn release_service_object<T: ?Sized>(&self, object: &Arc<T>) -> Result<usize> {
        self.tracker.release_handle(HandleKey::of(object)).await
    }

    /// Tear down every binding of a record, whatever its use count.
    pub async fn release_all(&self, id: &RecordId) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.tracker.release_all(id).await)
    }

    /// Bindings currently tracked.
    pub fn references(&self) -> Vec<BindingSnapshot> {
        self.tracker.snapshot()
    }

    /// Release every binding and withdraw every record.
    ///
    /// Later operations fail with [`DiscoveryError::Closed`]. Closing twice is
    /// a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bindings = self.tracker.drain().await;
        let records = self.store.clear().await?;
        info!(bindings, records, "Service discovery closed");
        Ok(())
    }
}
