//! Reference tracking for bound service handles
//!
//! Every bind produces a *lease* on a binding. A binding owns one service
//! handle and is torn down when its last lease is released. Shared binds on
//! the same record and configuration reuse the binding instead of creating a
//! second handle.
//!
//! ## Locking
//!
//! Each binding has its own mutex guarding its phase and leases. The mutex is
//! never held across an `.await`; in particular the factory's `create` runs
//! in a spawned task while the binding sits in the `Pending` phase, and
//! concurrent claimants wait on the binding's `settled` channel. The spawned
//! task always runs to completion, so a caller that gives up while waiting
//! never leaks the handle: when no lease is left at completion the handle is
//! destroyed right away.

use crate::error::{BindError, DiscoveryError, Result};
use crate::events::EventPublisher;
use crate::factory::{BindConfig, HandleKey, ServiceFactory, ServiceHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use discovery_types::{
    DiscoveryEvent, Record, RecordId, RecordValidationError, ReferenceId,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How a bind may reuse existing handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Reuse the live handle bound to the same record and configuration
    Shared,
    /// Always create a fresh, unshared handle
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    record_id: RecordId,
    config: String,
}

impl BindingKey {
    fn new(record_id: &RecordId, config: &BindConfig) -> Self {
        let sorted: BTreeMap<_, _> = config.iter().collect();
        Self {
            record_id: record_id.clone(),
            config: serde_json::to_string(&sorted).unwrap_or_default(),
        }
    }
}

enum Phase {
    Pending,
    Live(ServiceHandle),
    Failed(Arc<BindError>),
    Closed,
}

/// One outstanding use of a binding
struct Lease {
    id: u64,
    /// Handed out as a `ServiceReference` and reported as acquired
    acquired: bool,
    /// The owning `ServiceReference` was dropped; only the service object is left
    detached: bool,
}

/// Which lease a release gives up
#[derive(Clone, Copy)]
enum LeaseSelector {
    /// The lease held by a claim or a reference
    Exact(u64),
    /// Any lease whose reference was dropped
    Detached,
}

struct BindingState {
    phase: Phase,
    leases: Vec<Lease>,
    next_lease: u64,
}

impl BindingState {
    fn add_lease(&mut self) -> u64 {
        let id = self.next_lease;
        self.next_lease += 1;
        self.leases.push(Lease {
            id,
            acquired: false,
            detached: false,
        });
        id
    }

    fn has_lease(&self, id: u64) -> bool {
        self.leases.iter().any(|lease| lease.id == id)
    }

    fn lease_mut(&mut self, id: u64) -> Option<&mut Lease> {
        self.leases.iter_mut().find(|lease| lease.id == id)
    }

    fn find(&self, selector: LeaseSelector) -> Option<usize> {
        match selector {
            LeaseSelector::Exact(id) => self.leases.iter().position(|lease| lease.id == id),
            LeaseSelector::Detached => self.leases.iter().rposition(|lease| lease.detached),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Pending | Phase::Live(_))
    }
}

struct Binding {
    id: ReferenceId,
    record: Record,
    record_id: RecordId,
    key: Option<BindingKey>,
    factory: Arc<dyn ServiceFactory>,
    state: Mutex<BindingState>,
    settled: watch::Sender<bool>,
}

impl Binding {
    fn new(
        record: Record,
        record_id: RecordId,
        key: Option<BindingKey>,
        factory: Arc<dyn ServiceFactory>,
    ) -> Arc<Self> {
        let (settled, _) = watch::channel(false);
        Arc::new(Self {
            id: ReferenceId::generate(),
            record,
            record_id,
            key,
            factory,
            state: Mutex::new(BindingState {
                phase: Phase::Pending,
                leases: Vec::new(),
                next_lease: 0,
            }),
            settled,
        })
    }
}

/// Point-in-time view of one binding
#[derive(Debug, Clone, Serialize)]
pub struct BindingSnapshot {
    pub reference_id: ReferenceId,
    pub record_id: RecordId,
    pub record_name: String,
    pub use_count: usize,
    pub shared: bool,
    pub live: bool,
}

/// Tracks live bindings and their use counts
#[derive(Clone)]
pub struct ReferenceTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    bindings: DashMap<ReferenceId, Arc<Binding>>,
    shared: DashMap<BindingKey, Arc<Binding>>,
    by_handle: DashMap<HandleKey, Arc<Binding>>,
    events: EventPublisher,
    create_timeout: Option<Duration>,
}

impl ReferenceTracker {
    pub fn new(events: EventPublisher, create_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                bindings: DashMap::new(),
                shared: DashMap::new(),
                by_handle: DashMap::new(),
                events,
                create_timeout,
            }),
        }
    }

    /// Bind a published record to a service handle.
    pub async fn acquire(
        &self,
        record: &Record,
        factory: Arc<dyn ServiceFactory>,
        config: BindConfig,
        mode: BindMode,
    ) -> Result<ServiceReference> {
        let record_id = record
            .id()
            .cloned()
            .ok_or_else(|| RecordValidationError::NotRegistered(record.name().to_string()))?;

        let (claim, creator) = match mode {
            BindMode::Shared => self.claim_shared(record, &record_id, &factory, &config),
            BindMode::Exclusive => {
                let binding = Binding::new(record.clone(), record_id, None, factory);
                let lease = binding.state.lock().add_lease();
                self.inner
                    .bindings
                    .insert(binding.id.clone(), Arc::clone(&binding));
                (Claim::new(self.clone(), binding, lease), true)
            }
        };

        if creator {
            self.spawn_create(Arc::clone(&claim.binding), config);
        }

        self.await_settled(claim).await
    }

    /// Take a lease on the shared binding for (record, config), inserting a
    /// pending binding when there is none. Returns whether the caller must
    /// start the creation.
    fn claim_shared(
        &self,
        record: &Record,
        record_id: &RecordId,
        factory: &Arc<dyn ServiceFactory>,
        config: &BindConfig,
    ) -> (Claim, bool) {
        let key = BindingKey::new(record_id, config);
        loop {
            let existing = match self.inner.shared.entry(key.clone()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let binding = Binding::new(
                        record.clone(),
                        record_id.clone(),
                        Some(key.clone()),
                        Arc::clone(factory),
                    );
                    let lease = binding.state.lock().add_lease();
                    entry.insert(Arc::clone(&binding));
                    self.inner
                        .bindings
                        .insert(binding.id.clone(), Arc::clone(&binding));
                    return (Claim::new(self.clone(), binding, lease), true);
                }
            };

            // Increment first, then check the binding is still open. Closing
            // happens under the same lock, so an open binding cannot be
            // destroyed underneath the new lease.
            let lease = {
                let mut state = existing.state.lock();
                if state.is_open() {
                    Some(state.add_lease())
                } else {
                    None
                }
            };

            match lease {
                Some(lease) => return (Claim::new(self.clone(), existing, lease), false),
                None => {
                    self.inner
                        .shared
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &existing));
                }
            }
        }
    }

    fn spawn_create(&self, binding: Arc<Binding>, config: BindConfig) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let creating = Arc::clone(&binding);
            let result = tokio::spawn(async move {
                creating.factory.create(&creating.record, &config).await
            })
            .await
            .unwrap_or_else(|err| Err(BindError::Other(format!("Service factory panicked: {}", err))));

            tracker.finish_create(&binding, result).await;
        });
    }

    async fn finish_create(
        &self,
        binding: &Arc<Binding>,
        result: std::result::Result<ServiceHandle, BindError>,
    ) {
        let (orphan, settled_open) = {
            let mut state = binding.state.lock();
            match result {
                Ok(handle) if state.is_open() && !state.leases.is_empty() => {
                    self.inner
                        .by_handle
                        .insert(handle.key(), Arc::clone(binding));
                    state.phase = Phase::Live(handle);
                    (None, true)
                }
                Ok(handle) => {
                    state.phase = Phase::Closed;
                    (Some(handle), false)
                }
                Err(err) => {
                    warn!(
                        reference = %binding.id,
                        record = %binding.record_id,
                        error = %err,
                        "Service factory failed to create handle"
                    );
                    state.leases.clear();
                    if state.is_open() {
                        state.phase = Phase::Failed(Arc::new(err));
                    }
                    (None, false)
                }
            }
        };

        if !settled_open {
            self.forget(binding, None);
        }
        binding.settled.send_replace(true);

        if let Some(handle) = orphan {
            debug!(
                reference = %binding.id,
                "Handle finished creating after every claimant left, destroying it"
            );
            self.destroy(binding, handle).await;
        }
    }

    async fn await_settled(&self, claim: Claim) -> Result<ServiceReference> {
        let mut settled = claim.binding.settled.subscribe();
        let name = claim.binding.record.name().to_string();

        let waited = match self.inner.create_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, settled.wait_for(|done| *done)).await {
                    Ok(waited) => waited.map(|_| ()),
                    Err(_) => {
                        debug!(reference = %claim.binding.id, "Gave up waiting for handle creation");
                        return Err(DiscoveryError::bind(name, BindError::Timeout(limit)));
                    }
                }
            }
            None => settled.wait_for(|done| *done).await.map(|_| ()),
        };
        if waited.is_err() {
            return Err(DiscoveryError::bind(name, BindError::Revoked));
        }

        let outcome = {
            let state = claim.binding.state.lock();
            match &state.phase {
                Phase::Live(handle) if state.has_lease(claim.lease) => {
                    Ok((handle.clone(), state.leases.len()))
                }
                Phase::Live(_) => Err(DiscoveryError::Use(format!(
                    "{} was released before the bind completed",
                    claim.binding.id
                ))),
                Phase::Failed(err) => Err(DiscoveryError::bind(name, Arc::clone(err))),
                Phase::Pending | Phase::Closed => {
                    Err(DiscoveryError::bind(name, BindError::Revoked))
                }
            }
        };

        let (handle, use_count) = outcome?;
        Ok(claim.into_reference(handle, use_count))
    }

    /// Give up one lease. Returns the remaining use count and, when the
    /// binding just closed, the handle to destroy.
    fn drop_lease(
        &self,
        binding: &Arc<Binding>,
        selector: LeaseSelector,
    ) -> Result<(usize, Option<ServiceHandle>)> {
        let (remaining, handle, acquired) = {
            let mut state = binding.state.lock();
            let Some(position) = state.find(selector) else {
                return Err(match selector {
                    LeaseSelector::Exact(_) => DiscoveryError::Use(format!(
                        "{} has already been released",
                        binding.id
                    )),
                    LeaseSelector::Detached => DiscoveryError::Use(format!(
                        "{} has no use left to release by service object; release its reference instead",
                        binding.id
                    )),
                });
            };
            let acquired = state.leases.remove(position).acquired;

            let remaining = state.leases.len();
            let handle = if remaining == 0 {
                match std::mem::replace(&mut state.phase, Phase::Closed) {
                    Phase::Live(handle) => Some(handle),
                    other => {
                        state.phase = other;
                        None
                    }
                }
            } else {
                None
            };
            (remaining, handle, acquired)
        };

        if handle.is_some() {
            self.forget(binding, handle.as_ref());
        }

        if acquired {
            debug!(
                reference = %binding.id,
                record = %binding.record_id,
                use_count = remaining,
                "Released service reference"
            );
            self.inner.events.emit(DiscoveryEvent::ReferenceReleased {
                reference_id: binding.id.clone(),
                record_id: binding.record_id.clone(),
                use_count: remaining,
            });
        }

        Ok((remaining, handle))
    }

    fn forget(&self, binding: &Arc<Binding>, handle: Option<&ServiceHandle>) {
        if let Some(key) = &binding.key {
            self.inner
                .shared
                .remove_if(key, |_, current| Arc::ptr_eq(current, binding));
        }
        if let Some(handle) = handle {
            self.inner
                .by_handle
                .remove_if(&handle.key(), |_, current| Arc::ptr_eq(current, binding));
        }
        self.inner.bindings.remove(&binding.id);
    }

    async fn destroy(&self, binding: &Binding, handle: ServiceHandle) {
        match binding.factory.destroy(handle).await {
            Ok(()) => debug!(reference = %binding.id, "Destroyed service handle"),
            Err(err) => warn!(
                reference = %binding.id,
                record = %binding.record_id,
                error = %err,
                "Failed to destroy service handle"
            ),
        }
        self.inner.events.emit(DiscoveryEvent::HandleDestroyed {
            reference_id: binding.id.clone(),
            record_id: binding.record_id.clone(),
        });
    }

    /// Release one use of a reference.
    ///
    /// Returns the remaining use count. The handle is destroyed when it drops
    /// to zero.
    pub async fn release(&self, reference: &ServiceReference) -> Result<usize> {
        let (remaining, handle) =
            self.drop_lease(&reference.binding, LeaseSelector::Exact(reference.lease))?;
        if let Some(handle) = handle {
            self.destroy(&reference.binding, handle).await;
        }
        Ok(remaining)
    }

    /// Release one use of the binding that owns a service object.
    ///
    /// Only uses whose [`ServiceReference`] has been dropped are eligible, so
    /// consumers still holding a reference are never affected.
    pub async fn release_handle(&self, key: HandleKey) -> Result<usize> {
        let binding = self
            .inner
            .by_handle
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DiscoveryError::Use("Service object is not bound".to_string()))?;

        let (remaining, handle) = self.drop_lease(&binding, LeaseSelector::Detached)?;
        if let Some(handle) = handle {
            self.destroy(&binding, handle).await;
        }
        Ok(remaining)
    }

    /// Tear down every binding of a record regardless of outstanding uses.
    ///
    /// Returns the number of bindings closed.
    pub async fn release_all(&self, record_id: &RecordId) -> usize {
        let targets: Vec<_> = self
            .inner
            .bindings
            .iter()
            .filter(|entry| &entry.value().record_id == record_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.close_bindings(targets).await
    }

    /// Tear down every binding.
    pub async fn drain(&self) -> usize {
        let targets: Vec<_> = self
            .inner
            .bindings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.close_bindings(targets).await
    }

    async fn close_bindings(&self, targets: Vec<Arc<Binding>>) -> usize {
        let mut closed = 0;
        for binding in targets {
            let (handle, was_open) = {
                let mut state = binding.state.lock();
                let was_open = state.is_open();
                state.leases.clear();
                match std::mem::replace(&mut state.phase, Phase::Closed) {
                    Phase::Live(handle) => (Some(handle), was_open),
                    // The create task destroys the handle when it completes
                    Phase::Pending => (None, was_open),
                    other => {
                        state.phase = other;
                        (None, was_open)
                    }
                }
            };
            if !was_open {
                continue;
            }

            closed += 1;
            self.forget(&binding, handle.as_ref());
            debug!(
                reference = %binding.id,
                record = %binding.record_id,
                "Force-released service binding"
            );
            self.inner.events.emit(DiscoveryEvent::ReferenceReleased {
                reference_id: binding.id.clone(),
                record_id: binding.record_id.clone(),
                use_count: 0,
            });
            if let Some(handle) = handle {
                self.destroy(&binding, handle).await;
            }
        }
        closed
    }

    /// Bindings currently tracked, pending ones included.
    pub fn snapshot(&self) -> Vec<BindingSnapshot> {
        self.inner
            .bindings
            .iter()
            .map(|entry| {
                let binding = entry.value();
                let state = binding.state.lock();
                BindingSnapshot {
                    reference_id: binding.id.clone(),
                    record_id: binding.record_id.clone(),
                    record_name: binding.record.name().to_string(),
                    use_count: state.leases.len(),
                    shared: binding.key.is_some(),
                    live: matches!(state.phase, Phase::Live(_)),
                }
            })
            .collect()
    }

    /// Number of tracked bindings.
    pub fn len(&self) -> usize {
        self.inner.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bindings.is_empty()
    }
}

/// A lease taken by an in-flight bind. Dropping it before it becomes a
/// [`ServiceReference`] gives the lease back.
struct Claim {
    tracker: ReferenceTracker,
    binding: Arc<Binding>,
    lease: u64,
    armed: bool,
}

impl Claim {
    fn new(tracker: ReferenceTracker, binding: Arc<Binding>, lease: u64) -> Self {
        Self {
            tracker,
            binding,
            lease,
            armed: true,
        }
    }

    fn into_reference(mut self, handle: ServiceHandle, use_count: usize) -> ServiceReference {
        self.armed = false;
        if let Some(lease) = self.binding.state.lock().lease_mut(self.lease) {
            lease.acquired = true;
        }

        debug!(
            reference = %self.binding.id,
            record = %self.binding.record_id,
            use_count,
            "Acquired service reference"
        );
        self.tracker
            .inner
            .events
            .emit(DiscoveryEvent::ReferenceAcquired {
                reference_id: self.binding.id.clone(),
                record_id: self.binding.record_id.clone(),
                use_count,
            });

        ServiceReference {
            tracker: self.tracker.clone(),
            binding: Arc::clone(&self.binding),
            lease: self.lease,
            handle,
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // Already gone when the bind failed or the record was force-released
        let Ok((_, Some(handle))) = self
            .tracker
            .drop_lease(&self.binding, LeaseSelector::Exact(self.lease))
        else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tracker = self.tracker.clone();
                let binding = Arc::clone(&self.binding);
                runtime.spawn(async move { tracker.destroy(&binding, handle).await });
            }
            Err(_) => warn!(
                reference = %self.binding.id,
                "No runtime available, dropping abandoned handle without destroy"
            ),
        }
    }
}

/// A consumer's use of a bound service
///
/// Dropping the value does not release it: call [`ServiceReference::release`]
/// or let the registry force-release the record. Once dropped, the use can
/// still be released through its service object.
pub struct ServiceReference {
    tracker: ReferenceTracker,
    binding: Arc<Binding>,
    lease: u64,
    handle: ServiceHandle,
}

impl ServiceReference {
    pub fn id(&self) -> &ReferenceId {
        &self.binding.id
    }

    /// Record snapshot taken at bind time.
    pub fn record(&self) -> &Record {
        &self.binding.record
    }

    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Outstanding uses of the underlying handle.
    pub fn use_count(&self) -> usize {
        self.binding.state.lock().leases.len()
    }

    /// Whether the handle may be shared with other consumers.
    pub fn is_shared(&self) -> bool {
        self.binding.key.is_some()
    }

    pub fn is_released(&self) -> bool {
        !self.binding.state.lock().has_lease(self.lease)
    }

    /// Narrow the service object to the expected type.
    pub fn get_as<T: std::any::Any + Send + Sync>(&self) -> Result<Arc<T>> {
        if self.is_released() {
            return Err(DiscoveryError::Use(format!(
                "{} has already been released",
                self.binding.id
            )));
        }
        self.handle.get_as::<T>()
    }

    /// Release this use of the service.
    pub async fn release(&self) -> Result<()> {
        self.tracker.release(self).await.map(|_| ())
    }
}

impl Drop for ServiceReference {
    fn drop(&mut self) {
        if let Some(lease) = self.binding.state.lock().lease_mut(self.lease) {
            lease.detached = true;
        }
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.binding.id)
            .field("record", &self.binding.record.name())
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{published, CountingFactory, TestClient};
    use std::sync::atomic::Ordering;

    fn tracker() -> ReferenceTracker {
        ReferenceTracker::new(EventPublisher::default(), None)
    }

    #[tokio::test]
    async fn test_shared_acquire_reuses_handle() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let first = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let second = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.use_count(), 2);
        assert_eq!(first.handle().key(), second.handle().key());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        first.release().await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(second.use_count(), 1);

        second.release().await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_different_config_gets_different_handle() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let mut config = BindConfig::new();
        config.insert("user".into(), "alice".into());

        let plain = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let configured = tracker
            .acquire(&record, factory.clone(), config, BindMode::Shared)
            .await
            .unwrap();

        assert_ne!(plain.id(), configured.id());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exclusive_never_shares() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let shared = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let exclusive = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Exclusive)
            .await
            .unwrap();

        assert_ne!(shared.id(), exclusive.id());
        assert!(!exclusive.is_shared());
        assert_eq!(exclusive.use_count(), 1);
        assert_eq!(shared.use_count(), 1);
    }

    #[tokio::test]
    async fn test_double_release_is_use_error() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let first = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let second = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();

        first.release().await.unwrap();
        assert!(matches!(first.release().await, Err(DiscoveryError::Use(_))));

        // The other use is untouched
        assert_eq!(second.use_count(), 1);
        assert!(second.get_as::<TestClient>().is_ok());
        assert!(matches!(first.get_as::<TestClient>(), Err(DiscoveryError::Use(_))));
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_handle_by_identity() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let reference = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let client = reference.get_as::<TestClient>().unwrap();

        // Still held through its reference
        let held = tracker.release_handle(HandleKey::of(&client)).await;
        assert!(matches!(held, Err(DiscoveryError::Use(_))));
        assert!(!reference.is_released());

        drop(reference);
        assert_eq!(tracker.release_handle(HandleKey::of(&client)).await.unwrap(), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        let again = tracker.release_handle(HandleKey::of(&client)).await;
        assert!(matches!(again, Err(DiscoveryError::Use(_))));

        let stranger = Arc::new(TestClient { serial: 99 });
        let unknown = tracker.release_handle(HandleKey::of(&stranger)).await;
        assert!(matches!(unknown, Err(DiscoveryError::Use(_))));
    }

    #[tokio::test]
    async fn test_release_handle_spares_held_references() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let a = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let b = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let a_client = a.get_as::<TestClient>().unwrap();
        drop(a);

        assert_eq!(tracker.release_handle(HandleKey::of(&a_client)).await.unwrap(), 1);
        assert!(!b.is_released());
        assert!(b.get_as::<TestClient>().is_ok());

        // Only b's use is left, and it is still held
        let twice = tracker.release_handle(HandleKey::of(&a_client)).await;
        assert!(matches!(twice, Err(DiscoveryError::Use(_))));
        assert_eq!(b.use_count(), 1);

        b.release().await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::failing());
        let record = published("svc-a");

        let result = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await;

        assert!(matches!(result, Err(DiscoveryError::Bind { .. })));
        assert!(tracker.is_empty());
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_unpublished_record_is_rejected() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = Record::new("draft", discovery_types::ServiceType::HttpEndpoint);

        let result = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await;
        assert!(matches!(
            result,
            Err(DiscoveryError::Validation(RecordValidationError::NotRegistered(_)))
        ));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_errors_are_swallowed() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::failing_destroy());
        let record = published("svc-a");

        let reference = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        assert!(reference.release().await.is_ok());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_release_all_tears_down_live_bindings() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");
        let other = published("svc-b");

        let a1 = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        let _a2 = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Exclusive)
            .await
            .unwrap();
        let b = tracker
            .acquire(&other, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();

        assert_eq!(tracker.release_all(record.id().unwrap()).await, 2);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert!(matches!(a1.release().await, Err(DiscoveryError::Use(_))));
        assert_eq!(b.use_count(), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_bind_destroys_handle_after_create() {
        let events = EventPublisher::default();
        let mut rx = events.subscribe();
        let tracker = ReferenceTracker::new(events, Some(Duration::from_millis(20)));
        let factory = Arc::new(CountingFactory::gated());
        let record = published("svc-a");

        let result = tracker
            .acquire(&record, factory.clone(), BindConfig::new(), BindMode::Shared)
            .await;
        assert!(matches!(result, Err(DiscoveryError::Bind { .. })));

        factory.open_gate();
        factory.wait_destroyed(1).await;
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());

        // Never acquired, so never reported as released
        let released = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|envelope| matches!(envelope.event, DiscoveryEvent::ReferenceReleased { .. }))
            .count();
        assert_eq!(released, 0);
    }

    #[tokio::test]
    async fn test_release_all_revokes_pending_bind() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::gated());
        let record = published("svc-a");

        let pending = {
            let tracker = tracker.clone();
            let factory = factory.clone();
            let record = record.clone();
            tokio::spawn(async move {
                tracker
                    .acquire(&record, factory, BindConfig::new(), BindMode::Shared)
                    .await
            })
        };

        while tracker.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.release_all(record.id().unwrap()).await, 1);

        factory.open_gate();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DiscoveryError::Bind { .. })));
        factory.wait_destroyed(1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_create_once() {
        let tracker = tracker();
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(20)));
        let record = published("svc-a");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            let factory = factory.clone();
            let record = record.clone();
            tasks.push(tokio::spawn(async move {
                tracker
                    .acquire(&record, factory, BindConfig::new(), BindMode::Shared)
                    .await
                    .unwrap()
            }));
        }

        let mut references = Vec::new();
        for task in tasks {
            references.push(task.await.unwrap());
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(references[0].use_count(), 16);

        for reference in &references {
            reference.release().await.unwrap();
        }
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let events = EventPublisher::default();
        let mut rx = events.subscribe();
        let tracker = ReferenceTracker::new(events, None);
        let factory = Arc::new(CountingFactory::new());
        let record = published("svc-a");

        let reference = tracker
            .acquire(&record, factory, BindConfig::new(), BindMode::Shared)
            .await
            .unwrap();
        reference.release().await.unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|envelope| envelope.event)
            .collect();
        assert!(matches!(kinds[0], DiscoveryEvent::ReferenceAcquired { use_count: 1, .. }));
        assert!(matches!(kinds[1], DiscoveryEvent::ReferenceReleased { use_count: 0, .. }));
        assert!(matches!(kinds[2], DiscoveryEvent::HandleDestroyed { .. }));
    }
}
