//! Test doubles shared by the unit tests

use crate::error::BindError;
use crate::factory::{BindConfig, ServiceFactory, ServiceHandle};
use async_trait::async_trait;
use discovery_types::{Record, RecordId, ServiceType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct TestClient {
    pub serial: usize,
}

/// Factory counting creates and destroys
#[derive(Default)]
pub struct CountingFactory {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    fail_create: bool,
    fail_destroy: bool,
    delay: Option<Duration>,
    gate: Option<Notify>,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn failing_destroy() -> Self {
        Self {
            fail_destroy: true,
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Creation blocks until [`CountingFactory::open_gate`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub async fn wait_destroyed(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.destroyed.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handle was not destroyed in time");
    }
}

#[async_trait]
impl ServiceFactory for CountingFactory {
    fn service_type(&self) -> ServiceType {
        ServiceType::HttpEndpoint
    }

    async fn create(
        &self,
        _record: &Record,
        _config: &BindConfig,
    ) -> Result<ServiceHandle, BindError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create {
            return Err(BindError::Other("connection refused".into()));
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ServiceHandle::new(
            ServiceType::HttpEndpoint,
            TestClient { serial },
        ))
    }

    async fn destroy(&self, _handle: ServiceHandle) -> Result<(), BindError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(BindError::Other("close failed".into()));
        }
        Ok(())
    }
}

/// A record stamped with a fresh registration id.
pub fn published(name: &str) -> Record {
    Record::new(name, ServiceType::HttpEndpoint)
        .with_location_entry("host", "localhost")
        .with_location_entry("port", 8080)
        .register(RecordId::generate())
        .unwrap()
}
