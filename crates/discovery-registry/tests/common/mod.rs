//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use discovery_registry::{
    BindConfig, BindError, DiscoveryConfig, ServiceDiscovery, ServiceFactory, ServiceHandle,
};
use discovery_types::{Record, ServiceType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client object handed out by [`PoolFactory`]
#[derive(Debug)]
pub struct PooledClient {
    pub host: String,
    pub port: u64,
    pub user: Option<String>,
}

/// Factory building [`PooledClient`]s from the record location
#[derive(Default)]
pub struct PoolFactory {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub delay: Option<Duration>,
}

impl PoolFactory {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceFactory for PoolFactory {
    fn service_type(&self) -> ServiceType {
        ServiceType::DataSource
    }

    async fn create(&self, record: &Record, config: &BindConfig) -> Result<ServiceHandle, BindError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let host = record
            .location()
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BindError::MissingLocation("host".into()))?;
        let port = record
            .location()
            .get("port")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| BindError::MissingLocation("port".into()))?;

        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ServiceHandle::new(
            ServiceType::DataSource,
            PooledClient {
                host: host.to_string(),
                port,
                user: config
                    .get("username")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
        ))
    }

    async fn destroy(&self, _handle: ServiceHandle) -> Result<(), BindError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn database(name: &str, port: u64) -> Record {
    Record::new(name, ServiceType::DataSource)
        .with_location_entry("host", "db.internal")
        .with_location_entry("port", port)
}

pub fn discovery_with(factory: Arc<PoolFactory>) -> ServiceDiscovery {
    let discovery = ServiceDiscovery::new(DiscoveryConfig::default());
    discovery.register_factory(factory);
    discovery
}
