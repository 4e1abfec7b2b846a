//! Data sources
//!
//! The record location carries the connection attributes of a database
//! (at least its `url`). Consumers usually bind with their own credentials,
//! which are merged over the location to build a [`DataSourceClient`].

use async_trait::async_trait;
use discovery_registry::{
    get_service, BindConfig, BindError, BoundService, RecordFilter, Result, ServiceDiscovery,
    ServiceFactory, ServiceHandle,
};
use discovery_types::{JsonObject, Record, ServiceType};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Record builders and typed lookup for data sources
pub struct DataSource;

impl DataSource {
    pub fn create_record(name: &str, location: JsonObject, metadata: JsonObject) -> Record {
        Record::new(name, ServiceType::DataSource)
            .with_location(location)
            .with_metadata(metadata)
    }

    /// Look up a data source and bind it.
    ///
    /// With `config` (typically credentials) the client is private to the
    /// caller; without it the client is shared.
    pub async fn get_client(
        discovery: &ServiceDiscovery,
        filter: &RecordFilter,
        config: Option<BindConfig>,
    ) -> Result<BoundService<DataSourceClient>> {
        get_service::<DataSourceClient>(discovery, filter, config).await
    }
}

#[derive(Debug, Deserialize)]
struct DataSourceSettings {
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_max_pool_size")]
    max_pool_size: u32,
}

fn default_max_pool_size() -> u32 {
    10
}

/// Connection settings for one data source
pub struct DataSourceClient {
    settings: DataSourceSettings,
    properties: JsonObject,
    closed: AtomicBool,
}

impl DataSourceClient {
    pub fn url(&self) -> &str {
        &self.settings.url
    }

    pub fn username(&self) -> Option<&str> {
        self.settings.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.settings.password.as_deref()
    }

    pub fn max_pool_size(&self) -> u32 {
        self.settings.max_pool_size
    }

    /// All connection properties: the record location merged with the bind configuration.
    pub fn properties(&self) -> &JsonObject {
        &self.properties
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for DataSourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceClient")
            .field("url", &self.settings.url)
            .field("username", &self.settings.username)
            .field("password", &self.settings.password.as_ref().map(|_| "***"))
            .field("max_pool_size", &self.settings.max_pool_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds [`DataSourceClient`]s for `data-source` records
#[derive(Debug, Default)]
pub struct DataSourceFactory;

#[async_trait]
impl ServiceFactory for DataSourceFactory {
    fn service_type(&self) -> ServiceType {
        ServiceType::DataSource
    }

    async fn create(
        &self,
        record: &Record,
        config: &BindConfig,
    ) -> std::result::Result<ServiceHandle, BindError> {
        let mut properties = record.location().clone();
        for (key, value) in config {
            properties.insert(key.clone(), value.clone());
        }
        if !properties.contains_key("url") {
            return Err(BindError::MissingLocation("url".into()));
        }

        let settings: DataSourceSettings =
            serde_json::from_value(Value::Object(properties.clone()))
                .map_err(|e| BindError::InvalidConfig(e.to_string()))?;
        debug!(record = %record.name(), url = %settings.url, "Created data source client");

        Ok(ServiceHandle::new(
            ServiceType::DataSource,
            DataSourceClient {
                settings,
                properties,
                closed: AtomicBool::new(false),
            },
        ))
    }

    async fn destroy(&self, handle: ServiceHandle) -> std::result::Result<(), BindError> {
        let client = handle
            .get_as::<DataSourceClient>()
            .map_err(|e| BindError::Other(e.to_string()))?;
        client.close();
        debug!(url = %client.url(), "Closed data source client");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        let mut location = JsonObject::new();
        location.insert("url".into(), json!("jdbc:postgresql://db.internal/orders"));
        let mut metadata = JsonObject::new();
        metadata.insert("some-metadata".into(), json!("some-value"));
        DataSource::create_record("some-data-source-service", location, metadata)
    }

    #[tokio::test]
    async fn test_config_is_merged_over_location() {
        let mut config = BindConfig::new();
        config.insert("username".into(), json!("clement"));
        config.insert("password".into(), json!("secret"));
        config.insert("max_pool_size".into(), json!(4));

        let handle = DataSourceFactory.create(&record(), &config).await.unwrap();
        let client = handle.get_as::<DataSourceClient>().unwrap();

        assert_eq!(client.url(), "jdbc:postgresql://db.internal/orders");
        assert_eq!(client.username(), Some("clement"));
        assert_eq!(client.password(), Some("secret"));
        assert_eq!(client.max_pool_size(), 4);
        assert!(!format!("{:?}", client).contains("secret"));
    }

    #[tokio::test]
    async fn test_defaults_without_config() {
        let handle = DataSourceFactory
            .create(&record(), &BindConfig::new())
            .await
            .unwrap();
        let client = handle.get_as::<DataSourceClient>().unwrap();
        assert_eq!(client.username(), None);
        assert_eq!(client.max_pool_size(), 10);
    }

    #[tokio::test]
    async fn test_missing_url() {
        let record = DataSource::create_record("db", JsonObject::new(), JsonObject::new());
        let err = DataSourceFactory
            .create(&record, &BindConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::MissingLocation(field) if field == "url"));
    }

    #[tokio::test]
    async fn test_destroy_closes_client() {
        let handle = DataSourceFactory
            .create(&record(), &BindConfig::new())
            .await
            .unwrap();
        let client = handle.get_as::<DataSourceClient>().unwrap();

        DataSourceFactory.destroy(handle).await.unwrap();
        assert!(client.is_closed());
    }
}
