//! HTTP endpoints
//!
//! A provider publishes the host, port and root path of a REST API; a
//! consumer binds the record to an [`HttpClient`] that already knows where the
//! server is.

use async_trait::async_trait;
use discovery_registry::{
    get_service, BindConfig, BindError, BoundService, RecordFilter, Result, ServiceDiscovery,
    ServiceFactory, ServiceHandle,
};
use discovery_types::{JsonObject, Record, ServiceType};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Record builders and typed lookup for HTTP endpoints
pub struct HttpEndpoint;

impl HttpEndpoint {
    /// Record for a plain HTTP endpoint.
    pub fn create_record(name: &str, host: &str, port: u16, root: &str) -> Record {
        Self::create_record_with(name, false, host, port, root, JsonObject::new())
    }

    /// Record for an endpoint, optionally over TLS, with metadata.
    pub fn create_record_with(
        name: &str,
        ssl: bool,
        host: &str,
        port: u16,
        root: &str,
        metadata: JsonObject,
    ) -> Record {
        let root = normalize_root(root);
        let scheme = if ssl { "https" } else { "http" };
        let endpoint = format!("{}://{}:{}{}", scheme, host, port, root);

        Record::new(name, ServiceType::HttpEndpoint)
            .with_location_entry("host", host)
            .with_location_entry("port", port)
            .with_location_entry("root", root)
            .with_location_entry("ssl", ssl)
            .with_location_entry("endpoint", endpoint)
            .with_metadata(metadata)
    }

    /// Look up an endpoint and bind it to a shared client.
    pub async fn get_client(
        discovery: &ServiceDiscovery,
        filter: &RecordFilter,
    ) -> Result<BoundService<HttpClient>> {
        get_service::<HttpClient>(discovery, filter, None).await
    }

    /// Look up an endpoint and bind it to a client built with `config`.
    pub async fn get_client_with_configuration(
        discovery: &ServiceDiscovery,
        filter: &RecordFilter,
        config: BindConfig,
    ) -> Result<BoundService<HttpClient>> {
        get_service::<HttpClient>(discovery, filter, Some(config)).await
    }
}

fn normalize_root(root: &str) -> String {
    if root.is_empty() {
        "/".to_string()
    } else if root.starts_with('/') {
        root.to_string()
    } else {
        format!("/{}", root)
    }
}

/// HTTP client bound to one endpoint
///
/// Paths passed to the request helpers are server paths, so they include the
/// endpoint root (`/api/persons` for an endpoint rooted at `/api`).
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    origin: String,
    root: String,
}

impl HttpClient {
    /// `scheme://host:port` of the endpoint.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Full URL of a server path.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.origin, path)
        } else {
            format!("{}/{}", self.origin, path)
        }
    }

    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, path)
    }

    pub fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::DELETE, path)
    }

    /// The underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpClientOptions {
    timeout_ms: Option<u64>,
    user_agent: Option<String>,
}

/// Builds [`HttpClient`]s for `http-endpoint` records
#[derive(Debug, Default)]
pub struct HttpClientFactory;

#[async_trait]
impl ServiceFactory for HttpClientFactory {
    fn service_type(&self) -> ServiceType {
        ServiceType::HttpEndpoint
    }

    async fn create(
        &self,
        record: &Record,
        config: &BindConfig,
    ) -> std::result::Result<ServiceHandle, BindError> {
        let location = record.location();
        let host = location
            .get("host")
            .and_then(Value::as_str)
            .ok_or_else(|| BindError::MissingLocation("host".into()))?;
        let port = location
            .get("port")
            .and_then(Value::as_u64)
            .ok_or_else(|| BindError::MissingLocation("port".into()))?;
        let ssl = location.get("ssl").and_then(Value::as_bool).unwrap_or(false);
        let root = normalize_root(location.get("root").and_then(Value::as_str).unwrap_or("/"));

        let options: HttpClientOptions = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| BindError::InvalidConfig(e.to_string()))?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = options.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        if let Some(user_agent) = options.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder.build().map_err(BindError::transport)?;

        let scheme = if ssl { "https" } else { "http" };
        let origin = format!("{}://{}:{}", scheme, host, port);
        debug!(record = %record.name(), origin = %origin, "Created HTTP client");

        Ok(ServiceHandle::new(
            ServiceType::HttpEndpoint,
            HttpClient {
                client,
                origin,
                root,
            },
        ))
    }
}
