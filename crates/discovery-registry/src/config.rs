//! Configuration for service discovery

use crate::events::DEFAULT_EVENT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main discovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Tie-breaking when several records match a single-record lookup
    #[serde(default)]
    pub selection: SelectionPolicy,

    /// Binding configuration
    #[serde(default)]
    pub binding: BindingConfig,

    /// Event stream configuration
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which record `get_record` returns when several match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// The most recently published match
    #[default]
    MostRecent,

    /// The earliest published match
    FirstPublished,

    /// Rotate through the matches on successive lookups
    RoundRobin,
}

/// Binding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// How long a bind waits for the factory to create a handle
    #[serde(default)]
    pub create_timeout_ms: Option<u64>,

    /// Force-release all references to a record when it is unpublished
    #[serde(default)]
    pub release_on_unpublish: bool,
}

impl BindingConfig {
    pub fn create_timeout(&self) -> Option<Duration> {
        self.create_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            create_timeout_ms: None,
            release_on_unpublish: false,
        }
    }
}

/// Event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DiscoveryConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// Environment variables use the `DISCOVERY` prefix with `__` between
    /// sections, e.g. `DISCOVERY__BINDING__CREATE_TIMEOUT_MS=500`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DiscoveryConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("DISCOVERY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
