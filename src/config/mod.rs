//! Bus configuration.
//!
//! This module contains:
//! - `BusConfig`: root configuration, loadable from YAML and environment
//! - `TransportConfig`: broker connection, queue topology and retry settings
//! - `QueueDefaults` / `QueueOverrides` / `QueueSettings`: layered queue
//!   declaration settings resolved once per consume call
//! - `Limits`: packet size cap and idle timeout for byte streams

mod limits;
mod transport;

pub use limits::{Limits, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_STREAM_IDLE_TIMEOUT_SECS};
pub use transport::{QueueDefaults, QueueOverrides, QueueSettings, TransportConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CONVEYOR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CONVEYOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CONVEYOR_LOG";

/// Default aggregator batch size when neither batch size nor timeout is set.
pub const DEFAULT_AGGREGATOR_BATCH_SIZE: usize = 10;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Destination queues for a message type on `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueMapping {
    /// Fully-qualified message type name.
    pub message_type: String,
    /// Queues receiving the message. More than one fans out.
    pub queues: Vec<String>,
}

/// Process manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessManagerSettings {
    /// Run the timeout poller while consuming.
    pub timeouts_enabled: bool,
}

impl Default for ProcessManagerSettings {
    fn default() -> Self {
        Self {
            timeouts_enabled: true,
        }
    }
}

/// Aggregator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub default_batch_size: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_AGGREGATOR_BATCH_SIZE,
        }
    }
}

/// Root bus configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub transport: TransportConfig,
    pub queue_mappings: Vec<QueueMapping>,
    pub limits: Limits,
    pub process_managers: ProcessManagerSettings,
    pub aggregators: AggregatorSettings,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: BusConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.consumer_count == 0 {
            return Err(ConfigError::Invalid(
                "transport.consumer_count must be at least 1".into(),
            ));
        }
        if self.limits.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_message_size must be non-zero".into(),
            ));
        }
        if self.transport.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "transport.queue_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Configured destination queues for a message type.
    pub fn queues_for(&self, message_type: &str) -> Vec<String> {
        self.queue_mappings
            .iter()
            .filter(|m| m.message_type == message_type)
            .flat_map(|m| m.queues.iter().cloned())
            .collect()
    }

    /// Add a type→queue mapping.
    pub fn map_queue(&mut self, message_type: impl Into<String>, queue: impl Into<String>) {
        let message_type = message_type.into();
        let queue = queue.into();
        match self
            .queue_mappings
            .iter_mut()
            .find(|m| m.message_type == message_type)
        {
            Some(mapping) => {
                if !mapping.queues.contains(&queue) {
                    mapping.queues.push(queue);
                }
            }
            None => self.queue_mappings.push(QueueMapping {
                message_type,
                queues: vec![queue],
            }),
        }
    }

    /// Create config for testing: one worker, no redelivery delay to speak of.
    pub fn for_test(queue_name: &str) -> Self {
        let mut config = Self::default();
        config.transport.queue_name = queue_name.to_string();
        config.transport.retry_delay_ms = 50;
        config.transport.connection_retry = crate::utils::retry::RetryPolicy::new(
            2,
            std::time::Duration::from_millis(10),
        );
        config.transport.publish_retry = config.transport.connection_retry;
        config
    }
}
