//! Bus configuration
//!
//! TOML-loadable configuration describing a bus: its name and host, the
//! exchanges and queues it owns, default retry/error handling, and the
//! registered handler markers. Validation runs before any runtime object
//! is built; a validation failure is the only fatal error path in the
//! system.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use relay_common::{ErrorHandlingPolicy, QueueType};
use relay_router::{Exchange, ExchangeType, HeadersMatch};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Root bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub bus_name: String,
    pub host: HostConfig,
    /// Public text used when a handler error carries no client message
    pub default_client_error_message: String,
    pub default_error_handling: ErrorHandlingConfig,
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    /// Names of the handler registrations the application installs; the
    /// set must not be empty
    pub handler_registrations: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_name: "relay".to_string(),
            host: HostConfig::default(),
            default_client_error_message: "The request could not be processed.".to_string(),
            default_error_handling: ErrorHandlingConfig::default(),
            exchanges: Vec::new(),
            queues: Vec::new(),
            handler_registrations: Vec::new(),
        }
    }
}

/// Host identity stamped on published messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub host_name: String,
    pub environment: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Retry policy as configured (milliseconds on the wire)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingConfig {
    pub max_retries: u32,
    pub retry_interval_ms: Vec<u64>,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: vec![1000, 2000, 3000],
        }
    }
}

impl ErrorHandlingConfig {
    pub fn to_policy(&self) -> ErrorHandlingPolicy {
        ErrorHandlingPolicy {
            max_retries: self.max_retries,
            retry_intervals: self
                .retry_interval_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// Exchange definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub exchange_type: ExchangeType,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default = "default_headers_match")]
    pub headers_match: HeadersMatch,
}

fn default_headers_match() -> HeadersMatch {
    HeadersMatch::All
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingDefinition {
    pub queue: String,
    #[serde(default)]
    pub route: String,
}

impl ExchangeDefinition {
    /// Materialize the runtime exchange.
    pub fn to_exchange(&self) -> Exchange {
        let mut exchange = match self.exchange_type {
            ExchangeType::Direct => Exchange::direct(&self.name),
            ExchangeType::FanOut => Exchange::fan_out(&self.name),
            ExchangeType::Headers => {
                Exchange::headers(&self.name, self.headers.clone(), self.headers_match)
            }
        };
        for binding in &self.bindings {
            exchange = exchange.bind(&binding.queue, &binding.route);
        }
        exchange
    }
}

/// Queue definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(rename = "type", default = "default_queue_type")]
    pub queue_type: QueueType,
    #[serde(default)]
    pub is_pull: bool,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub default_processing_timeout_ms: Option<u64>,
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,
    #[serde(default)]
    pub is_fault_queue: bool,
    #[serde(default)]
    pub error_handling: Option<ErrorHandlingConfig>,
}

fn default_queue_type() -> QueueType {
    QueueType::SequentialDelayable
}

fn default_fetch_interval_ms() -> u64 {
    500
}

impl QueueDefinition {
    pub fn new(name: &str, queue_type: QueueType) -> Self {
        Self {
            name: name.to_string(),
            queue_type,
            is_pull: false,
            max_size: None,
            default_processing_timeout_ms: None,
            fetch_interval_ms: default_fetch_interval_ms(),
            is_fault_queue: false,
            error_handling: None,
        }
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn default_processing_timeout(&self) -> Option<Duration> {
        self.default_processing_timeout_ms.map(Duration::from_millis)
    }

    pub fn error_handling_policy(&self) -> Option<ErrorHandlingPolicy> {
        self.error_handling.as_ref().map(|c| c.to_policy())
    }
}

impl BusConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BusConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Rejects an empty bus name, duplicate exchange or queue names,
    /// bindings to undeclared queues, and an empty handler registration
    /// set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_name.trim().is_empty() {
            return Err(ConfigError::Validation("bus_name must not be empty".into()));
        }

        let mut queue_names = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "queue name must not be empty".into(),
                ));
            }
            if !queue_names.insert(queue.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate queue name: {}",
                    queue.name
                )));
            }
        }

        let mut exchange_names = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "exchange name must not be empty".into(),
                ));
            }
            if !exchange_names.insert(exchange.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate exchange name: {}",
                    exchange.name
                )));
            }
            for binding in &exchange.bindings {
                if !queue_names.contains(binding.queue.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "exchange {} binds undeclared queue {}",
                        exchange.name, binding.queue
                    )));
                }
            }
        }

        if self.handler_registrations.is_empty() {
            return Err(ConfigError::Validation(
                "at least one handler registration is required".into(),
            ));
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Relay bus configuration

bus_name = "relay"
default_client_error_message = "The request could not be processed."
handler_registrations = ["orders", "invoices"]

[host]
host_name = "localhost"
environment = "development"

[default_error_handling]
max_retries = 3
retry_interval_ms = [1000, 2000, 3000]

[[queues]]
name = "orders"
type = "SequentialFifo"
fetch_interval_ms = 500

[[queues]]
name = "invoices"
type = "SequentialDelayable"
default_processing_timeout_ms = 30000

[[queues]]
name = "faults"
type = "SequentialDelayable"
is_fault_queue = true

[[exchanges]]
name = "commands"
type = "Direct"

[[exchanges.bindings]]
queue = "orders"
route = "orders"

[[exchanges.bindings]]
queue = "invoices"
route = "invoices"
"#
        .to_string()
    }
}
