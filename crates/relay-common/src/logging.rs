//! Logging setup for bus hosts
//!
//! Relay logs exclusively through `tracing` with structured fields
//! (queue, message_id, trace_id); this module only installs the host
//! subscriber. The format is picked once at startup: line-delimited JSON
//! when `RELAY_LOG_FORMAT=json`, human-readable text otherwise. The
//! filter comes from `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;

use crate::{RelayError, Result};

/// Output format of the host subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text for development
    #[default]
    Text,
    /// Line-delimited JSON for log aggregation
    Json,
}

impl LogFormat {
    /// Resolve the format from `RELAY_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("RELAY_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber for a bus host and stamp the bus name
/// on the first record.
///
/// Fallible rather than panicking: embedders and tests may already have
/// a subscriber installed, and a second bus in the same process must not
/// tear it down.
pub fn init(bus_name: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| RelayError::Config(format!("logging already initialized: {e}")))?;

    tracing::info!(bus = %bus_name, format = ?format, "Logging initialized");
    Ok(())
}

/// Install the subscriber with the format taken from the environment.
pub fn init_from_env(bus_name: &str) -> Result<()> {
    init(bus_name, LogFormat::from_env())
}
