//! Exchange-to-queue routing
//!
//! An exchange is a named routing point consulting its bindings to select
//! target queues for a publication:
//! - Direct: bindings whose route name equals the routing key
//! - FanOut: all bindings
//! - Headers: all bindings when the exchange's header pattern matches the
//!   message headers (All = conjunction, Any = disjunction)
//!
//! Bindings are kept and processed in insertion order. A queue bound more
//! than once is returned once per binding; the bus deduplicates by queue id
//! before dispatch.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Exchange already registered: {0}")]
    DuplicateExchange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeType {
    Direct,
    FanOut,
    Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadersMatch {
    /// Every pattern entry must be present and equal in the message headers
    All,
    /// At least one pattern entry must be present and equal
    Any,
}

/// Pairing of a target queue with the route name it was bound under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub queue_name: String,
    pub route_name: String,
}

/// Named routing point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub exchange_name: String,
    pub exchange_type: ExchangeType,
    bindings: Vec<Binding>,
    pub headers: Option<IndexMap<String, String>>,
    pub headers_match: HeadersMatch,
}

impl Exchange {
    pub fn direct(name: &str) -> Self {
        Self {
            exchange_name: name.to_string(),
            exchange_type: ExchangeType::Direct,
            bindings: Vec::new(),
            headers: None,
            headers_match: HeadersMatch::All,
        }
    }

    pub fn fan_out(name: &str) -> Self {
        Self {
            exchange_name: name.to_string(),
            exchange_type: ExchangeType::FanOut,
            bindings: Vec::new(),
            headers: None,
            headers_match: HeadersMatch::All,
        }
    }

    pub fn headers(
        name: &str,
        pattern: IndexMap<String, String>,
        headers_match: HeadersMatch,
    ) -> Self {
        Self {
            exchange_name: name.to_string(),
            exchange_type: ExchangeType::Headers,
            bindings: Vec::new(),
            headers: Some(pattern),
            headers_match,
        }
    }

    /// Bind a target queue under a route name, preserving insertion order.
    pub fn bind(mut self, queue_name: &str, route_name: &str) -> Self {
        self.bindings.push(Binding {
            queue_name: queue_name.to_string(),
            route_name: route_name.to_string(),
        });
        self
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Select target queue names for a publication, one entry per matching
    /// binding, in insertion order.
    pub fn resolve(
        &self,
        message_headers: &IndexMap<String, String>,
        routing_key: Option<&str>,
    ) -> Vec<String> {
        match self.exchange_type {
            ExchangeType::Direct => {
                let key = routing_key.unwrap_or_default();
                self.bindings
                    .iter()
                    .filter(|b| b.route_name == key)
                    .map(|b| b.queue_name.clone())
                    .collect()
            }
            ExchangeType::FanOut => self
                .bindings
                .iter()
                .map(|b| b.queue_name.clone())
                .collect(),
            ExchangeType::Headers => {
                let pattern = match &self.headers {
                    Some(p) => p,
                    None => return Vec::new(),
                };
                if match_headers(message_headers, pattern, self.headers_match) {
                    self.bindings
                        .iter()
                        .map(|b| b.queue_name.clone())
                        .collect()
                } else {
                    Vec::new()
                }
            }
        }
    }
}

/// Strict exact-key, exact-value header matching.
///
/// Empty message headers or an empty pattern never match.
pub fn match_headers(
    message_headers: &IndexMap<String, String>,
    pattern: &IndexMap<String, String>,
    mode: HeadersMatch,
) -> bool {
    if message_headers.is_empty() || pattern.is_empty() {
        return false;
    }

    match mode {
        HeadersMatch::All => pattern
            .iter()
            .all(|(k, v)| message_headers.get(k) == Some(v)),
        HeadersMatch::Any => pattern
            .iter()
            .any(|(k, v)| message_headers.get(k) == Some(v)),
    }
}

/// Registry of exchanges, resolving publications to bound queue names.
#[derive(Default)]
pub struct ExchangeRouter {
    exchanges: RwLock<IndexMap<String, Exchange>>,
}

impl ExchangeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, exchange: Exchange) -> Result<()> {
        let mut exchanges = self.exchanges.write();
        if exchanges.contains_key(&exchange.exchange_name) {
            return Err(RouterError::DuplicateExchange(exchange.exchange_name));
        }
        debug!(
            exchange = %exchange.exchange_name,
            exchange_type = ?exchange.exchange_type,
            bindings = exchange.bindings.len(),
            "Registered exchange"
        );
        exchanges.insert(exchange.exchange_name.clone(), exchange);
        Ok(())
    }

    pub fn contains(&self, exchange_name: &str) -> bool {
        self.exchanges.read().contains_key(exchange_name)
    }

    pub fn exchange_names(&self) -> Vec<String> {
        self.exchanges.read().keys().cloned().collect()
    }

    /// Resolve a publication to target queue names (one per matching
    /// binding; not yet deduplicated).
    pub fn resolve(
        &self,
        exchange_name: &str,
        message_headers: &IndexMap<String, String>,
        routing_key: Option<&str>,
    ) -> Result<Vec<String>> {
        let exchanges = self.exchanges.read();
        let exchange = exchanges
            .get(exchange_name)
            .ok_or_else(|| RouterError::ExchangeNotFound(exchange_name.to_string()))?;

        let queues = exchange.resolve(message_headers, routing_key);
        debug!(
            exchange = %exchange_name,
            routing_key = ?routing_key,
            matched = queues.len(),
            "Resolved publication"
        );
        Ok(queues)
    }
}
