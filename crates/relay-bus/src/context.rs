//! Runtime and handler contexts
//!
//! Providers are threaded explicitly: `QueueRuntimeContext` carries the
//! transaction factory, body provider, event sink, registry, and
//! interceptor into each queue; `HandlerContext` is a fresh value per
//! handler invocation, never pooled.

use indexmap::IndexMap;
use std::sync::Arc;
use uuid::Uuid;

use relay_common::{QueueEventSink, Result, TraceInfo};
use relay_queue::{MessageBodyProvider, TransactionController, TransactionControllerFactory};

use crate::interceptor::HandlerInterceptor;
use crate::registry::HandlerRegistry;

/// Providers shared by every queue of a bus.
#[derive(Clone)]
pub struct QueueRuntimeContext {
    pub transactions: Arc<dyn TransactionControllerFactory>,
    pub body_provider: Option<Arc<dyn MessageBodyProvider>>,
    pub event_sink: Arc<dyn QueueEventSink>,
    pub registry: Arc<HandlerRegistry>,
    pub interceptor: Arc<HandlerInterceptor>,
}

/// Per-invocation handler context.
pub struct HandlerContext {
    pub message_id: Uuid,
    pub parent_message_id: Option<Uuid>,
    pub id_session: Option<Uuid>,
    pub publisher_id: String,
    pub queue_name: String,
    pub retry_count: u32,
    pub headers: IndexMap<String, String>,
    pub trace: TraceInfo,
    pub transaction: Arc<dyn TransactionController>,
    reply: Option<serde_json::Value>,
}

impl HandlerContext {
    pub fn new(
        message: &relay_common::QueuedMessage,
        trace: TraceInfo,
        transaction: Arc<dyn TransactionController>,
    ) -> Self {
        Self {
            message_id: message.message_id,
            parent_message_id: message.parent_message_id,
            id_session: message.id_session,
            publisher_id: message.publisher_id.clone(),
            queue_name: message.queue_name.clone(),
            retry_count: message.retry_count,
            headers: message.headers.clone(),
            trace,
            transaction,
            reply: None,
        }
    }

    /// Record the typed reply for a request message.
    pub fn set_reply<T: serde::Serialize>(&mut self, reply: &T) -> Result<()> {
        self.reply = Some(serde_json::to_value(reply)?);
        Ok(())
    }

    pub(crate) fn take_reply(&mut self) -> Option<serde_json::Value> {
        self.reply.take()
    }
}
