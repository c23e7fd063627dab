//! Message body provider - optional out-of-band persistence of payloads
//!
//! Bodies are keyed by message id. Saves enroll in the caller's
//! transaction so a rollback leaves storage untouched.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use relay_common::{QueuedMessage, TraceInfo};

use crate::transaction::TransactionController;
use crate::Result;

/// Pluggable persistence for message payloads and typed replies.
#[async_trait]
pub trait MessageBodyProvider: Send + Sync {
    /// Gate for body persistence; consulted together with provider presence.
    fn allow_message_persistence(&self, disabled: bool, msg: &QueuedMessage) -> bool {
        !disabled && !msg.disabled_message_persistence
    }

    /// Persist one body for every message in `messages` (fan-out targets
    /// share a message id per queue envelope).
    async fn save_to_storage(
        &self,
        messages: &[QueuedMessage],
        body: &serde_json::Value,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()>;

    /// Load the body persisted for `msg`, `None` when absent.
    async fn load_from_storage(
        &self,
        msg: &QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<Option<serde_json::Value>>;

    /// Persist the typed reply produced for a request message.
    async fn save_reply_to_storage(
        &self,
        message_id: Uuid,
        reply: &serde_json::Value,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()>;
}

/// Embedded provider for development and tests.
#[derive(Default)]
pub struct InMemoryBodyProvider {
    bodies: Arc<DashMap<Uuid, serde_json::Value>>,
    replies: Arc<DashMap<Uuid, serde_json::Value>>,
}

impl InMemoryBodyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_body(&self, message_id: Uuid) -> Option<serde_json::Value> {
        self.bodies.get(&message_id).map(|v| v.clone())
    }

    pub fn stored_reply(&self, message_id: Uuid) -> Option<serde_json::Value> {
        self.replies.get(&message_id).map(|v| v.clone())
    }
}

#[async_trait]
impl MessageBodyProvider for InMemoryBodyProvider {
    async fn save_to_storage(
        &self,
        messages: &[QueuedMessage],
        body: &serde_json::Value,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        let ids: Vec<_> = messages.iter().map(|m| m.message_id).collect();
        for id in &ids {
            self.bodies.insert(*id, body.clone());
        }

        debug!(
            trace_id = %trace.trace_id,
            count = ids.len(),
            "Saved message bodies"
        );

        let bodies = self.bodies.clone();
        tx.on_rollback(Box::new(move || {
            Box::pin(async move {
                for id in ids {
                    bodies.remove(&id);
                }
            })
        }));

        Ok(())
    }

    async fn load_from_storage(
        &self,
        msg: &QueuedMessage,
        trace: &TraceInfo,
        _tx: &Arc<dyn TransactionController>,
    ) -> Result<Option<serde_json::Value>> {
        let body = self.bodies.get(&msg.message_id).map(|v| v.clone());
        debug!(
            trace_id = %trace.trace_id,
            message_id = %msg.message_id,
            found = body.is_some(),
            "Loaded message body"
        );
        Ok(body)
    }

    async fn save_reply_to_storage(
        &self,
        message_id: Uuid,
        reply: &serde_json::Value,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        self.replies.insert(message_id, reply.clone());

        debug!(
            trace_id = %trace.trace_id,
            message_id = %message_id,
            "Saved reply"
        );

        let replies = self.replies.clone();
        tx.on_rollback(Box::new(move || {
            Box::pin(async move {
                replies.remove(&message_id);
            })
        }));

        Ok(())
    }
}
