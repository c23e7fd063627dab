//! Orchestration event persistence contract

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use relay_common::TraceInfo;
use relay_queue::{QueueError, TransactionController};

use crate::event::OrchestrationEvent;

/// Pluggable store for orchestration events.
#[async_trait]
pub trait OrchestrationEventStore: Send + Sync {
    /// Persist a new event within the current transaction.
    ///
    /// Idempotent per event id: returns `false` without storing anything
    /// when the event was seen before.
    async fn save_new_event(
        &self,
        event: &OrchestrationEvent,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<bool, QueueError>;

    /// Events stored for an orchestration key, in arrival order.
    async fn events_for_key(
        &self,
        orchestration_key: &str,
    ) -> Result<Vec<OrchestrationEvent>, QueueError>;
}

/// Embedded store for development and tests.
#[derive(Default)]
pub struct InMemoryOrchestrationEventStore {
    events: Arc<DashMap<Uuid, OrchestrationEvent>>,
    by_key: Arc<DashMap<String, Vec<Uuid>>>,
}

impl InMemoryOrchestrationEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl OrchestrationEventStore for InMemoryOrchestrationEventStore {
    async fn save_new_event(
        &self,
        event: &OrchestrationEvent,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<bool, QueueError> {
        if self.events.contains_key(&event.event_id) {
            debug!(
                trace_id = %trace.trace_id,
                event_id = %event.event_id,
                "Orchestration event already stored"
            );
            return Ok(false);
        }

        self.events.insert(event.event_id, event.clone());
        self.by_key
            .entry(event.orchestration_key.clone())
            .or_default()
            .push(event.event_id);

        debug!(
            trace_id = %trace.trace_id,
            event_id = %event.event_id,
            orchestration_key = %event.orchestration_key,
            "Stored orchestration event"
        );

        let events = self.events.clone();
        let by_key = self.by_key.clone();
        let event_id = event.event_id;
        let key = event.orchestration_key.clone();
        tx.on_rollback(Box::new(move || {
            Box::pin(async move {
                events.remove(&event_id);
                if let Some(mut ids) = by_key.get_mut(&key) {
                    ids.retain(|id| *id != event_id);
                }
            })
        }));

        Ok(true)
    }

    async fn events_for_key(
        &self,
        orchestration_key: &str,
    ) -> Result<Vec<OrchestrationEvent>, QueueError> {
        let ids = self
            .by_key
            .get(orchestration_key)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.events.get(id).map(|e| e.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_queue::{InMemoryTransactionFactory, TransactionControllerFactory};

    #[tokio::test]
    async fn save_is_idempotent_per_event_id() {
        let store = InMemoryOrchestrationEventStore::new();
        let event = OrchestrationEvent::new("flow", serde_json::json!({"step": 1}));
        let trace = TraceInfo::new("test");

        let tx = InMemoryTransactionFactory.begin();
        assert!(store.save_new_event(&event, &trace, &tx).await.unwrap());
        tx.complete().await.unwrap();

        let tx = InMemoryTransactionFactory.begin();
        assert!(!store.save_new_event(&event, &trace, &tx).await.unwrap());
        tx.complete().await.unwrap();

        assert_eq!(store.event_count(), 1);
        let events = store.events_for_key("flow").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn save_rolls_back() {
        let store = InMemoryOrchestrationEventStore::new();
        let event = OrchestrationEvent::new("flow", serde_json::Value::Null);
        let trace = TraceInfo::new("test");

        let tx = InMemoryTransactionFactory.begin();
        store.save_new_event(&event, &trace, &tx).await.unwrap();
        tx.schedule_rollback(None);
        tx.complete().await.unwrap();

        assert_eq!(store.event_count(), 0);
        assert!(store.events_for_key("flow").await.unwrap().is_empty());
    }
}
