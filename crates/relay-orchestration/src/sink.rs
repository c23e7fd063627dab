//! Orchestration event sink - the queue-facing handler
//!
//! Push-synchronous handler for orchestration events: stamps the event
//! with its queued message id, persists it within the current transaction
//! (idempotent per event id), and signals every live instance of the
//! event's orchestration key to resume.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_bus::{HandlerContext, MessageHandler};
use relay_common::{HandlerFailure, HandlerResult, MessageHandlerResult};

use crate::event::OrchestrationEvent;
use crate::instance::OrchestrationInstanceRegistry;
use crate::store::OrchestrationEventStore;

pub struct OrchestrationEventSink {
    store: Arc<dyn OrchestrationEventStore>,
    instances: Arc<OrchestrationInstanceRegistry>,
}

impl OrchestrationEventSink {
    pub fn new(
        store: Arc<dyn OrchestrationEventStore>,
        instances: Arc<OrchestrationInstanceRegistry>,
    ) -> Self {
        Self { store, instances }
    }
}

#[async_trait]
impl MessageHandler<OrchestrationEvent> for OrchestrationEventSink {
    async fn handle(
        &self,
        mut event: OrchestrationEvent,
        ctx: &mut HandlerContext,
        _cancel: CancellationToken,
    ) -> HandlerResult {
        event.message_id = Some(ctx.message_id);

        let stored = self
            .store
            .save_new_event(&event, &ctx.trace, &ctx.transaction)
            .await
            .map_err(|e| HandlerFailure::new(e.to_string()))?;

        let mut resumed = 0;
        for instance in self.instances.instances_for_key(&event.orchestration_key) {
            if instance.status().is_resumable() {
                instance.signal_resume();
                resumed += 1;
            }
        }

        debug!(
            event_id = %event.event_id,
            orchestration_key = %event.orchestration_key,
            stored = stored,
            resumed = resumed,
            "Orchestration event handled"
        );

        Ok(MessageHandlerResult::completed())
    }
}
