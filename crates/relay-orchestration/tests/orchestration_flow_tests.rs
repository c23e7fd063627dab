//! Orchestration events through the bus
//!
//! Wires the sink as a push-synchronous handler on a dedicated queue and
//! drives it end-to-end: publish -> route -> handle inside the caller's
//! transaction -> persist -> wake instances.

use std::sync::Arc;
use std::time::Duration;

use relay_bus::{HandlerRegistry, MessageBus};
use relay_common::{MessageOptions, QueueType, TraceInfo};
use relay_config::{BindingDefinition, BusConfig, ExchangeDefinition, QueueDefinition};
use relay_orchestration::{
    InMemoryOrchestrationEventStore, OrchestrationDefinition, OrchestrationEvent,
    OrchestrationEventSink, OrchestrationEventStore, OrchestrationInstance,
    OrchestrationInstanceRegistry,
};
use relay_router::{ExchangeType, HeadersMatch};

fn orchestration_config() -> BusConfig {
    let mut events = QueueDefinition::new("orchestration-events", QueueType::SequentialFifo);
    events.fetch_interval_ms = 20;

    BusConfig {
        bus_name: "orchestration-test".to_string(),
        queues: vec![events],
        exchanges: vec![ExchangeDefinition {
            name: "orchestration".to_string(),
            exchange_type: ExchangeType::Direct,
            bindings: vec![BindingDefinition {
                queue: "orchestration-events".to_string(),
                route: "events".to_string(),
            }],
            headers: Default::default(),
            headers_match: HeadersMatch::All,
        }],
        handler_registrations: vec!["orchestration".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn event_sent_through_the_bus_is_stored_and_wakes_instances() {
    let store = Arc::new(InMemoryOrchestrationEventStore::new());
    let instances = Arc::new(OrchestrationInstanceRegistry::new());

    let mut definition = OrchestrationDefinition::new("invoice-flow", 1);
    definition.add_step("reserve");
    definition.add_step("charge");
    let instance = Arc::new(OrchestrationInstance::new(Arc::new(definition)));
    instances.register(instance.clone());

    let registry = Arc::new(HandlerRegistry::new());
    registry.register::<OrchestrationEvent, _>(OrchestrationEventSink::new(
        store.clone(),
        instances.clone(),
    ));

    let bus = MessageBus::new(orchestration_config(), registry).unwrap();
    let trace = TraceInfo::new("tests");

    let event = OrchestrationEvent::new("invoice-flow", serde_json::json!({"amount": 120}));
    let event_id = event.event_id;

    let message_id = bus
        .send(
            &event,
            MessageOptions::to_exchange("orchestration")
                .with_routing_key("events")
                .synchronous(),
            &trace,
        )
        .await
        .unwrap();

    // Stored once, stamped with the queued message id
    let stored = store.events_for_key("invoice-flow").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].event_id, event_id);
    assert_eq!(stored[0].message_id, Some(message_id));

    // The running instance was signalled to resume
    tokio::time::timeout(Duration::from_millis(200), instance.wait_for_resume())
        .await
        .expect("instance was not resumed");

    // The queue drained synchronously
    assert_eq!(
        bus.queue("orchestration-events").unwrap().count().await.unwrap(),
        0
    );

    // Redelivery of the same event stores nothing new
    bus.send(
        &event,
        MessageOptions::to_exchange("orchestration")
            .with_routing_key("events")
            .synchronous(),
        &trace,
    )
    .await
    .unwrap();
    assert_eq!(store.event_count(), 1);

    bus.shutdown().await;
}
