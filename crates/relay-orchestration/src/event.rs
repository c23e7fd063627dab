use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_bus::{BusMessage, EventMessage, RequestMessage};

use crate::definition::StepId;

/// Event driving a long-running orchestration forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub event_id: Uuid,
    pub orchestration_key: String,
    pub instance_id: Option<Uuid>,
    pub step_id: Option<StepId>,
    pub payload: serde_json::Value,
    /// Stamped with the queued message id when the sink handles the event
    pub message_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl OrchestrationEvent {
    pub fn new(orchestration_key: &str, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            orchestration_key: orchestration_key.to_string(),
            instance_id: None,
            step_id: None,
            payload,
            message_id: None,
            created_utc: Utc::now(),
        }
    }

    pub fn for_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn at_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }
}

impl BusMessage for OrchestrationEvent {
    const MESSAGE_TYPE: &'static str = "relay.orchestration.event";
}

impl RequestMessage for OrchestrationEvent {}
impl EventMessage for OrchestrationEvent {}
