//! Orchestration instances and their registry

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::definition::{OrchestrationDefinition, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationStatus {
    /// Waiting for the next event
    Running,
    /// A step worker is active
    Executing,
    Suspended,
    Completed,
    Terminated,
}

impl OrchestrationStatus {
    /// Whether an incoming event may wake this instance.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Running | OrchestrationStatus::Executing
        )
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed | OrchestrationStatus::Terminated
        )
    }
}

/// A stateful long-running workflow instance.
pub struct OrchestrationInstance {
    pub instance_id: Uuid,
    pub orchestration_key: String,
    pub definition: Arc<OrchestrationDefinition>,
    status: Mutex<OrchestrationStatus>,
    current_step: Mutex<Option<StepId>>,
    resume: Notify,
}

impl OrchestrationInstance {
    pub fn new(definition: Arc<OrchestrationDefinition>) -> Self {
        let current_step = definition.start_step();
        Self {
            instance_id: Uuid::new_v4(),
            orchestration_key: definition.orchestration_key.clone(),
            definition,
            status: Mutex::new(OrchestrationStatus::Running),
            current_step: Mutex::new(current_step),
            resume: Notify::new(),
        }
    }

    pub fn status(&self) -> OrchestrationStatus {
        *self.status.lock()
    }

    /// Status transitions; terminal states stick.
    pub fn set_status(&self, status: OrchestrationStatus) {
        let mut current = self.status.lock();
        if current.is_terminal() {
            return;
        }
        *current = status;
    }

    pub fn current_step(&self) -> Option<StepId> {
        *self.current_step.lock()
    }

    /// Move to the next step in the definition; completes the instance at
    /// the end of the chain.
    pub fn advance(&self) -> Option<StepId> {
        let mut current = self.current_step.lock();
        let next = current.and_then(|id| self.definition.next_of(id));
        *current = next;
        if next.is_none() {
            drop(current);
            self.set_status(OrchestrationStatus::Completed);
            info!(
                instance_id = %self.instance_id,
                orchestration_key = %self.orchestration_key,
                "Orchestration instance completed"
            );
        }
        next
    }

    /// Signal the instance worker to resume. Coalesces with a pending
    /// signal.
    pub fn signal_resume(&self) {
        debug!(
            instance_id = %self.instance_id,
            orchestration_key = %self.orchestration_key,
            "Resuming orchestration instance"
        );
        self.resume.notify_one();
    }

    /// Await the next resume signal.
    pub async fn wait_for_resume(&self) {
        self.resume.notified().await;
    }
}

/// Registry of live instances keyed by orchestration key.
#[derive(Default)]
pub struct OrchestrationInstanceRegistry {
    instances: DashMap<String, Vec<Arc<OrchestrationInstance>>>,
}

impl OrchestrationInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: Arc<OrchestrationInstance>) {
        self.instances
            .entry(instance.orchestration_key.clone())
            .or_default()
            .push(instance);
    }

    pub fn instances_for_key(&self, orchestration_key: &str) -> Vec<Arc<OrchestrationInstance>> {
        self.instances
            .get(orchestration_key)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Drop completed and terminated instances.
    pub fn prune(&self) {
        for mut entry in self.instances.iter_mut() {
            entry.value_mut().retain(|i| !i.status().is_terminal());
        }
    }
}
