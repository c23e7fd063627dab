//! Orchestration definitions - step arenas
//!
//! Steps reference each other by integer id inside their definition's
//! arena, so a definition and its steps never hold mutually-owning
//! references.

use serde::{Deserialize, Serialize};

/// Index of a step within its definition's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationStep {
    pub id: StepId,
    pub name: String,
    pub next: Option<StepId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationDefinition {
    pub orchestration_key: String,
    pub version: u32,
    steps: Vec<OrchestrationStep>,
}

impl OrchestrationDefinition {
    pub fn new(orchestration_key: &str, version: u32) -> Self {
        Self {
            orchestration_key: orchestration_key.to_string(),
            version,
            steps: Vec::new(),
        }
    }

    /// Append a step, chaining it after the current last step.
    pub fn add_step(&mut self, name: &str) -> StepId {
        let id = StepId(self.steps.len() as u32);
        if let Some(last) = self.steps.last_mut() {
            if last.next.is_none() {
                last.next = Some(id);
            }
        }
        self.steps.push(OrchestrationStep {
            id,
            name: name.to_string(),
            next: None,
        });
        id
    }

    /// Point `from` at `to` explicitly (branches, loops back to a step).
    pub fn chain(&mut self, from: StepId, to: StepId) {
        if let Some(step) = self.steps.get_mut(from.0 as usize) {
            step.next = Some(to);
        }
    }

    pub fn start_step(&self) -> Option<StepId> {
        self.steps.first().map(|s| s.id)
    }

    pub fn step(&self, id: StepId) -> Option<&OrchestrationStep> {
        self.steps.get(id.0 as usize)
    }

    pub fn next_of(&self, id: StepId) -> Option<StepId> {
        self.step(id).and_then(|s| s.next)
    }

    pub fn steps(&self) -> &[OrchestrationStep] {
        &self.steps
    }
}
