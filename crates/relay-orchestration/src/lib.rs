//! Orchestration engine interface as the bus consumes it
//!
//! Long-running workflows are composed of steps held in an arena keyed by
//! integer step ids. The bus side of the engine is small: persist
//! orchestration events idempotently and wake the live instances of the
//! event's orchestration key.

pub mod definition;
pub mod event;
pub mod instance;
pub mod sink;
pub mod store;

pub use definition::{OrchestrationDefinition, OrchestrationStep, StepId};
pub use event::OrchestrationEvent;
pub use instance::{OrchestrationInstance, OrchestrationInstanceRegistry, OrchestrationStatus};
pub use sink::OrchestrationEventSink;
pub use store::{InMemoryOrchestrationEventStore, OrchestrationEventStore};
