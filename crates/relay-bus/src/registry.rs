//! Handler registry - message-type token to erased handler processor
//!
//! Registration stores a factory per message type; the first dispatch for
//! a type constructs the erased processor and installs it in a concurrent
//! append-only cache. Later lookups are plain reads.

use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_common::{HandlerFailure, MessageHandlerResult};

use crate::context::HandlerContext;
use crate::handler::{BusMessage, MessageHandler};

/// Failure produced by the erased invoke path before or around the user
/// handler.
#[derive(Debug)]
pub enum ProcessorError {
    /// Payload did not decode to the registered concrete type, or another
    /// internal contract was broken
    InvariantViolation(String),
    /// The user handler failed
    Failure(HandlerFailure),
}

type InvokeFn = Box<
    dyn Fn(
            serde_json::Value,
            HandlerContext,
            CancellationToken,
        ) -> BoxFuture<
            'static,
            (
                Result<MessageHandlerResult, ProcessorError>,
                HandlerContext,
            ),
        > + Send
        + Sync,
>;

/// Type-erased handler for one message type.
pub struct MessageProcessor {
    message_type: &'static str,
    invoke: InvokeFn,
}

impl MessageProcessor {
    fn new<M, H>(handler: Arc<H>) -> Self
    where
        M: BusMessage,
        H: MessageHandler<M> + 'static,
    {
        let invoke: InvokeFn = Box::new(move |body, mut ctx, cancel| {
            let handler = handler.clone();
            Box::pin(async move {
                let typed: M = match serde_json::from_value(body) {
                    Ok(typed) => typed,
                    Err(e) => {
                        return (
                            Err(ProcessorError::InvariantViolation(format!(
                                "payload does not decode as {}: {e}",
                                M::MESSAGE_TYPE
                            ))),
                            ctx,
                        )
                    }
                };
                let result = handler.handle(typed, &mut ctx, cancel).await;
                (result.map_err(ProcessorError::Failure), ctx)
            })
        });

        Self {
            message_type: M::MESSAGE_TYPE,
            invoke,
        }
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn invoke(
        &self,
        body: serde_json::Value,
        ctx: HandlerContext,
        cancel: CancellationToken,
    ) -> BoxFuture<
        'static,
        (
            Result<MessageHandlerResult, ProcessorError>,
            HandlerContext,
        ),
    > {
        (self.invoke)(body, ctx, cancel)
    }
}

type ProcessorFactory = Box<dyn Fn() -> MessageProcessor + Send + Sync>;

/// Concurrent registry of handler processors keyed by message type token.
///
/// The processor cache is the only process-wide mutable state in the
/// runtime: concurrent-safe and append-only, no eviction.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: DashMap<&'static str, ProcessorFactory>,
    processors: DashMap<&'static str, Arc<MessageProcessor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message type. The handler instance is
    /// shared across invocations; the context is fresh per invocation.
    pub fn register<M, H>(&self, handler: H)
    where
        M: BusMessage,
        H: MessageHandler<M> + 'static,
    {
        let handler = Arc::new(handler);
        self.factories.insert(
            M::MESSAGE_TYPE,
            Box::new(move || MessageProcessor::new::<M, H>(handler.clone())),
        );
        debug!(message_type = M::MESSAGE_TYPE, "Registered handler");
    }

    /// Resolve the processor for a message type token.
    ///
    /// First miss constructs from the registered factory and installs;
    /// subsequent lookups read the cache.
    pub fn resolve(&self, message_type: &str) -> Option<Arc<MessageProcessor>> {
        if let Some(processor) = self.processors.get(message_type) {
            return Some(processor.clone());
        }

        let factory = self.factories.get(message_type)?;
        let key = *factory.key();
        let processor = self
            .processors
            .entry(key)
            .or_insert_with(|| Arc::new((factory.value())()))
            .clone();
        Some(processor)
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.factories.contains_key(message_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.factories.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageHandler;
    use async_trait::async_trait;
    use relay_common::HandlerResult;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
    }

    struct PingHandler;

    #[async_trait]
    impl MessageHandler<Ping> for PingHandler {
        async fn handle(
            &self,
            _message: Ping,
            _ctx: &mut HandlerContext,
            _cancel: CancellationToken,
        ) -> HandlerResult {
            Ok(MessageHandlerResult::completed())
        }
    }

    #[test]
    fn resolve_memoizes_the_processor() {
        let registry = HandlerRegistry::new();
        registry.register::<Ping, _>(PingHandler);

        let first = registry.resolve("test.ping").unwrap();
        let second = registry.resolve("test.ping").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.message_type(), "test.ping");
    }

    #[test]
    fn resolve_unknown_type_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("test.unknown").is_none());
        assert!(!registry.is_registered("test.unknown"));
    }
}
