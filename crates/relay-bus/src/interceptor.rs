//! Handler interceptor - wraps every handler invocation
//!
//! The interceptor owns the cross-cutting concerns around a handler call:
//! method-scoped trace span, entry/exit logging with elapsed time,
//! timeout enforcement, error capture, client-message defaulting, and
//! transaction rollback scheduling. Nothing thrown by or around a handler
//! escapes this wrapper; every outcome flows through the result object.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use relay_common::{ErrorResult, MessageHandlerResult};
use relay_queue::TransactionController;

use crate::context::HandlerContext;
use crate::registry::{MessageProcessor, ProcessorError};

/// Result of an intercepted handler invocation.
pub struct InterceptedOutcome {
    pub result: MessageHandlerResult,
    /// Typed reply captured from the context, when the handler set one
    pub reply: Option<serde_json::Value>,
}

pub struct HandlerInterceptor {
    default_client_message: String,
}

impl HandlerInterceptor {
    pub fn new(default_client_message: impl Into<String>) -> Self {
        Self {
            default_client_message: default_client_message.into(),
        }
    }

    pub async fn invoke(
        &self,
        processor: &MessageProcessor,
        body: serde_json::Value,
        ctx: HandlerContext,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> InterceptedOutcome {
        let message_id = ctx.message_id;
        let transaction = ctx.transaction.clone();
        let span = ctx.trace.span(processor.message_type());

        async move {
            debug!(
                message_type = processor.message_type(),
                message_id = %message_id,
                "Method_In"
            );
            let started = Instant::now();

            let invocation = processor.invoke(body, ctx, cancel);
            let raced = match timeout {
                Some(limit) => tokio::time::timeout(limit, invocation).await,
                None => Ok(invocation.await),
            };

            let outcome = match raced {
                Err(_elapsed) => {
                    // Same outcome path as an unhandled handler failure
                    warn!(
                        message_id = %message_id,
                        timeout_ms = timeout.map(|t| t.as_millis() as u64),
                        "Handler timed out"
                    );
                    transaction.schedule_rollback(Some("handler timed out".to_string()));
                    InterceptedOutcome {
                        result: MessageHandlerResult::Error(ErrorResult {
                            client_message: Some(self.default_client_message.clone()),
                            id_command_query: Some(message_id),
                            detail: "handler timed out".to_string(),
                            has_transaction_rollback_error: true,
                        }),
                        reply: None,
                    }
                }
                Ok((Ok(result), mut ctx)) => {
                    let result = match result {
                        MessageHandlerResult::Error(mut error) => {
                            if error.client_message.is_none() {
                                error.client_message = Some(self.default_client_message.clone());
                            }
                            if error.id_command_query.is_none() {
                                error.id_command_query = Some(message_id);
                            }
                            if error.has_transaction_rollback_error {
                                transaction
                                    .schedule_rollback(Some(error.detail.clone()));
                            }
                            MessageHandlerResult::Error(error)
                        }
                        other => other,
                    };
                    InterceptedOutcome {
                        result,
                        reply: ctx.take_reply(),
                    }
                }
                Ok((Err(processor_error), _ctx)) => {
                    let detail = match processor_error {
                        ProcessorError::InvariantViolation(detail) => {
                            warn!(message_id = %message_id, detail = %detail, "Handler invariant violation");
                            detail
                        }
                        ProcessorError::Failure(failure) => {
                            warn!(message_id = %message_id, error = %failure, "Unhandled handler failure");
                            failure.to_string()
                        }
                    };
                    transaction.schedule_rollback(Some(detail.clone()));
                    InterceptedOutcome {
                        result: MessageHandlerResult::Error(ErrorResult {
                            client_message: Some(self.default_client_message.clone()),
                            id_command_query: Some(message_id),
                            detail,
                            has_transaction_rollback_error: true,
                        }),
                        reply: None,
                    }
                }
            };

            debug!(
                message_type = processor.message_type(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Method_Out"
            );
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BusMessage, MessageHandler};
    use crate::registry::HandlerRegistry;
    use async_trait::async_trait;
    use chrono::Utc;
    use indexmap::IndexMap;
    use relay_common::{HandlerFailure, HandlerResult, MessageStatus, QueuedMessage, TraceInfo};
    use relay_queue::{InMemoryTransactionFactory, TransactionControllerFactory};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Serialize, Deserialize)]
    struct Probe {
        mode: String,
    }

    impl BusMessage for Probe {
        const MESSAGE_TYPE: &'static str = "test.probe";
    }

    struct ProbeHandler;

    #[async_trait]
    impl MessageHandler<Probe> for ProbeHandler {
        async fn handle(
            &self,
            message: Probe,
            _ctx: &mut HandlerContext,
            _cancel: CancellationToken,
        ) -> HandlerResult {
            match message.mode.as_str() {
                "bare-error" => Ok(MessageHandlerResult::error("upstream said no")),
                "fail" => Err(HandlerFailure::new("boom")),
                _ => Ok(MessageHandlerResult::completed()),
            }
        }
    }

    fn queued_message() -> QueuedMessage {
        QueuedMessage {
            message_id: uuid::Uuid::new_v4(),
            parent_message_id: None,
            id_session: None,
            publisher_id: "tests".to_string(),
            publishing_time_utc: Utc::now(),
            time_to_live_utc: None,
            delayed_to_utc: None,
            message_type: Probe::MESSAGE_TYPE.to_string(),
            content_type: "application/json".to_string(),
            content_encoding: None,
            is_compressed_content: false,
            is_encrypted_content: false,
            contains_content: true,
            has_self_content: true,
            disabled_message_persistence: false,
            priority: 0,
            headers: IndexMap::new(),
            routing_key: None,
            timeout: None,
            retry_count: 0,
            error_handling: None,
            status: MessageStatus::Created,
            processed: false,
            source_exchange_name: "ex".to_string(),
            queue_name: "q".to_string(),
            disable_fault_queue: false,
            body: None,
        }
    }

    async fn run(mode: &str) -> (InterceptedOutcome, Arc<dyn relay_queue::TransactionController>) {
        let registry = HandlerRegistry::new();
        registry.register::<Probe, _>(ProbeHandler);
        let processor = registry.resolve(Probe::MESSAGE_TYPE).unwrap();

        let message = queued_message();
        let tx = InMemoryTransactionFactory.begin();
        let ctx = HandlerContext::new(&message, TraceInfo::new("tests"), tx.clone());
        let interceptor = HandlerInterceptor::new("Please try again later.");

        let outcome = interceptor
            .invoke(
                &processor,
                serde_json::json!({ "mode": mode }),
                ctx,
                CancellationToken::new(),
                None,
            )
            .await;
        (outcome, tx)
    }

    #[tokio::test]
    async fn error_results_get_default_client_message_and_id() {
        let (outcome, tx) = run("bare-error").await;
        match outcome.result {
            MessageHandlerResult::Error(error) => {
                assert_eq!(
                    error.client_message.as_deref(),
                    Some("Please try again later.")
                );
                assert!(error.id_command_query.is_some());
                assert_eq!(error.detail, "upstream said no");
                assert!(!error.has_transaction_rollback_error);
            }
            other => panic!("expected error result, got {other:?}"),
        }
        assert!(!tx.is_rollback_scheduled());
    }

    #[tokio::test]
    async fn handler_failure_schedules_rollback() {
        let (outcome, tx) = run("fail").await;
        match outcome.result {
            MessageHandlerResult::Error(error) => {
                assert!(error.has_transaction_rollback_error);
                assert_eq!(error.detail, "boom");
            }
            other => panic!("expected error result, got {other:?}"),
        }
        assert!(tx.is_rollback_scheduled());
    }

    #[tokio::test]
    async fn undecodable_payload_is_an_invariant_violation() {
        let registry = HandlerRegistry::new();
        registry.register::<Probe, _>(ProbeHandler);
        let processor = registry.resolve(Probe::MESSAGE_TYPE).unwrap();

        let message = queued_message();
        let tx = InMemoryTransactionFactory.begin();
        let ctx = HandlerContext::new(&message, TraceInfo::new("tests"), tx.clone());
        let interceptor = HandlerInterceptor::new("Please try again later.");

        let outcome = interceptor
            .invoke(
                &processor,
                serde_json::json!(42),
                ctx,
                CancellationToken::new(),
                None,
            )
            .await;

        assert!(matches!(outcome.result, MessageHandlerResult::Error(_)));
        assert!(tx.is_rollback_scheduled());
    }
}
