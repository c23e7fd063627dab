//! MessageBus - the producer facade
//!
//! Owns the exchange router and the queue registry, builds message
//! envelopes, persists bodies through the provider when allowed, and
//! dispatches to every bound queue inside one transaction. Shutdown
//! cancels and disposes every queue.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use relay_common::{
    MessageOptions, MessageStatus, QueueEventSink, QueuedMessage, RelayError, Result, TraceInfo,
    TracingEventSink,
};
use relay_config::BusConfig;
use relay_queue::{
    execute_in_transaction, InMemoryTransactionFactory, MessageBodyProvider,
    TransactionControllerFactory,
};
use relay_router::ExchangeRouter;

use crate::context::QueueRuntimeContext;
use crate::handler::{EventMessage, RequestMessage, RequestMessageWithResponse, SendResponse};
use crate::interceptor::HandlerInterceptor;
use crate::queue::{MessageQueue, SyncDispatch};
use crate::registry::HandlerRegistry;

pub struct MessageBus {
    bus_name: String,
    publisher_id: String,
    router: ExchangeRouter,
    queues: DashMap<String, Arc<MessageQueue>>,
    runtime: QueueRuntimeContext,
    cancel: CancellationToken,
}

impl MessageBus {
    /// Build a bus with the embedded providers (in-memory transactions,
    /// tracing event sink, no body persistence).
    pub fn new(config: BusConfig, registry: Arc<HandlerRegistry>) -> Result<Arc<Self>> {
        Self::with_providers(
            config,
            registry,
            None,
            Arc::new(TracingEventSink),
            Arc::new(InMemoryTransactionFactory),
        )
    }

    pub fn with_providers(
        config: BusConfig,
        registry: Arc<HandlerRegistry>,
        body_provider: Option<Arc<dyn MessageBodyProvider>>,
        event_sink: Arc<dyn QueueEventSink>,
        transactions: Arc<dyn TransactionControllerFactory>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let interceptor = Arc::new(HandlerInterceptor::new(
            config.default_client_error_message.clone(),
        ));
        let runtime = QueueRuntimeContext {
            transactions,
            body_provider,
            event_sink,
            registry,
            interceptor,
        };

        let cancel = CancellationToken::new();
        let default_policy = config.default_error_handling.to_policy();

        let queues = DashMap::new();
        for definition in &config.queues {
            let policy = definition
                .error_handling_policy()
                .or_else(|| Some(default_policy.clone()));
            let queue = Arc::new(MessageQueue::new(
                definition,
                policy,
                runtime.clone(),
                cancel.child_token(),
            ));
            queues.insert(definition.name.clone(), queue);
        }

        // Wire the first declared fault queue into every other queue
        let fault_queue = config
            .queues
            .iter()
            .find(|d| d.is_fault_queue)
            .and_then(|d| queues.get(&d.name).map(|q| q.clone()));
        if let Some(ref fault) = fault_queue {
            for entry in queues.iter() {
                if !entry.value().is_fault_queue() {
                    entry.value().set_fault_queue(fault.clone());
                }
            }
        }

        let router = ExchangeRouter::new();
        for definition in &config.exchanges {
            router
                .register(definition.to_exchange())
                .map_err(|e| RelayError::Config(e.to_string()))?;
        }

        for entry in queues.iter() {
            entry.value().start_dispatcher();
        }

        info!(
            bus = %config.bus_name,
            queues = queues.len(),
            exchanges = config.exchanges.len(),
            "Message bus started"
        );

        Ok(Arc::new(Self {
            bus_name: config.bus_name,
            publisher_id: config.host.host_name,
            router,
            queues,
            runtime,
            cancel,
        }))
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn queue(&self, name: &str) -> Option<Arc<MessageQueue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    pub fn runtime(&self) -> &QueueRuntimeContext {
        &self.runtime
    }

    /// Dispatch a command or query; the returned id identifies the
    /// publication across every bound queue.
    pub async fn send<M: RequestMessage>(
        &self,
        message: &M,
        options: MessageOptions,
        trace: &TraceInfo,
    ) -> Result<Uuid> {
        let body = serde_json::to_value(message)?;
        let dispatched = self
            .dispatch(M::MESSAGE_TYPE, body, options, trace)
            .await?;
        Ok(dispatched.message_id)
    }

    /// Dispatch a request expecting a typed reply. Requires a single
    /// push-synchronous target queue.
    pub async fn send_with_response<M: RequestMessageWithResponse>(
        &self,
        message: &M,
        mut options: MessageOptions,
        trace: &TraceInfo,
    ) -> Result<SendResponse<M::Response>> {
        if options.is_asynchronous_invocation {
            return Err(RelayError::Argument(
                "send_with_response requires synchronous invocation".to_string(),
            ));
        }
        options.throw_no_handler_exception = true;

        let body = serde_json::to_value(message)?;
        let dispatched = self
            .dispatch(M::MESSAGE_TYPE, body, options, trace)
            .await?;

        let reply = dispatched
            .replies
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| {
                RelayError::Handler(format!(
                    "handler for {} produced no reply",
                    M::MESSAGE_TYPE
                ))
            })?;
        let response: M::Response = serde_json::from_value(reply)?;
        Ok(SendResponse {
            message_id: dispatched.message_id,
            response,
        })
    }

    /// Publish a fan-out event.
    pub async fn publish<E: EventMessage>(
        &self,
        event: &E,
        options: MessageOptions,
        trace: &TraceInfo,
    ) -> Result<Uuid> {
        let body = serde_json::to_value(event)?;
        let dispatched = self
            .dispatch(E::MESSAGE_TYPE, body, options, trace)
            .await?;
        Ok(dispatched.message_id)
    }

    async fn dispatch(
        &self,
        message_type: &str,
        body: serde_json::Value,
        options: MessageOptions,
        trace: &TraceInfo,
    ) -> Result<Dispatched> {
        if options.exchange_name.trim().is_empty() {
            return Err(RelayError::Argument(
                "exchange_name must not be empty".to_string(),
            ));
        }

        let bindings = self
            .router
            .resolve(
                &options.exchange_name,
                &options.headers,
                options.routing_key.as_deref(),
            )
            .map_err(|e| RelayError::Argument(e.to_string()))?;

        // One visit per binding, deduplicated by queue id
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for queue_name in &bindings {
            let Some(queue) = self.queues.get(queue_name).map(|q| q.clone()) else {
                warn!(
                    exchange = %options.exchange_name,
                    queue = %queue_name,
                    "Binding references unknown queue - skipping"
                );
                continue;
            };
            if seen.insert(queue.queue_id()) {
                targets.push(queue);
            }
        }

        let message_id = Uuid::new_v4();

        if targets.is_empty() {
            if options.throw_no_handler_exception {
                return Err(RelayError::Handler(format!(
                    "no queue bound for exchange {} (routing key {:?})",
                    options.exchange_name, options.routing_key
                )));
            }
            warn!(
                exchange = %options.exchange_name,
                routing_key = ?options.routing_key,
                message_type = %message_type,
                "Publication matched no queue"
            );
            return Ok(Dispatched {
                message_id,
                replies: Vec::new(),
            });
        }

        let provider = self.runtime.body_provider.clone();
        let frame = trace.child_frame("message_bus::dispatch");
        let synchronous = !options.is_asynchronous_invocation;

        let mut envelopes = Vec::with_capacity(targets.len());
        let persist = {
            // Build a probe envelope to consult the persistence gate
            let probe = self.build_envelope(
                message_id,
                message_type,
                &body,
                &options,
                targets[0].name(),
                true,
            );
            provider
                .as_ref()
                .map(|p| p.allow_message_persistence(options.disabled_message_persistence, &probe))
                .unwrap_or(false)
        };
        for queue in &targets {
            envelopes.push(self.build_envelope(
                message_id,
                message_type,
                &body,
                &options,
                queue.name(),
                !persist,
            ));
        }

        let tx = self.runtime.transactions.begin();
        let cancel = self.cancel.clone();
        let targets_ref = &targets;
        let envelopes_ref = &envelopes;
        let frame_ref = &frame;
        let body_ref = &body;

        let replies = execute_in_transaction(
            tx,
            |tx| async move {
                if persist {
                    if let Some(provider) = provider.as_ref() {
                        provider
                            .save_to_storage(envelopes_ref, body_ref, frame_ref, &tx)
                            .await
                            .map_err(RelayError::from)?;
                    }
                }

                let mut replies = Vec::new();
                for (queue, envelope) in targets_ref.iter().zip(envelopes_ref.iter().cloned()) {
                    if synchronous && !queue.is_pull() {
                        let SyncDispatch { status, reply } =
                            queue.enqueue_sync(envelope, frame_ref, &tx, &cancel).await?;
                        // Deferred messages stay queued for the background
                        // dispatcher; anything else non-completed failed
                        // in the caller's scope
                        if !matches!(status, MessageStatus::Completed | MessageStatus::Deferred) {
                            return Err(RelayError::Handler(format!(
                                "synchronous dispatch to queue {} ended with status {:?}",
                                queue.name(),
                                status
                            )));
                        }
                        if let (Some(provider), Some(reply)) = (provider.as_ref(), reply.as_ref())
                        {
                            provider
                                .save_reply_to_storage(message_id, reply, frame_ref, &tx)
                                .await
                                .map_err(RelayError::from)?;
                        }
                        replies.push(reply);
                    } else {
                        queue.enqueue(envelope, frame_ref, &tx).await?;
                        replies.push(None);
                    }
                }
                Ok(replies)
            },
            |e| {
                error!(
                    message_type = %message_type,
                    message_id = %message_id,
                    error = %e,
                    "Dispatch failed"
                );
            },
        )
        .await?;

        Ok(Dispatched {
            message_id,
            replies,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_envelope(
        &self,
        message_id: Uuid,
        message_type: &str,
        body: &serde_json::Value,
        options: &MessageOptions,
        queue_name: &str,
        inline_body: bool,
    ) -> QueuedMessage {
        let now = Utc::now();
        QueuedMessage {
            message_id,
            parent_message_id: None,
            id_session: options.id_session,
            publisher_id: self.publisher_id.clone(),
            publishing_time_utc: now,
            time_to_live_utc: options.time_to_live.map(|ttl| {
                now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
            }),
            delayed_to_utc: None,
            message_type: message_type.to_string(),
            content_type: options.content_type.clone(),
            content_encoding: options.content_encoding.clone(),
            is_compressed_content: options.is_compress_content,
            is_encrypted_content: options.is_encrypt_content,
            contains_content: true,
            has_self_content: inline_body,
            disabled_message_persistence: options.disabled_message_persistence,
            priority: options.priority,
            headers: options.headers.clone(),
            routing_key: options.routing_key.clone(),
            timeout: options.timeout,
            retry_count: 0,
            error_handling: options.error_handling.clone(),
            status: MessageStatus::Created,
            processed: false,
            source_exchange_name: options.exchange_name.clone(),
            queue_name: queue_name.to_string(),
            disable_fault_queue: options.disable_fault_queue,
            body: inline_body.then(|| body.clone()),
        }
    }

    /// Graceful shutdown: stop dispatchers and dispose every queue.
    pub async fn shutdown(&self) {
        info!(bus = %self.bus_name, "Message bus shutting down");
        self.cancel.cancel();
        for entry in self.queues.iter() {
            entry.value().dispose().await;
        }
        info!(bus = %self.bus_name, "Message bus shutdown complete");
    }
}

struct Dispatched {
    message_id: Uuid,
    replies: Vec<Option<serde_json::Value>>,
}
