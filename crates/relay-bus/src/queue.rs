//! MessageQueue - per-logical-queue runtime
//!
//! Owns the queue container, drives the push/pull dispatch loop, applies
//! retry/error policy, routes expired messages to the fault queue, and
//! emits a diagnostic event per operation. Within one queue the dispatch
//! loop is single-flight: an async mutex serializes `on_message` and
//! concurrent triggers coalesce into one drain pass. Across queues there
//! is no coordination.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use relay_common::{
    queue_id_for, ErrorHandlingPolicy, MessageHandlerResult, MessageMetadataUpdate, MessageStatus,
    QueueEvent, QueueEventKind, QueueEventSink, QueueStatus, QueueType, QueuedMessage, RelayError,
    Result, TraceInfo,
};
use relay_config::QueueDefinition;
use relay_queue::{
    MemoryQueueContainer, MessageBodyProvider, QueueContainer, TransactionController,
    TransactionControllerFactory,
};

use crate::context::{HandlerContext, QueueRuntimeContext};

/// Outcome of handling one message.
pub(crate) struct HandleOutcome {
    pub update: MessageMetadataUpdate,
    pub reply: Option<serde_json::Value>,
}

/// Outcome of a push-synchronous enqueue, observed by the caller.
#[derive(Debug)]
pub struct SyncDispatch {
    pub status: MessageStatus,
    pub reply: Option<serde_json::Value>,
}

pub struct MessageQueue {
    name: String,
    id: Uuid,
    queue_type: QueueType,
    is_pull: bool,
    is_fault_queue: bool,
    // Hard-wired on the in-memory implementation; a durable container
    // would flip it
    is_persistent: bool,
    fetch_interval: Duration,
    default_processing_timeout: Option<Duration>,
    error_handling: Option<ErrorHandlingPolicy>,

    container: Box<dyn QueueContainer>,
    runtime: QueueRuntimeContext,

    status: Mutex<QueueStatus>,
    disposed: AtomicBool,
    dispatch_lock: tokio::sync::Mutex<()>,
    notify: Arc<tokio::sync::Notify>,
    cancel: CancellationToken,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    fault_queue: RwLock<Option<Arc<MessageQueue>>>,
}

impl MessageQueue {
    pub fn new(
        definition: &QueueDefinition,
        error_handling: Option<ErrorHandlingPolicy>,
        runtime: QueueRuntimeContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: definition.name.clone(),
            id: queue_id_for(&definition.name),
            queue_type: definition.queue_type,
            is_pull: definition.is_pull,
            is_fault_queue: definition.is_fault_queue,
            is_persistent: false,
            fetch_interval: definition.fetch_interval(),
            default_processing_timeout: definition.default_processing_timeout(),
            error_handling,
            container: Box::new(MemoryQueueContainer::for_type(
                definition.queue_type,
                definition.max_size,
            )),
            runtime,
            status: Mutex::new(QueueStatus::Running),
            disposed: AtomicBool::new(false),
            dispatch_lock: tokio::sync::Mutex::new(()),
            notify: Arc::new(tokio::sync::Notify::new()),
            cancel,
            dispatch_task: Mutex::new(None),
            fault_queue: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_id(&self) -> Uuid {
        self.id
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn is_pull(&self) -> bool {
        self.is_pull
    }

    pub fn is_fault_queue(&self) -> bool {
        self.is_fault_queue
    }

    pub fn is_persistent(&self) -> bool {
        self.is_persistent
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.lock()
    }

    /// Wire the queue receiving this queue's expired messages.
    pub fn set_fault_queue(&self, fault_queue: Arc<MessageQueue>) {
        *self.fault_queue.write() = Some(fault_queue);
    }

    fn fault_queue_ref(&self) -> Option<Arc<MessageQueue>> {
        self.fault_queue.read().clone()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: QueueEvent) {
        self.runtime.event_sink.publish(event);
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(RelayError::InvalidState(format!(
                "queue {} is disposed",
                self.name
            )));
        }
        Ok(())
    }

    fn ensure_enqueueable(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.status() == QueueStatus::Terminated {
            return Err(RelayError::InvalidState(format!(
                "queue {} is terminated",
                self.name
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue status transitions (monotone: Terminated sticks)
    // ------------------------------------------------------------------

    pub fn suspend(&self) {
        let mut status = self.status.lock();
        if *status == QueueStatus::Running {
            *status = QueueStatus::Suspended;
            info!(queue = %self.name, "Queue suspended");
        }
    }

    /// External resumption after a suspension; wakes the dispatcher.
    pub fn resume(&self) {
        {
            let mut status = self.status.lock();
            if *status != QueueStatus::Suspended {
                return;
            }
            *status = QueueStatus::Running;
        }
        info!(queue = %self.name, "Queue resumed");
        self.notify.notify_one();
    }

    pub fn terminate(&self) {
        let mut status = self.status.lock();
        if *status != QueueStatus::Terminated {
            *status = QueueStatus::Terminated;
            info!(queue = %self.name, "Queue terminated");
        }
    }

    // ------------------------------------------------------------------
    // Producer / pull-consumer surface
    // ------------------------------------------------------------------

    /// Store a message; push queues schedule a dispatch pass once the
    /// caller's transaction commits.
    pub async fn enqueue(
        &self,
        message: QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        self.ensure_enqueueable()?;

        let message_id = message.message_id;
        if let Err(e) = self.container.enqueue(vec![message], trace, tx).await {
            self.emit(
                QueueEvent::new(&self.name, QueueEventKind::Enqueue, Some(message_id))
                    .with_error(e.to_string()),
            );
            return Err(e.into());
        }
        self.emit(QueueEvent::new(
            &self.name,
            QueueEventKind::Enqueue,
            Some(message_id),
        ));

        if !self.is_pull {
            let notify = self.notify.clone();
            tx.on_commit(Box::new(move || {
                Box::pin(async move {
                    notify.notify_one();
                })
            }));
        }
        Ok(())
    }

    /// Push-synchronous enqueue: the handler runs inside the caller's
    /// transaction and the caller observes the outcome immediately.
    pub(crate) async fn enqueue_sync(
        &self,
        message: QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
        cancel: &CancellationToken,
    ) -> Result<SyncDispatch> {
        self.ensure_enqueueable()?;
        if self.status() == QueueStatus::Suspended {
            return Err(RelayError::InvalidState(format!(
                "queue {} is suspended",
                self.name
            )));
        }

        // Serialize with the dispatch loop so the background pass cannot
        // deliver this message while the caller's handler runs. The lock
        // is non-reentrant: a handler must not sync-send to its own queue.
        let _guard = self.dispatch_lock.lock().await;

        self.container
            .enqueue(vec![message.clone()], trace, tx)
            .await
            .map_err(RelayError::from)?;
        self.emit(QueueEvent::new(
            &self.name,
            QueueEventKind::Enqueue,
            Some(message.message_id),
        ));

        let outcome = self.handle_message(message.clone(), trace, tx, cancel).await?;
        self.emit(
            QueueEvent::new(&self.name, QueueEventKind::OnMessage, Some(message.message_id))
                .with_status(outcome.update.status),
        );

        if outcome.update.status == MessageStatus::Completed {
            self.container
                .try_remove(&message, trace, tx)
                .await
                .map_err(RelayError::from)?;
            self.emit(QueueEvent::new(
                &self.name,
                QueueEventKind::Remove,
                Some(message.message_id),
            ));
        } else if self.queue_type == QueueType::SequentialFifo
            && outcome.update.status.blocks_fifo()
        {
            self.suspend();
        }

        Ok(SyncDispatch {
            status: outcome.update.status,
            reply: outcome.reply,
        })
    }

    /// Pull-consumer peek.
    pub async fn try_peek(
        &self,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<Option<QueuedMessage>> {
        self.ensure_not_disposed()?;
        match self.container.try_peek(trace, tx).await {
            Ok(head) => {
                self.emit(QueueEvent::new(
                    &self.name,
                    QueueEventKind::Peek,
                    head.as_ref().map(|m| m.message_id),
                ));
                Ok(head)
            }
            Err(e) => {
                self.emit(
                    QueueEvent::new(&self.name, QueueEventKind::Peek, None)
                        .with_error(e.to_string()),
                );
                Err(e.into())
            }
        }
    }

    /// Pull-consumer remove.
    pub async fn try_remove(
        &self,
        message: &QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<()> {
        self.ensure_not_disposed()?;
        match self.container.try_remove(message, trace, tx).await {
            Ok(()) => {
                self.emit(QueueEvent::new(
                    &self.name,
                    QueueEventKind::Remove,
                    Some(message.message_id),
                ));
                Ok(())
            }
            Err(e) => {
                self.emit(
                    QueueEvent::new(&self.name, QueueEventKind::Remove, Some(message.message_id))
                        .with_error(e.to_string()),
                );
                Err(e.into())
            }
        }
    }

    pub async fn count(&self) -> Result<usize> {
        self.ensure_not_disposed()?;
        Ok(self.container.count().await)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Start the background dispatch task for a push-asynchronous queue.
    pub fn start_dispatcher(self: &Arc<Self>) {
        if self.is_pull {
            return;
        }
        let queue = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.notify.notified() => {}
                    // Idle re-poll so delayed messages become eligible
                    _ = tokio::time::sleep(queue.fetch_interval) => {}
                }
                queue.on_message(&cancel).await;
            }
            debug!(queue = %queue.name, "Dispatch task exited");
        });
        *self.dispatch_task.lock() = Some(handle);
    }

    /// Dispatch tick: drain eligible messages one at a time, each in a
    /// fresh transaction. Single-flight per queue; a concurrent trigger
    /// while a pass is running coalesces into that pass.
    pub async fn on_message(&self, cancel: &CancellationToken) {
        let _guard = match self.dispatch_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        loop {
            if cancel.is_cancelled() || self.is_disposed() || self.status() != QueueStatus::Running
            {
                return;
            }
            if self.container.count().await == 0 {
                return;
            }

            let trace = TraceInfo::new("message_queue::on_message");
            let tx = self.runtime.transactions.begin();

            let head = match self.container.try_peek(&trace, &tx).await {
                Ok(head) => {
                    self.emit(QueueEvent::new(
                        &self.name,
                        QueueEventKind::Peek,
                        head.as_ref().map(|m| m.message_id),
                    ));
                    head
                }
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Peek failed");
                    self.emit(
                        QueueEvent::new(&self.name, QueueEventKind::Peek, None)
                            .with_error(e.to_string()),
                    );
                    tx.schedule_rollback(Some(e.to_string()));
                    let _ = tx.complete().await;
                    return;
                }
            };

            let head = match head {
                Some(head) => head,
                None => {
                    let _ = tx.complete().await;
                    return;
                }
            };

            if head.processed {
                if let Err(e) = self.container.try_remove(&head, &trace, &tx).await {
                    warn!(queue = %self.name, message_id = %head.message_id, error = %e, "Failed to remove processed message");
                    tx.schedule_rollback(Some(e.to_string()));
                } else {
                    self.emit(QueueEvent::new(
                        &self.name,
                        QueueEventKind::Remove,
                        Some(head.message_id),
                    ));
                }
                let _ = tx.complete().await;
                continue;
            }

            if head.is_expired(Utc::now()) {
                if !self.route_expired(&head, &trace, &tx).await {
                    // Fault routing failed; transaction rolled back, the
                    // message is retried next tick
                    return;
                }
                continue;
            }

            let outcome = match self.handle_message(head.clone(), &trace, &tx, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(queue = %self.name, message_id = %head.message_id, error = %e, "Message handling failed");
                    self.emit(
                        QueueEvent::new(&self.name, QueueEventKind::OnMessage, Some(head.message_id))
                            .with_error(e.to_string()),
                    );
                    tx.schedule_rollback(Some(e.to_string()));
                    let _ = tx.complete().await;
                    return;
                }
            };

            self.emit(
                QueueEvent::new(&self.name, QueueEventKind::OnMessage, Some(head.message_id))
                    .with_status(outcome.update.status),
            );

            if outcome.update.status == MessageStatus::Completed {
                match self.container.try_remove(&head, &trace, &tx).await {
                    Ok(()) => {
                        self.emit(QueueEvent::new(
                            &self.name,
                            QueueEventKind::Remove,
                            Some(head.message_id),
                        ));
                    }
                    Err(e) => {
                        warn!(queue = %self.name, message_id = %head.message_id, error = %e, "Failed to remove completed message");
                        tx.schedule_rollback(Some(e.to_string()));
                    }
                }
                let _ = tx.complete().await;
                continue;
            }

            let rollback_scheduled = tx.is_rollback_scheduled();
            let _ = tx.complete().await;

            if self.queue_type == QueueType::SequentialFifo && outcome.update.status.blocks_fifo() {
                self.suspend();
                return;
            }
            if rollback_scheduled {
                // Handler failure path: side effects rolled back, message
                // kept in prior status, retried next tick
                return;
            }
        }
    }

    /// Route an expired head to the fault queue and drop it from this
    /// queue. Returns false when the pass must stop (rollback scheduled).
    async fn route_expired(
        &self,
        head: &QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> bool {
        if !head.disable_fault_queue {
            match self.fault_queue_ref() {
                Some(fault_queue) => {
                    let fault_message = self.to_fault_message(head, &fault_queue);
                    if let Err(e) = fault_queue.enqueue(fault_message, trace, tx).await {
                        error!(
                            queue = %self.name,
                            fault_queue = %fault_queue.name,
                            message_id = %head.message_id,
                            error = %e,
                            "Fault-queue enqueue failed"
                        );
                        tx.schedule_rollback(Some(e.to_string()));
                        let _ = tx.complete().await;
                        return false;
                    }
                    debug!(
                        queue = %self.name,
                        fault_queue = %fault_queue.name,
                        message_id = %head.message_id,
                        "Expired message routed to fault queue"
                    );
                }
                None => {
                    warn!(
                        queue = %self.name,
                        message_id = %head.message_id,
                        "Expired message dropped - no fault queue wired"
                    );
                }
            }
        }

        if let Err(e) = self.container.try_remove(head, trace, tx).await {
            warn!(queue = %self.name, message_id = %head.message_id, error = %e, "Failed to remove expired message");
            tx.schedule_rollback(Some(e.to_string()));
            let _ = tx.complete().await;
            return false;
        }
        self.emit(QueueEvent::new(
            &self.name,
            QueueEventKind::Remove,
            Some(head.message_id),
        ));
        let _ = tx.complete().await;
        true
    }

    fn to_fault_message(&self, original: &QueuedMessage, fault_queue: &MessageQueue) -> QueuedMessage {
        let mut fault = original.clone();
        fault.queue_name = fault_queue.name.clone();
        fault.status = MessageStatus::Created;
        fault.processed = false;
        fault.delayed_to_utc = None;
        fault.time_to_live_utc = None;
        fault.disable_fault_queue = true;
        fault
            .headers
            .insert("fault-source-queue".to_string(), self.name.clone());
        fault
            .headers
            .insert("fault-reason".to_string(), "expired".to_string());
        fault
    }

    /// Invoke the handler pipeline for one message and persist the
    /// resulting metadata update.
    ///
    /// The handler runs inside the operation transaction `tx`; the update
    /// is persisted through a fresh transaction that commits unless the
    /// handler scheduled a rollback, in which case the message keeps its
    /// prior status.
    async fn handle_message(
        &self,
        mut message: QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome> {
        let prior_status = message.status;
        message.status = MessageStatus::Delivered;

        let processor = self
            .runtime
            .registry
            .resolve(&message.message_type)
            .ok_or_else(|| {
                RelayError::InvariantViolation(format!(
                    "no handler registered for message type {}",
                    message.message_type
                ))
            })?;

        let body = self.resolve_body(&message, trace, tx).await?;

        let frame = trace.child_frame(message.message_type.clone());
        let ctx = HandlerContext::new(&message, frame, tx.clone());
        let timeout = message.timeout.or(self.default_processing_timeout);

        let intercepted = self
            .runtime
            .interceptor
            .invoke(&processor, body, ctx, cancel.child_token(), timeout)
            .await;

        let rollback_scheduled = tx.is_rollback_scheduled();
        let update = self.update_for(&message, prior_status, &intercepted.result, rollback_scheduled);

        let update_tx = self.runtime.transactions.begin();
        self.container
            .update(&message, update, trace, &update_tx)
            .await
            .map_err(RelayError::from)?;
        if rollback_scheduled {
            update_tx.schedule_rollback(Some("handler scheduled rollback".to_string()));
        }
        update_tx.complete().await.map_err(RelayError::from)?;

        Ok(HandleOutcome {
            update,
            reply: intercepted.reply,
        })
    }

    async fn resolve_body(
        &self,
        message: &QueuedMessage,
        trace: &TraceInfo,
        tx: &Arc<dyn TransactionController>,
    ) -> Result<serde_json::Value> {
        if message.has_self_content {
            return Ok(message.body.clone().unwrap_or(serde_json::Value::Null));
        }
        if !message.contains_content {
            return Ok(serde_json::Value::Null);
        }
        let provider = self.runtime.body_provider.as_ref().ok_or_else(|| {
            RelayError::InvariantViolation(format!(
                "message {} has a persisted body but no body provider is configured",
                message.message_id
            ))
        })?;
        provider
            .load_from_storage(message, trace, tx)
            .await
            .map_err(RelayError::from)?
            .ok_or_else(|| {
                RelayError::InvariantViolation(format!(
                    "persisted body missing for message {}",
                    message.message_id
                ))
            })
    }

    /// Translate a handler result into the metadata diff to persist.
    fn update_for(
        &self,
        message: &QueuedMessage,
        prior_status: MessageStatus,
        result: &MessageHandlerResult,
        rollback_scheduled: bool,
    ) -> MessageMetadataUpdate {
        let now = Utc::now();
        match result {
            MessageHandlerResult::Completed => MessageMetadataUpdate::completed(message),
            MessageHandlerResult::Deferred { delay } => MessageMetadataUpdate {
                status: MessageStatus::Deferred,
                retry_count: message.retry_count,
                delayed_to_utc: Some(
                    now + chrono::Duration::from_std(*delay)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                ),
                processed: false,
            },
            MessageHandlerResult::Retry { interval_override } => {
                let policy = message
                    .error_handling
                    .as_ref()
                    .or(self.error_handling.as_ref());
                let interval = (*interval_override)
                    .or_else(|| policy.and_then(|p| p.interval_for(message.retry_count)));
                match (policy, interval) {
                    (Some(policy), Some(interval)) if policy.can_retry(message.retry_count) => {
                        MessageMetadataUpdate {
                            status: MessageStatus::Deferred,
                            retry_count: message.retry_count + 1,
                            delayed_to_utc: Some(
                                now + chrono::Duration::from_std(interval)
                                    .unwrap_or_else(|_| chrono::Duration::zero()),
                            ),
                            processed: false,
                        }
                    }
                    _ => MessageMetadataUpdate {
                        status: MessageStatus::Suspended,
                        retry_count: message.retry_count,
                        delayed_to_utc: message.delayed_to_utc,
                        processed: false,
                    },
                }
            }
            MessageHandlerResult::Suspended => {
                MessageMetadataUpdate::with_status(message, MessageStatus::Suspended)
            }
            MessageHandlerResult::Aborted => {
                MessageMetadataUpdate::with_status(message, MessageStatus::Aborted)
            }
            MessageHandlerResult::Error(_) => {
                if rollback_scheduled {
                    // Unhandled failure: no retry logic, prior status kept
                    MessageMetadataUpdate {
                        status: prior_status,
                        retry_count: message.retry_count,
                        delayed_to_utc: message.delayed_to_utc,
                        processed: false,
                    }
                } else {
                    // Handler-reported error without rollback: park for an
                    // operator, suspending a FIFO queue via the head rule
                    MessageMetadataUpdate::with_status(message, MessageStatus::Suspended)
                }
            }
        }
    }

    /// Dispose the queue: cancel the dispatch task and fail every later
    /// operation with an invalid-state error.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.dispatch_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(queue = %self.name, "Queue disposed");
    }
}
