use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// Namespace for deriving deterministic queue ids from queue names.
pub const RELAY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8e, 0x41, 0xd2, 0x5b, 0x1f, 0x6a, 0x4c, 0x0e, 0x9d, 0x73, 0x52, 0xaa, 0x0b, 0xc4, 0x8f,
    0x21,
]);

/// Derive the stable queue id from a queue name.
///
/// Equal names always yield equal ids, so a queue keeps its identity across
/// restarts and across bus instances.
pub fn queue_id_for(queue_name: &str) -> Uuid {
    Uuid::new_v5(&RELAY_NAMESPACE, queue_name.as_bytes())
}

/// Lifecycle status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Created at publish time, not yet handed to a handler
    Created,
    /// Handed to a handler, outcome pending
    Delivered,
    /// Handler finished successfully; message leaves the queue on commit
    Completed,
    /// Terminal-until-resumed; blocks a FIFO queue when it is the head
    Suspended,
    /// Parked until `delayed_to_utc`
    Deferred,
    /// Abandoned; blocks a FIFO queue when it is the head
    Aborted,
}

impl MessageStatus {
    /// Statuses that suspend a FIFO queue when observed on the head message.
    pub fn blocks_fifo(&self) -> bool {
        matches!(self, MessageStatus::Suspended | MessageStatus::Aborted)
    }
}

/// The metadata envelope that flows through the bus.
///
/// The payload travels as an opaque JSON body; when a body provider is
/// configured and persistence is allowed, the body lives out-of-band keyed
/// by `message_id` and `has_self_content` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: Uuid,
    pub parent_message_id: Option<Uuid>,
    /// Correlation id shared by all messages of one logical session
    pub id_session: Option<Uuid>,
    pub publisher_id: String,
    pub publishing_time_utc: DateTime<Utc>,
    pub time_to_live_utc: Option<DateTime<Utc>>,
    pub delayed_to_utc: Option<DateTime<Utc>>,

    /// Registry token of the payload type, set at publish time
    pub message_type: String,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub is_compressed_content: bool,
    pub is_encrypted_content: bool,

    pub contains_content: bool,
    pub has_self_content: bool,
    pub disabled_message_persistence: bool,

    pub priority: i32,
    pub headers: IndexMap<String, String>,
    pub routing_key: Option<String>,

    /// Processing timeout for this message; falls back to the queue default
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    /// Per-message override of the queue's retry policy
    pub error_handling: Option<ErrorHandlingPolicy>,

    pub status: MessageStatus,
    pub processed: bool,

    pub source_exchange_name: String,
    pub queue_name: String,
    pub disable_fault_queue: bool,

    /// Inline payload; `None` when the body was persisted out-of-band
    pub body: Option<serde_json::Value>,
}

impl QueuedMessage {
    /// Whether the message has outlived its time-to-live at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.time_to_live_utc.map(|ttl| ttl < now).unwrap_or(false)
    }

    /// Whether the message may be delivered at `now` (delay elapsed).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.delayed_to_utc.map(|d| d <= now).unwrap_or(true)
    }

    /// Apply a post-handler metadata diff in place.
    pub fn apply_update(&mut self, update: &MessageMetadataUpdate) {
        self.status = update.status;
        self.retry_count = update.retry_count;
        self.delayed_to_utc = update.delayed_to_utc;
        self.processed = update.processed;
    }
}

/// Diff applied to a queued message after a handler attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadataUpdate {
    pub status: MessageStatus,
    pub retry_count: u32,
    pub delayed_to_utc: Option<DateTime<Utc>>,
    pub processed: bool,
}

impl MessageMetadataUpdate {
    /// Update describing a successfully handled message.
    pub fn completed(msg: &QueuedMessage) -> Self {
        Self {
            status: MessageStatus::Completed,
            retry_count: msg.retry_count,
            delayed_to_utc: None,
            processed: true,
        }
    }

    /// Update carrying a non-completed status verbatim.
    pub fn with_status(msg: &QueuedMessage, status: MessageStatus) -> Self {
        Self {
            status,
            retry_count: msg.retry_count,
            delayed_to_utc: msg.delayed_to_utc,
            processed: false,
        }
    }
}

// ============================================================================
// Publish Options
// ============================================================================

/// Per-publish options recognized by `MessageBus::send` / `publish`.
#[derive(Debug, Clone)]
pub struct MessageOptions {
    pub exchange_name: String,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub disabled_message_persistence: bool,
    pub id_session: Option<Uuid>,
    pub routing_key: Option<String>,
    /// `false` selects push-synchronous delivery inside the caller's transaction
    pub is_asynchronous_invocation: bool,
    pub error_handling: Option<ErrorHandlingPolicy>,
    pub headers: IndexMap<String, String>,
    pub timeout: Option<Duration>,
    pub is_compress_content: bool,
    pub is_encrypt_content: bool,
    pub priority: i32,
    pub disable_fault_queue: bool,
    /// Surface an error when routing resolves to zero queues
    pub throw_no_handler_exception: bool,
    pub time_to_live: Option<Duration>,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            exchange_name: String::new(),
            content_type: "application/json".to_string(),
            content_encoding: None,
            disabled_message_persistence: false,
            id_session: None,
            routing_key: None,
            is_asynchronous_invocation: true,
            error_handling: None,
            headers: IndexMap::new(),
            timeout: None,
            is_compress_content: false,
            is_encrypt_content: false,
            priority: 0,
            disable_fault_queue: false,
            throw_no_handler_exception: false,
            time_to_live: None,
        }
    }
}

impl MessageOptions {
    pub fn to_exchange(exchange_name: &str) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_string());
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.is_asynchronous_invocation = false;
        self
    }
}

// ============================================================================
// Queue Descriptors
// ============================================================================

/// Ordering policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueType {
    /// Strict enqueue order; a delayed or suspended head blocks the queue
    SequentialFifo,
    /// Enqueue order among eligible messages; delayed messages are skipped
    SequentialDelayable,
}

/// Lifecycle status of a queue.
///
/// Transitions are monotone: Running may move to Suspended or Terminated,
/// Suspended may resume to Running or terminate, Terminated sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Running,
    Suspended,
    Terminated,
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry policy consulted when a handler asks for a retry.
///
/// The interval ladder is indexed by the current retry count; past the end
/// the last entry repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    pub max_retries: u32,
    pub retry_intervals: Vec<Duration>,
}

impl ErrorHandlingPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            retry_intervals: vec![interval],
        }
    }

    /// Whether another retry is allowed at the given retry count.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt, `None` when no interval is configured.
    pub fn interval_for(&self, retry_count: u32) -> Option<Duration> {
        self.retry_intervals
            .get(retry_count as usize)
            .or_else(|| self.retry_intervals.last())
            .copied()
    }
}

// ============================================================================
// Handler Results
// ============================================================================

/// Outcome of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageHandlerResult {
    /// Message handled; remove from the queue on commit
    Completed,
    /// Park the message and redeliver after `delay`
    Deferred { delay: Duration },
    /// Ask the queue to consult its retry policy
    Retry {
        interval_override: Option<Duration>,
    },
    Suspended,
    Aborted,
    /// Handler-reported error; the queue applies no retry logic
    Error(ErrorResult),
}

impl MessageHandlerResult {
    pub fn completed() -> Self {
        MessageHandlerResult::Completed
    }

    pub fn deferred(delay: Duration) -> Self {
        MessageHandlerResult::Deferred { delay }
    }

    pub fn retry() -> Self {
        MessageHandlerResult::Retry {
            interval_override: None,
        }
    }

    pub fn retry_after(interval: Duration) -> Self {
        MessageHandlerResult::Retry {
            interval_override: Some(interval),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        MessageHandlerResult::Error(ErrorResult {
            client_message: None,
            id_command_query: None,
            detail: detail.into(),
            has_transaction_rollback_error: false,
        })
    }
}

/// Error payload carried by `MessageHandlerResult::Error`.
///
/// `client_message` is the public-facing text; `detail` is diagnostic and
/// never shown to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResult {
    pub client_message: Option<String>,
    pub id_command_query: Option<Uuid>,
    pub detail: String,
    pub has_transaction_rollback_error: bool,
}

impl ErrorResult {
    pub fn with_rollback(mut self) -> Self {
        self.has_transaction_rollback_error = true;
        self
    }
}

/// Failure escaping a handler body (the Rust analogue of a thrown exception).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What a handler returns; `Err` is treated as an unhandled handler failure
/// by the interceptor and never propagates further.
pub type HandlerResult = std::result::Result<MessageHandlerResult, HandlerFailure>;

// ============================================================================
// Trace Info
// ============================================================================

/// Structured correlation token carrying call-site and causal parent ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceInfo {
    /// Correlation root shared by every frame of one logical flow
    pub trace_id: Uuid,
    /// This call frame
    pub frame_id: Uuid,
    pub parent_frame_id: Option<Uuid>,
    /// Call-site label, e.g. "MessageBus::send"
    pub source: String,
}

impl TraceInfo {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            frame_id: Uuid::new_v4(),
            parent_frame_id: None,
            source: source.into(),
        }
    }

    /// Derive a child frame for a nested operation.
    pub fn child_frame(&self, source: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            frame_id: Uuid::new_v4(),
            parent_frame_id: Some(self.frame_id),
            source: source.into(),
        }
    }

    /// Tracing span carrying this frame's correlation fields; every log
    /// record inside the span inherits them.
    pub fn span(&self, operation: &str) -> tracing::Span {
        tracing::info_span!(
            "relay",
            operation = %operation,
            trace_id = %self.trace_id,
            frame_id = %self.frame_id,
            source = %self.source,
        )
    }
}

// ============================================================================
// Queue Events
// ============================================================================

/// Which queue operation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEventKind {
    Enqueue,
    Peek,
    Remove,
    OnMessage,
}

/// Diagnostic event emitted by every queue operation.
///
/// Best-effort: sinks must never influence the message outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub queue_name: String,
    pub kind: QueueEventKind,
    pub message_id: Option<Uuid>,
    pub status: Option<MessageStatus>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(queue_name: &str, kind: QueueEventKind, message_id: Option<Uuid>) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            kind,
            message_id,
            status: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Sink receiving queue events.
pub trait QueueEventSink: Send + Sync {
    fn publish(&self, event: QueueEvent);
}

/// Sink that logs events through `tracing`.
pub struct TracingEventSink;

impl QueueEventSink for TracingEventSink {
    fn publish(&self, event: QueueEvent) {
        if event.error.is_some() {
            tracing::warn!(
                queue = %event.queue_name,
                kind = ?event.kind,
                message_id = ?event.message_id,
                error = ?event.error,
                "Queue error event"
            );
        } else {
            tracing::debug!(
                queue = %event.queue_name,
                kind = ?event.kind,
                message_id = ?event.message_id,
                status = ?event.status,
                "Queue event"
            );
        }
    }
}

/// Sink fanning events out over a broadcast channel so observers can
/// subscribe without back-pressuring the queue.
pub struct BroadcastEventSink {
    tx: tokio::sync::broadcast::Sender<QueueEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

impl QueueEventSink for BroadcastEventSink {
    fn publish(&self, event: QueueEvent) {
        // No receivers is fine; events are diagnostic
        let _ = self.tx.send(event);
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Fault routing error: {0}")]
    FaultRouting(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
