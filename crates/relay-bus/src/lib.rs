//! Relay message bus runtime
//!
//! The in-process enterprise service bus: exchange-routed, transaction-
//! aware message queues with push/pull dispatch, a handler registry keyed
//! by message type token, and an interceptor pipeline around every
//! handler invocation.

pub mod bus;
pub mod context;
pub mod handler;
pub mod interceptor;
pub mod queue;
pub mod registry;

pub use bus::MessageBus;
pub use context::{HandlerContext, QueueRuntimeContext};
pub use handler::{
    BusMessage, EventMessage, MessageHandler, RequestMessage, RequestMessageWithResponse,
    SendResponse,
};
pub use interceptor::{HandlerInterceptor, InterceptedOutcome};
pub use queue::{MessageQueue, SyncDispatch};
pub use registry::{HandlerRegistry, MessageProcessor, ProcessorError};

pub use relay_common::{
    ErrorHandlingPolicy, ErrorResult, HandlerFailure, HandlerResult, MessageHandlerResult,
    MessageOptions, MessageStatus, QueueEvent, QueueEventKind, QueueEventSink, QueueStatus,
    QueueType, QueuedMessage, RelayError, Result, TraceInfo,
};
