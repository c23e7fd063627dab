//! Handler surface - the traits user code implements
//!
//! Payload types declare a stable `MESSAGE_TYPE` token used for handler
//! resolution (the type id does not survive the envelope, the token does).
//! Handlers receive a fresh context per invocation and report their
//! outcome through `MessageHandlerResult`; failures never escape the
//! pipeline.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use relay_common::HandlerResult;

use crate::context::HandlerContext;

/// A payload that can travel over the bus.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable registry token, e.g. "orders.create-order"
    const MESSAGE_TYPE: &'static str;
}

/// A command or query dispatched with `MessageBus::send`.
pub trait RequestMessage: BusMessage {}

/// A request expecting a typed reply, dispatched with
/// `MessageBus::send_with_response` on a push-synchronous queue.
pub trait RequestMessageWithResponse: RequestMessage {
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// A fan-out event dispatched with `MessageBus::publish`.
pub trait EventMessage: BusMessage {}

/// User handler for a message type.
#[async_trait]
pub trait MessageHandler<M: BusMessage>: Send + Sync {
    async fn handle(
        &self,
        message: M,
        ctx: &mut HandlerContext,
        cancel: CancellationToken,
    ) -> HandlerResult;
}

/// Reply returned by `send_with_response`.
#[derive(Debug, Clone)]
pub struct SendResponse<T> {
    pub message_id: uuid::Uuid,
    pub response: T,
}
