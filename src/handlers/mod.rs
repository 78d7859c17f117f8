//! Message handlers.
//!
//! This module contains:
//! - `MessageHandler<M>`: application handler for one message type
//! - `ConsumeContext`: inbound headers plus reply/send/publish
//! - `HandlerReference`: handler identity, message type and routing-key filter
//! - `MessageHandlerProcessor`: typed dispatch table with base-type fan-out
//! - Byte stream handlers, reader and writer

mod dispatcher;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::bus::BusError;
use crate::message::{headers, Message, MessageHeaders, MessageKind};
use crate::pipeline::{MessageSink, OutgoingMessage};

pub use dispatcher::MessageHandlerProcessor;
pub use stream::{ByteStreamReader, ByteStreamWriter, StreamHandler, StreamProcessor};

/// Error returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Routing key matching any key.
pub const ANY_ROUTING_KEY: &str = "#";

/// Handler for messages of type `M`.
///
/// Registered handlers are also invoked for messages *derived* from `M`
/// when those arrive via `send`.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn execute(&self, message: &M, context: &ConsumeContext) -> Result<(), HandlerError>;
}

/// Binds a handler implementation to the message type it handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReference {
    pub handler_type: &'static str,
    pub message_type: String,
    /// `None` accepts every routing key.
    pub routing_keys: Option<Vec<String>>,
}

impl HandlerReference {
    /// Whether a message carrying `routing_key` should reach this handler.
    pub fn accepts(&self, routing_key: Option<&str>) -> bool {
        match &self.routing_keys {
            None => true,
            Some(keys) if keys.is_empty() => true,
            Some(keys) => keys
                .iter()
                .any(|k| k == ANY_ROUTING_KEY || Some(k.as_str()) == routing_key),
        }
    }
}

/// Per-delivery context handed to handlers and process managers.
#[derive(Clone)]
pub struct ConsumeContext {
    headers: Arc<MessageHeaders>,
    sink: Option<Arc<dyn MessageSink>>,
}

impl std::fmt::Debug for ConsumeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("headers", &self.headers)
            .field("connected", &self.sink.is_some())
            .finish()
    }
}

impl ConsumeContext {
    /// Context with no outbound path; `reply`/`send`/`publish` fail.
    pub fn new(headers: MessageHeaders) -> Self {
        Self {
            headers: Arc::new(headers),
            sink: None,
        }
    }

    pub fn with_sink(headers: MessageHeaders, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            headers: Arc::new(headers),
            sink: Some(sink),
        }
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.headers.get_uuid(headers::MESSAGE_ID)
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.headers
            .get_str(headers::MESSAGE_TYPE)
            .and_then(|v| MessageKind::parse(&v))
    }

    pub fn routing_key(&self) -> Option<String> {
        self.headers.get_str(headers::ROUTING_KEY)
    }

    pub fn source_address(&self) -> Option<String> {
        self.headers.get_str(headers::SOURCE_ADDRESS)
    }

    fn sink(&self) -> Result<&Arc<dyn MessageSink>, BusError> {
        self.sink
            .as_ref()
            .ok_or_else(|| BusError::Configuration("consume context has no outbound path".into()))
    }

    /// Reply to the sender of the current message.
    ///
    /// The reply is sent to `SourceAddress` and carries the request's
    /// `RequestMessageId` as its `ResponseMessageId`.
    pub async fn reply<R: Message>(&self, reply: &R) -> Result<(), BusError> {
        let destination = self
            .source_address()
            .ok_or_else(|| BusError::NoDestination(R::TYPE_NAME.to_string()))?;
        let mut outgoing = OutgoingMessage::new(MessageKind::Send, reply)?.to([destination]);
        if let Some(request_id) = self.headers.get_str(headers::REQUEST_MESSAGE_ID) {
            outgoing
                .headers
                .insert(headers::RESPONSE_MESSAGE_ID, request_id);
        }
        self.sink()?.dispatch(outgoing).await
    }

    /// Send to the queues mapped for `M`.
    pub async fn send<M: Message>(&self, message: &M) -> Result<(), BusError> {
        self.sink()?
            .dispatch(OutgoingMessage::new(MessageKind::Send, message)?)
            .await
    }

    pub async fn send_to<M: Message>(&self, endpoint: &str, message: &M) -> Result<(), BusError> {
        self.sink()?
            .dispatch(OutgoingMessage::new(MessageKind::Send, message)?.to([endpoint]))
            .await
    }

    pub async fn publish<M: Message>(&self, message: &M) -> Result<(), BusError> {
        self.sink()?
            .dispatch(OutgoingMessage::new(MessageKind::Publish, message)?)
            .await
    }
}
