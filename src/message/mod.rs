//! Message model.
//!
//! This module contains:
//! - `Message` trait: identity, correlation and declared ancestor chain
//! - `Envelope`: body bytes plus mutable header map
//! - `MessageKind`: Send / Publish / ByteStream classification
//! - `MessageRegistry`: type binder resolving header type names
//! - Codec helpers for serde_json bodies

pub mod codec;
pub mod headers;
pub mod registry;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use headers::{HeaderValue, MessageHeaders};
pub use registry::{MessageRegistry, MessageTypeInfo};

/// Name of the implicit root of every message type chain.
pub const ROOT_MESSAGE_TYPE: &str = "conveyor.Message";

/// A domain message that can travel over the bus.
///
/// `TYPE_NAME` is the fully-qualified name used on the wire (`FullTypeName`
/// header) and to derive the publish exchange. `BASE_TYPES` lists the
/// ancestor types nearest-first, excluding the root message type; a body of
/// this type must deserialize as each of its ancestors.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { correlation_id: Uuid, order_id: String }
///
/// impl Message for OrderPlaced {
///     const TYPE_NAME: &'static str = "orders.OrderPlaced";
///     const BASE_TYPES: &'static [&'static str] = &["orders.OrderEvent"];
///     fn correlation_id(&self) -> Uuid { self.correlation_id }
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully-qualified type name.
    const TYPE_NAME: &'static str;

    /// Ancestor chain, nearest first.
    const BASE_TYPES: &'static [&'static str] = &[];

    /// Identifier joining this message to a process manager instance.
    fn correlation_id(&self) -> Uuid;
}

/// Short type name: the last segment of a dotted full name.
pub fn short_type_name(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}

/// How a message was put on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Point-to-point to one or more queues.
    Send,
    /// Fanout to every subscriber of the type's exchange.
    Publish,
    /// Raw packet of a chunked byte stream.
    ByteStream,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Publish => "Publish",
            Self::ByteStream => "ByteStream",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Send" => Some(Self::Send),
            "Publish" => Some(Self::Publish),
            "ByteStream" => Some(Self::ByteStream),
            _ => None,
        }
    }
}

/// Body bytes plus headers, as carried by the broker.
///
/// Filters and middleware may rewrite either part in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

impl Envelope {
    pub fn new(body: Vec<u8>, headers: MessageHeaders) -> Self {
        Self { body, headers }
    }

    /// Classification from the `MessageType` header.
    pub fn kind(&self) -> Option<MessageKind> {
        self.headers
            .get_str(headers::MESSAGE_TYPE)
            .and_then(|v| MessageKind::parse(&v))
    }

    /// Type name the sender stamped, preferring the full name.
    pub fn type_name(&self) -> Option<String> {
        self.headers
            .get_str(headers::FULL_TYPE_NAME)
            .or_else(|| self.headers.get_str(headers::TYPE_NAME))
    }
}

/// Callback message delivered to a process manager when a requested
/// timeout falls due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeoutMessage {
    pub correlation_id: Uuid,
}

impl Message for TimeoutMessage {
    const TYPE_NAME: &'static str = "conveyor.TimeoutMessage";

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}
