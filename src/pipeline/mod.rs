//! Filters and middleware chains.
//!
//! This module contains:
//! - `Filter`: sequential envelope filters (before-consuming,
//!   after-consuming, outgoing); returning `false` stops the chain
//! - `ProcessMessageMiddleware` / `ProcessNext`: inbound chain wrapping
//!   dispatch
//! - `SendMessageMiddleware` / `SendNext`: outbound chain wrapping the
//!   producer
//! - `OutgoingMessage`: a serialized message on its way out

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::BusError;
use crate::handlers::{ConsumeContext, HandlerError};
use crate::message::{codec, Envelope, Message, MessageHeaders, MessageKind};

/// Envelope filter. May rewrite body and headers in place.
pub trait Filter: Send + Sync {
    /// Return `false` to stop processing.
    fn process(&self, envelope: &mut Envelope) -> bool;
}

impl<F> Filter for F
where
    F: Fn(&mut Envelope) -> bool + Send + Sync,
{
    fn process(&self, envelope: &mut Envelope) -> bool {
        self(envelope)
    }
}

/// Run filters in order. Returns `false` as soon as one does.
pub fn run_filters(filters: &[Arc<dyn Filter>], envelope: &mut Envelope) -> bool {
    filters.iter().all(|f| f.process(envelope))
}

/// Core inbound dispatch at the end of the process-message chain.
#[async_trait]
pub trait MessageDispatch: Send + Sync {
    async fn dispatch(&self, envelope: &Envelope, context: &ConsumeContext)
        -> Result<(), HandlerError>;
}

/// Inbound middleware. Not calling `next` skips all downstream processing.
#[async_trait]
pub trait ProcessMessageMiddleware: Send + Sync {
    async fn process(
        &self,
        envelope: &mut Envelope,
        context: &ConsumeContext,
        next: ProcessNext<'_>,
    ) -> Result<(), HandlerError>;
}

/// Remainder of the inbound chain.
pub struct ProcessNext<'a> {
    chain: &'a [Arc<dyn ProcessMessageMiddleware>],
    terminal: &'a dyn MessageDispatch,
}

impl<'a> ProcessNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn ProcessMessageMiddleware>],
        terminal: &'a dyn MessageDispatch,
    ) -> Self {
        Self { chain, terminal }
    }

    pub async fn run(
        self,
        envelope: &mut Envelope,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.process(envelope, context, ProcessNext::new(rest, self.terminal))
                    .await
            }
            None => self.terminal.dispatch(envelope, context).await,
        }
    }
}

/// A serialized message on its way to the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    /// Fully-qualified message type name.
    pub type_name: String,
    /// Explicit destination queues. Empty sends use the configured mapping.
    pub destinations: Vec<String>,
    pub routing_key: Option<String>,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

impl OutgoingMessage {
    pub fn new<M: Message>(kind: MessageKind, message: &M) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            type_name: M::TYPE_NAME.to_string(),
            destinations: Vec::new(),
            routing_key: None,
            body: codec::serialize(message)?,
            headers: MessageHeaders::new(),
        })
    }

    pub fn to<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations = destinations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_headers(mut self, headers: &MessageHeaders) -> Self {
        self.headers.merge(headers);
        self
    }

    pub fn with_routing_key(mut self, routing_key: Option<String>) -> Self {
        self.routing_key = routing_key;
        self
    }

    /// Apply outgoing filters to body and headers. Returns `false` if a
    /// filter dropped the message.
    pub fn apply_filters(&mut self, filters: &[Arc<dyn Filter>]) -> bool {
        if filters.is_empty() {
            return true;
        }
        let mut envelope = Envelope::new(
            std::mem::take(&mut self.body),
            std::mem::take(&mut self.headers),
        );
        let keep = run_filters(filters, &mut envelope);
        self.body = envelope.body;
        self.headers = envelope.headers;
        keep
    }
}

/// Entry point of the outbound path used by contexts and the bus.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn dispatch(&self, message: OutgoingMessage) -> Result<(), BusError>;
}

/// Core outbound transmission at the end of the send chain.
#[async_trait]
pub trait Transmit: Send + Sync {
    async fn transmit(&self, message: &OutgoingMessage) -> Result<(), BusError>;
}

/// Outbound middleware. Not calling `next` drops the message.
#[async_trait]
pub trait SendMessageMiddleware: Send + Sync {
    async fn process(
        &self,
        message: &mut OutgoingMessage,
        next: SendNext<'_>,
    ) -> Result<(), BusError>;
}

/// Remainder of the outbound chain.
pub struct SendNext<'a> {
    chain: &'a [Arc<dyn SendMessageMiddleware>],
    terminal: &'a dyn Transmit,
}

impl<'a> SendNext<'a> {
    pub fn new(chain: &'a [Arc<dyn SendMessageMiddleware>], terminal: &'a dyn Transmit) -> Self {
        Self { chain, terminal }
    }

    pub async fn run(self, message: &mut OutgoingMessage) -> Result<(), BusError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.process(message, SendNext::new(rest, self.terminal)).await,
            None => self.terminal.transmit(message).await,
        }
    }
}
