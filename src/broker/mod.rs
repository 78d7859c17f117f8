//! Broker abstraction.
//!
//! This module contains:
//! - `Broker` trait: opens channels against a broker connection
//! - `BrokerChannel` trait: exchange/queue/binding primitives, publish, consume
//! - `Delivery`: an inbound envelope plus its acknowledgement handle
//! - Implementations: in-memory, AMQP (RabbitMQ)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::message::Envelope;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

/// Name of the broker's default (direct-to-queue) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Transport-level failures. All of these are treated as transient.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Ack failed: {0}")]
    Ack(String),
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Per-message time to live (`x-message-ttl`).
    pub message_ttl: Option<Duration>,
    /// Exchange that receives expired messages (`x-dead-letter-exchange`).
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }
}

/// Acknowledgement handle for a delivery.
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// Ack handle for transports without acknowledgement.
pub struct NoopAck;

#[async_trait]
impl DeliveryAck for NoopAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// An inbound message.
pub struct Delivery {
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    acker: Box<dyn DeliveryAck>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        acker: Box<dyn DeliveryAck>,
    ) -> Self {
        Self {
            envelope,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            acker,
        }
    }

    /// Split into the envelope and its ack handle.
    pub fn into_parts(self) -> (Envelope, Box<dyn DeliveryAck>) {
        (self.envelope, self.acker)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A single channel on a broker connection.
///
/// Channels are not shared between consumer workers; the producer guards
/// its one channel with a mutex.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish an envelope. An empty exchange name routes directly to the
    /// queue named by `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()>;

    /// Limit unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn purge_queue(&self, queue: &str) -> Result<()>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Connection-level broker capability.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh channel, reconnecting if the underlying connection died.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Short identifier stamped into the `ConsumerType` header.
    fn kind(&self) -> &'static str;
}
