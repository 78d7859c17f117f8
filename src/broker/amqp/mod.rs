//! AMQP (RabbitMQ) broker implementation.
//!
//! Connections come from a `deadpool-lapin` pool; every `open_channel`
//! call creates a new channel on a pooled connection, so a dead connection
//! is replaced transparently on the next open.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use tracing::{debug, info};

use super::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryAck, DeliveryStream, ExchangeKind,
    QueueOptions, Result,
};
use crate::message::{Envelope, HeaderValue, MessageHeaders};

/// Maximum pooled connections.
const POOL_SIZE: usize = 10;

/// RabbitMQ broker.
pub struct AmqpBroker {
    pool: Pool,
    url: String,
}

impl AmqpBroker {
    /// Create the pool and verify one connection can be established.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let manager = Manager::new(url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        pool.get()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %url, "Connected to AMQP");
        Ok(Self { pool, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn kind(&self) -> &'static str {
        "RabbitMQ"
    }
}

/// Channel onto a RabbitMQ connection.
pub struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

/// Encode headers: strings as byte arrays, integers as 32-bit where they fit.
pub fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        let value = match value {
            HeaderValue::Bytes(bytes) => AMQPValue::LongString(LongString::from(bytes.clone())),
            HeaderValue::Int(i) => match i32::try_from(*i) {
                Ok(n) => AMQPValue::LongInt(n),
                Err(_) => AMQPValue::LongLongInt(*i),
            },
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

/// Decode headers. Values of unsupported AMQP types are dropped.
pub fn from_field_table(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => HeaderValue::Bytes(s.as_bytes().to_vec()),
                AMQPValue::ShortString(s) => HeaderValue::Bytes(s.as_str().as_bytes().to_vec()),
                AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
                AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
                AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = options.message_ttl {
        let ms = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(ms));
    }
    if let Some(dlx) = &options.dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from(dlx.as_bytes().to_vec())),
        );
    }
    args
}

struct AmqpAck {
    acker: Acker,
}

#[async_trait]
impl DeliveryAck for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("exchange '{}': {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare(format!("queue '{}': {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("bind '{}' -> '{}': {}", queue, exchange, e)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(to_field_table(&envelope.headers));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published envelope");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|delivery| {
            let delivery = delivery.map_err(|e| BrokerError::Consume(e.to_string()))?;
            let headers = delivery
                .properties
                .headers()
                .as_ref()
                .map(from_field_table)
                .unwrap_or_default();
            Ok(Delivery::new(
                Envelope::new(delivery.data, headers),
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                Box::new(AmqpAck {
                    acker: delivery.acker,
                }),
            ))
        });
        Ok(Box::pin(stream))
    }

    async fn purge_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(format!("Failed to purge '{}': {}", queue, e)))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(format!("Failed to delete '{}': {}", queue, e)))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }
}
