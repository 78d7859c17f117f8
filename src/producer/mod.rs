//! Outbound message producer.
//!
//! Every publish and send goes through one broker channel guarded by a
//! single mutex, so concurrent callers queue rather than run in parallel.
//! A failed attempt drops the channel; the next attempt opens a fresh one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerChannel, BrokerError, ExchangeKind, DEFAULT_EXCHANGE};
use crate::bus::BusError;
use crate::client::exchange_name;
use crate::config::BusConfig;
use crate::message::{headers, short_type_name, Envelope, MessageHeaders, MessageKind};
use crate::utils::bootstrap::machine_name;
use crate::utils::retry::RetryPolicy;

#[derive(Default)]
struct ProducerChannel {
    channel: Option<Arc<dyn BrokerChannel>>,
    declared_exchanges: HashSet<String>,
}

impl ProducerChannel {
    fn reset(&mut self) {
        self.channel = None;
        self.declared_exchanges.clear();
    }

    async fn transmit(
        &mut self,
        broker: &dyn Broker,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => {
                let channel = broker.open_channel().await?;
                self.channel = Some(channel.clone());
                channel
            }
        };

        if exchange != DEFAULT_EXCHANGE && !self.declared_exchanges.contains(exchange) {
            channel
                .declare_exchange(exchange, ExchangeKind::Fanout, true)
                .await?;
            self.declared_exchanges.insert(exchange.to_string());
        }

        channel.publish(exchange, routing_key, envelope).await
    }
}

/// Serializes outbound traffic onto the broker.
pub struct Producer {
    broker: Arc<dyn Broker>,
    state: Mutex<ProducerChannel>,
    source_address: String,
    machine: String,
    retry: RetryPolicy,
    queue_mappings: HashMap<String, Vec<String>>,
    max_message_size: usize,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, config: &BusConfig) -> Self {
        let mut queue_mappings: HashMap<String, Vec<String>> = HashMap::new();
        for mapping in &config.queue_mappings {
            queue_mappings
                .entry(mapping.message_type.clone())
                .or_default()
                .extend(mapping.queues.iter().cloned());
        }
        Self {
            broker,
            state: Mutex::new(ProducerChannel::default()),
            source_address: config.transport.queue_name.clone(),
            machine: machine_name(),
            retry: config.transport.publish_retry,
            queue_mappings,
            max_message_size: config.limits.max_message_size,
        }
    }

    /// Largest byte stream packet body.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Queues a `send` without explicit endpoints goes to.
    pub fn destinations_for(&self, type_name: &str) -> &[String] {
        self.queue_mappings
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn stamp(&self, kind: MessageKind, type_name: &str, map: &mut MessageHeaders) {
        map.insert(headers::SOURCE_ADDRESS, self.source_address.as_str());
        map.insert(headers::TIME_SENT, Utc::now().to_rfc3339());
        map.insert(headers::SOURCE_MACHINE, self.machine.as_str());
        map.insert(headers::TYPE_NAME, short_type_name(type_name));
        map.insert(headers::FULL_TYPE_NAME, type_name);
        map.insert(headers::CONSUMER_TYPE, self.broker.kind());
        map.insert_if_absent(headers::MESSAGE_ID, Uuid::new_v4().to_string());
        map.insert(headers::MESSAGE_TYPE, kind.as_str());
    }

    /// Publish to the fanout exchange of `type_name`.
    pub async fn publish(
        &self,
        type_name: &str,
        body: Vec<u8>,
        mut map: MessageHeaders,
        routing_key: Option<&str>,
    ) -> Result<(), BusError> {
        self.stamp(MessageKind::Publish, type_name, &mut map);
        if let Some(key) = routing_key {
            map.insert(headers::ROUTING_KEY, key);
        }
        let envelope = Envelope::new(body, map);
        let exchange = exchange_name(type_name);
        self.transmit(&exchange, routing_key.unwrap_or(""), &envelope)
            .await
    }

    /// Send to every queue mapped for `type_name`.
    pub async fn send(
        &self,
        type_name: &str,
        body: Vec<u8>,
        map: MessageHeaders,
    ) -> Result<(), BusError> {
        let endpoints = self.destinations_for(type_name).to_vec();
        if endpoints.is_empty() {
            return Err(BusError::NoDestination(type_name.to_string()));
        }
        self.send_to(&endpoints, type_name, body, map).await
    }

    /// Send to explicit queues. Every copy carries the same `MessageId`.
    pub async fn send_to(
        &self,
        endpoints: &[String],
        type_name: &str,
        body: Vec<u8>,
        mut map: MessageHeaders,
    ) -> Result<(), BusError> {
        if endpoints.is_empty() {
            return Err(BusError::NoDestination(type_name.to_string()));
        }
        self.stamp(MessageKind::Send, type_name, &mut map);
        let envelope = Envelope::new(body, map);
        for endpoint in endpoints {
            self.transmit(DEFAULT_EXCHANGE, endpoint, &envelope).await?;
        }
        Ok(())
    }

    /// Send one byte stream packet.
    pub async fn send_bytes(
        &self,
        endpoint: &str,
        type_name: &str,
        body: Vec<u8>,
        mut map: MessageHeaders,
    ) -> Result<(), BusError> {
        self.stamp(MessageKind::ByteStream, type_name, &mut map);
        let envelope = Envelope::new(body, map);
        self.transmit(DEFAULT_EXCHANGE, endpoint, &envelope).await
    }

    async fn transmit(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match state
                .transmit(self.broker.as_ref(), exchange, routing_key, envelope)
                .await
            {
                Ok(()) => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        message_id = ?envelope.headers.get_str(headers::MESSAGE_ID),
                        "Message transmitted"
                    );
                    return Ok(());
                }
                Err(e) => {
                    state.reset();
                    if attempt >= max_attempts {
                        error!(
                            exchange = %exchange,
                            routing_key = %routing_key,
                            attempts = attempt,
                            error = %e,
                            "Transmit failed, retries exhausted"
                        );
                        return Err(e.into());
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transmit failed, reconnecting in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close the producer channel.
    pub async fn close(&self) {
        let channel = self.state.lock().await.channel.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close producer channel");
            }
        }
    }
}
