//! Broker consumer.
//!
//! This module contains:
//! - `ConsumeHandler`: callback receiving each inbound envelope
//! - `Client`: declares a queue's topology and runs its consumer workers
//! - Failure routing: retry queue until `max_retries`, then the error queue
//!
//! Every delivery is acknowledged after it was handled, whatever the
//! outcome; redelivery happens only through the retry queue.

mod topology;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerChannel, Delivery, DeliveryStream, DEFAULT_EXCHANGE};
use crate::bus::BusError;
use crate::config::{QueueOverrides, QueueSettings, TransportConfig};
use crate::message::{headers, Envelope, MessageKind};
use crate::utils::bootstrap::machine_name;
use crate::utils::retry::reconnect_backoff;

pub use topology::exchange_name;
use topology::Topology;

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl ConsumeOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Receives inbound envelopes from consumer workers.
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    async fn consume(&self, envelope: Envelope) -> ConsumeOutcome;
}

#[derive(Default)]
struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Consumes queues from a broker.
pub struct Client {
    broker: Arc<dyn Broker>,
    transport: Arc<TransportConfig>,
    machine: Arc<str>,
    workers: Mutex<Workers>,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>, transport: TransportConfig) -> Self {
        Self {
            broker,
            transport: Arc::new(transport),
            machine: Arc::from(machine_name()),
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Declare the queue's topology and start its consumer workers.
    ///
    /// Fails only when no channel can be opened within the connection retry
    /// policy; declaration failures are logged and skipped, and the steps
    /// after one run on a fresh channel.
    pub async fn start_consuming(
        &self,
        queue: &str,
        message_types: &[String],
        handler: Arc<dyn ConsumeHandler>,
        overrides: &QueueOverrides,
    ) -> Result<(), BusError> {
        let settings = QueueSettings::resolve(&self.transport.queue, overrides);
        let broker = self.broker.as_ref();
        let channel = self
            .transport
            .connection_retry
            .run("open channel", |_| broker.open_channel())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let topology = Topology::new(broker, channel, self.transport.connection_retry);
        topology.declare_work_queue(queue, &settings).await;
        topology.declare_retry(queue, &self.transport).await;
        topology.bind_message_types(queue, message_types).await;
        if !self.transport.disable_errors {
            topology.declare_sink(&self.transport.error_queue).await;
        }
        if self.transport.auditing_enabled {
            topology.declare_sink(&self.transport.audit_queue).await;
        }
        topology.close().await;

        let message_types = Arc::new(message_types.to_vec());
        let mut workers = self.workers.lock().await;
        let cancel = workers.cancel.clone();
        for index in 0..self.transport.consumer_count.max(1) {
            let worker = Worker {
                broker: self.broker.clone(),
                transport: self.transport.clone(),
                machine: self.machine.clone(),
                queue: queue.to_string(),
                message_types: message_types.clone(),
                handler: handler.clone(),
                tag: format!("{}-{}-{}", queue, self.machine, index),
            };
            workers.handles.push(tokio::spawn(worker.run(cancel.clone())));
        }

        info!(
            queue = %queue,
            consumers = self.transport.consumer_count,
            message_types = message_types.len(),
            "Started consuming"
        );
        Ok(())
    }

    /// Stop every worker and wait for in-flight deliveries to finish.
    pub async fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        workers.cancel.cancel();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Consumer worker ended abnormally");
            }
        }
        info!("Stopped consuming");
    }
}

/// One consumer with its own channel.
struct Worker {
    broker: Arc<dyn Broker>,
    transport: Arc<TransportConfig>,
    machine: Arc<str>,
    queue: String,
    message_types: Arc<Vec<String>>,
    handler: Arc<dyn ConsumeHandler>,
    tag: String,
}

impl Worker {
    async fn connect(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), BusError> {
        let topology = Topology::new(
            self.broker.as_ref(),
            self.broker.open_channel().await?,
            self.transport.connection_retry,
        );
        topology
            .bind_message_types(&self.queue, &self.message_types)
            .await;
        topology.close().await;

        let channel = self.broker.open_channel().await?;
        channel.set_prefetch(self.transport.prefetch_count).await?;
        let stream = channel.consume(&self.queue, &self.tag).await?;
        Ok((channel, stream))
    }

    /// Consume until cancelled, reconnecting with backoff when the delivery
    /// stream fails or ends.
    async fn run(self, cancel: CancellationToken) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        while !cancel.is_cancelled() {
            match self.connect().await {
                Ok((channel, mut stream)) => {
                    info!(queue = %self.queue, consumer = %self.tag, "Consumer connected");
                    backoff_iter = backoff_builder.build();

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                if let Err(e) = channel.close().await {
                                    debug!(error = %e, "Failed to close consumer channel");
                                }
                                return;
                            }
                            next = stream.next() => match next {
                                Some(Ok(delivery)) => self.handle(channel.as_ref(), delivery).await,
                                Some(Err(e)) => {
                                    error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                                    break;
                                }
                                None => {
                                    info!(queue = %self.queue, "Consumer stream ended, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        consumer = %self.tag,
                        error = %e,
                        "Failed to set up consumer, retrying after backoff"
                    );
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(consumer = %self.tag, "Consumer worker stopped");
    }

    async fn handle(&self, channel: &dyn BrokerChannel, delivery: Delivery) {
        let (mut envelope, acker) = delivery.into_parts();
        envelope
            .headers
            .insert(headers::TIME_RECEIVED, Utc::now().to_rfc3339());
        envelope
            .headers
            .insert(headers::DESTINATION_MACHINE, self.machine.as_ref());
        envelope
            .headers
            .insert(headers::DESTINATION_ADDRESS, self.queue.as_str());

        let outcome = self.handler.consume(envelope.clone()).await;
        if outcome.success {
            self.audit(channel, &envelope).await;
        } else {
            self.route_failure(channel, envelope, outcome.error).await;
        }

        if let Err(e) = acker.ack().await {
            error!(queue = %self.queue, error = %e, "Failed to ack message");
        }
    }

    async fn audit(&self, channel: &dyn BrokerChannel, envelope: &Envelope) {
        if !self.transport.auditing_enabled
            || self.transport.disable_errors
            || envelope.kind() == Some(MessageKind::ByteStream)
        {
            return;
        }
        if let Err(e) = channel
            .publish(&self.transport.audit_queue, "", envelope)
            .await
        {
            warn!(error = %e, "Failed to publish to audit queue");
        }
    }

    async fn route_failure(
        &self,
        channel: &dyn BrokerChannel,
        mut envelope: Envelope,
        failure: Option<String>,
    ) {
        let retry_count = envelope.headers.get_int(headers::RETRY_COUNT).unwrap_or(0);
        let message_id = envelope.headers.get_str(headers::MESSAGE_ID);

        if retry_count < i64::from(self.transport.max_retries) {
            envelope.headers.insert(headers::RETRY_COUNT, retry_count + 1);
            let retry_queue = TransportConfig::retry_queue(&self.queue);
            match channel.publish(DEFAULT_EXCHANGE, &retry_queue, &envelope).await {
                Ok(()) => debug!(
                    message_id = ?message_id,
                    retry_count = retry_count + 1,
                    "Message scheduled for retry"
                ),
                Err(e) => error!(
                    message_id = ?message_id,
                    error = %e,
                    "Failed to publish to retry queue, message lost"
                ),
            }
            return;
        }

        if self.transport.disable_errors {
            warn!(message_id = ?message_id, retry_count, "Retries exhausted, message dropped");
            return;
        }

        envelope.headers.insert(
            headers::EXCEPTION,
            failure.unwrap_or_else(|| "message processing failed".to_string()),
        );
        match channel
            .publish(&self.transport.error_queue, "", &envelope)
            .await
        {
            Ok(()) => warn!(
                message_id = ?message_id,
                retry_count,
                error_queue = %self.transport.error_queue,
                "Retries exhausted, message moved to error queue"
            ),
            Err(e) => error!(
                message_id = ?message_id,
                error = %e,
                "Failed to publish to error queue, message lost"
            ),
        }
    }
}

#[cfg(test)]
mod tests;
