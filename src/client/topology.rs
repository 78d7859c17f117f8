//! Broker topology owned by a consuming queue.
//!
//! For a work queue `q` the client declares:
//! - `q` itself, with the resolved queue settings
//! - `q.Retries`, holding failed messages for the retry delay, dead-lettered
//!   through the fanout exchange `q.Retries.DeadLetter` back onto `q`
//! - the error exchange and queue, and the audit exchange and queue when
//!   auditing is on
//! - one fanout exchange per consumed message type, bound to `q`

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerChannel, BrokerError, ExchangeKind, QueueOptions};
use crate::config::{QueueSettings, TransportConfig};
use crate::utils::retry::RetryPolicy;

/// Publish exchange for a message type: its full name without separators.
pub fn exchange_name(type_name: &str) -> String {
    type_name.replace("::", "").replace('.', "")
}

/// Declaration steps against a broker. Each step is retried; a step that
/// still fails is logged and skipped.
///
/// A failed declaration may close the channel it ran on (AMQP channel
/// exceptions do), so the channel is dropped after any failure and the next
/// attempt or step opens a fresh one.
pub(crate) struct Topology<'a> {
    broker: &'a dyn Broker,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    retry: RetryPolicy,
}

impl<'a> Topology<'a> {
    pub(crate) fn new(
        broker: &'a dyn Broker,
        channel: Arc<dyn BrokerChannel>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            channel: Mutex::new(Some(channel)),
            retry,
        }
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut current = self.channel.lock().await;
        if let Some(channel) = current.as_ref() {
            return Ok(channel.clone());
        }
        let channel = self.broker.open_channel().await?;
        *current = Some(channel.clone());
        Ok(channel)
    }

    async fn discard_channel(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close broken topology channel");
            }
        }
    }

    async fn step<F, Fut>(&self, what: &str, op: F) -> bool
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let op = &op;
        let attempt = move |_attempt: u32| async move {
            let channel = self.channel().await?;
            let result = op(channel).await;
            if result.is_err() {
                self.discard_channel().await;
            }
            result
        };
        match self.retry.run(what, attempt).await {
            Ok(()) => true,
            Err(e) => {
                warn!(step = %what, error = %e, "Topology declaration failed, continuing");
                false
            }
        }
    }

    /// Close the channel the steps ran on.
    pub(crate) async fn close(self) {
        if let Some(channel) = self.channel.into_inner() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close topology channel");
            }
        }
    }

    pub(crate) async fn declare_work_queue(&self, queue: &str, settings: &QueueSettings) {
        let options = &QueueOptions {
            durable: settings.durable,
            exclusive: settings.exclusive,
            auto_delete: settings.auto_delete,
            ..Default::default()
        };
        self.step("declare work queue", |channel| async move {
            channel.declare_queue(queue, options).await
        })
        .await;

        if settings.purge_on_startup {
            self.step("purge work queue", |channel| async move {
                channel.purge_queue(queue).await
            })
            .await;
        }
    }

    pub(crate) async fn declare_retry(&self, queue: &str, transport: &TransportConfig) {
        let dead_letter = TransportConfig::retry_dead_letter_exchange(queue);
        let retry_queue = TransportConfig::retry_queue(queue);
        let options = &QueueOptions {
            durable: true,
            message_ttl: Some(transport.retry_delay()),
            dead_letter_exchange: Some(dead_letter.clone()),
            ..Default::default()
        };
        let (exchange, retries) = (dead_letter.as_str(), retry_queue.as_str());

        self.step("declare retry dead-letter exchange", |channel| async move {
            channel
                .declare_exchange(exchange, ExchangeKind::Fanout, true)
                .await
        })
        .await;
        self.step("bind work queue to dead-letter exchange", |channel| async move {
            channel.bind_queue(queue, exchange, "").await
        })
        .await;
        self.step("declare retry queue", |channel| async move {
            channel.declare_queue(retries, options).await
        })
        .await;
        debug!(queue = %queue, retry_queue = %retry_queue, "Declared retry topology");
    }

    /// Fanout exchange and durable queue of the same name.
    pub(crate) async fn declare_sink(&self, name: &str) {
        let options = &QueueOptions::durable();
        self.step("declare sink exchange", |channel| async move {
            channel.declare_exchange(name, ExchangeKind::Fanout, true).await
        })
        .await;
        self.step("declare sink queue", |channel| async move {
            channel.declare_queue(name, options).await
        })
        .await;
        self.step("bind sink queue", |channel| async move {
            channel.bind_queue(name, name, "").await
        })
        .await;
    }

    /// Bind `queue` to the publish exchange of every message type.
    pub(crate) async fn bind_message_types(&self, queue: &str, message_types: &[String]) {
        for message_type in message_types {
            let exchange = exchange_name(message_type);
            let exchange = exchange.as_str();
            let declared = self
                .step("declare message type exchange", |channel| async move {
                    channel
                        .declare_exchange(exchange, ExchangeKind::Fanout, true)
                        .await
                })
                .await;
            if declared {
                self.step("bind message type exchange", |channel| async move {
                    channel.bind_queue(queue, exchange, "").await
                })
                .await;
            }
        }
    }
}
