//! Outbound path: outgoing filters, send middleware, then the producer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::BusError;
use crate::handlers::HandlerError;
use crate::message::{headers, MessageKind, TimeoutMessage};
use crate::pipeline::{Filter, MessageSink, OutgoingMessage, SendMessageMiddleware, SendNext, Transmit};
use crate::process_manager::TimeoutDispatcher;
use crate::producer::Producer;
use crate::storage::TimeoutData;

pub(crate) struct Outbound {
    producer: Arc<Producer>,
    filters: Vec<Arc<dyn Filter>>,
    middleware: Vec<Arc<dyn SendMessageMiddleware>>,
}

impl Outbound {
    pub(crate) fn new(
        producer: Arc<Producer>,
        filters: Vec<Arc<dyn Filter>>,
        middleware: Vec<Arc<dyn SendMessageMiddleware>>,
    ) -> Self {
        Self {
            producer,
            filters,
            middleware,
        }
    }

    pub(crate) fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }
}

#[async_trait]
impl MessageSink for Outbound {
    async fn dispatch(&self, mut message: OutgoingMessage) -> Result<(), BusError> {
        if !message.apply_filters(&self.filters) {
            debug!(message_type = %message.type_name, "Outgoing message dropped by filter");
            return Ok(());
        }
        SendNext::new(&self.middleware, self).run(&mut message).await
    }
}

#[async_trait]
impl Transmit for Outbound {
    async fn transmit(&self, message: &OutgoingMessage) -> Result<(), BusError> {
        let body = message.body.clone();
        let map = message.headers.clone();
        match message.kind {
            MessageKind::Publish => {
                self.producer
                    .publish(&message.type_name, body, map, message.routing_key.as_deref())
                    .await
            }
            MessageKind::Send if message.destinations.is_empty() => {
                self.producer.send(&message.type_name, body, map).await
            }
            MessageKind::Send => {
                self.producer
                    .send_to(&message.destinations, &message.type_name, body, map)
                    .await
            }
            MessageKind::ByteStream => {
                for endpoint in &message.destinations {
                    self.producer
                        .send_bytes(endpoint, &message.type_name, body.clone(), map.clone())
                        .await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TimeoutDispatcher for Outbound {
    async fn dispatch_timeout(&self, timeout: &TimeoutData) -> Result<(), HandlerError> {
        let message = TimeoutMessage {
            correlation_id: timeout.process_manager_id,
        };
        let mut outgoing =
            OutgoingMessage::new(MessageKind::Send, &message)?.to([timeout.destination.as_str()]);
        for (key, value) in &timeout.headers {
            outgoing.headers.insert(key.as_str(), value.as_str());
        }
        outgoing
            .headers
            .insert(headers::MESSAGE_ID, timeout.id.to_string());
        self.dispatch(outgoing).await?;
        Ok(())
    }
}
