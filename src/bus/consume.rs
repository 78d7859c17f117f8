//! Inbound path.
//!
//! Per delivery: before-filters, then either the stream processor (byte
//! stream packets) or the process-message middleware chain around core
//! dispatch, then after-filters, then routing slip forwarding. Errors and
//! panics anywhere in that path mark the delivery failed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{BusError, BusInner};
use crate::client::{ConsumeHandler, ConsumeOutcome};
use crate::handlers::{ConsumeContext, HandlerError};
use crate::message::{headers, Envelope, MessageKind, MessageTypeInfo};
use crate::pipeline::{run_filters, MessageDispatch, OutgoingMessage, ProcessNext};

/// Consumer callback handed to the client. Holds the bus weakly so running
/// workers do not keep a dropped bus alive.
pub(crate) struct InboundHandler {
    pub(crate) bus: Weak<BusInner>,
}

#[async_trait]
impl ConsumeHandler for InboundHandler {
    async fn consume(&self, envelope: Envelope) -> ConsumeOutcome {
        match self.bus.upgrade() {
            Some(bus) => bus.consume_message_event(envelope).await,
            None => ConsumeOutcome::failed("bus dropped"),
        }
    }
}

/// Terminal of the process-message chain.
struct CoreDispatch<'a> {
    bus: &'a BusInner,
    info: Option<&'a MessageTypeInfo>,
}

#[async_trait]
impl MessageDispatch for CoreDispatch<'_> {
    async fn dispatch(
        &self,
        envelope: &Envelope,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        let response_to = envelope.headers.get_uuid(headers::RESPONSE_MESSAGE_ID);
        if let Some(request_id) = response_to {
            let reply_id = envelope.headers.get_uuid(headers::MESSAGE_ID);
            if self.bus.requests.reply(request_id, reply_id, &envelope.body)? {
                debug!(request_id = %request_id, "Reply delivered to pending request");
            }
        }

        let Some(info) = self.info else {
            if let Some(request_id) = response_to {
                debug!(request_id = %request_id, "Reply of unregistered type, no handlers run");
                return Ok(());
            }
            let type_name = envelope.type_name().unwrap_or_default();
            return Err(BusError::TypeResolution(type_name).into());
        };

        let (handled, managed) = futures::join!(
            self.bus.handlers.process(info, &envelope.body, context),
            self.bus.process_managers.process(info, &envelope.body, context),
        );
        handled?;
        managed?;

        if let Some(aggregator) = self.bus.aggregators.get(&info.full_name) {
            aggregator.process(&envelope.body).await?;
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

impl BusInner {
    /// Handle one inbound envelope and report the outcome to the consumer.
    pub(crate) async fn consume_message_event(&self, mut envelope: Envelope) -> ConsumeOutcome {
        let result = AssertUnwindSafe(self.process_envelope(&mut envelope))
            .catch_unwind()
            .await;
        let failure = match result {
            Ok(Ok(())) => return ConsumeOutcome::ok(),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic),
        };

        error!(
            message_type = ?envelope.type_name(),
            message_id = ?envelope.headers.get_str(headers::MESSAGE_ID),
            error = %failure,
            "Message processing failed"
        );
        if let Some(callback) = &self.exception_callback {
            callback(&envelope, &failure);
        }
        ConsumeOutcome::failed(failure)
    }

    async fn process_envelope(&self, envelope: &mut Envelope) -> Result<(), HandlerError> {
        if !run_filters(&self.before_filters, envelope) {
            debug!(message_type = ?envelope.type_name(), "Stopped by before-consuming filter");
            return Ok(());
        }

        let info = envelope
            .type_name()
            .and_then(|name| self.registry.resolve(&name).cloned());
        let context = ConsumeContext::with_sink(envelope.headers.clone(), self.outbound.clone());

        if envelope.kind() == Some(MessageKind::ByteStream) {
            self.streams.process_packet(info.as_ref(), envelope, &context)?;
        } else {
            let terminal = CoreDispatch {
                bus: self,
                info: info.as_ref(),
            };
            ProcessNext::new(&self.process_middleware, &terminal)
                .run(envelope, &context)
                .await?;
        }

        if !run_filters(&self.after_filters, envelope) {
            debug!(message_type = ?envelope.type_name(), "Stopped by after-consuming filter");
        }

        self.forward_routing_slip(envelope).await?;
        Ok(())
    }

    async fn forward_routing_slip(&self, envelope: &Envelope) -> Result<(), BusError> {
        let Some(slip) = envelope.headers.get_str(headers::ROUTING_SLIP) else {
            return Ok(());
        };
        let destinations: Vec<String> = serde_json::from_str(&slip)?;
        let Some(type_name) = envelope.type_name() else {
            warn!("Routing slip on message without type name, not forwarded");
            return Ok(());
        };
        if destinations.is_empty() {
            return Ok(());
        }

        let mut forwarded = envelope.headers.clone();
        forwarded.remove(headers::RETRY_COUNT);
        forwarded.remove(headers::EXCEPTION);
        forwarded.remove(headers::MESSAGE_ID);
        let message = OutgoingMessage {
            kind: MessageKind::Send,
            type_name,
            destinations: Vec::new(),
            routing_key: None,
            body: envelope.body.clone(),
            headers: forwarded,
        };
        self.route_outgoing(message, destinations).await
    }
}
