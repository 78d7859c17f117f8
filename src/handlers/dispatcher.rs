//! Typed handler dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error};

use super::{ConsumeContext, HandlerError, HandlerReference, MessageHandler};
use crate::message::{codec, Message, MessageKind, MessageTypeInfo};

type InvokeFuture = BoxFuture<'static, Result<(), HandlerError>>;

type InvokeFn = Arc<dyn Fn(&[u8], &ConsumeContext) -> InvokeFuture + Send + Sync>;

struct HandlerEntry {
    reference: HandlerReference,
    invoke: InvokeFn,
}

/// Invokes plain handlers for a message type and, for sent messages, its
/// ancestors.
///
/// Entries are built at registration; each captures the concrete handler
/// and message types, so dispatch is a map lookup per chain level.
#[derive(Default)]
pub struct MessageHandlerProcessor {
    handlers: HashMap<String, Vec<HandlerEntry>>,
}

impl MessageHandlerProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler factory for `M`. A fresh handler is created per
    /// message.
    pub fn register<M, H, F>(&mut self, factory: F, routing_keys: Option<Vec<String>>)
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let reference = HandlerReference {
            handler_type: std::any::type_name::<H>(),
            message_type: M::TYPE_NAME.to_string(),
            routing_keys,
        };
        let factory = Arc::new(factory);
        let invoke: InvokeFn = Arc::new(move |body: &[u8], context: &ConsumeContext| -> InvokeFuture {
            let message = codec::deserialize::<M>(body);
            let context = context.clone();
            let factory = factory.clone();
            Box::pin(async move {
                let message = message?;
                let handler = factory();
                handler.execute(&message, &context).await
            })
        });

        debug!(
            handler = reference.handler_type,
            message_type = M::TYPE_NAME,
            "Registered message handler"
        );
        self.handlers
            .entry(M::TYPE_NAME.to_string())
            .or_default()
            .push(HandlerEntry { reference, invoke });
    }

    /// Whether any handler is registered for exactly this type.
    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn references(&self) -> impl Iterator<Item = &HandlerReference> {
        self.handlers.values().flatten().map(|e| &e.reference)
    }

    /// Dispatch a message body to every matching handler.
    ///
    /// Ancestor types are visited only for `Send`; publishers are expected
    /// to publish each base type themselves. The first handler error is
    /// logged and returned.
    pub async fn process(
        &self,
        info: &MessageTypeInfo,
        body: &[u8],
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        let levels = if context.kind() == Some(MessageKind::Send) {
            &info.chain[..]
        } else {
            &info.chain[..1]
        };
        let routing_key = context.routing_key();

        for message_type in levels {
            let Some(entries) = self.handlers.get(message_type) else {
                continue;
            };
            for entry in entries {
                if !entry.reference.accepts(routing_key.as_deref()) {
                    debug!(
                        handler = entry.reference.handler_type,
                        routing_key = ?routing_key,
                        "Routing key not accepted, skipping handler"
                    );
                    continue;
                }
                if let Err(e) = (entry.invoke)(body, context).await {
                    error!(
                        handler = entry.reference.handler_type,
                        message_type = %message_type,
                        error = %e,
                        "Message handler failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
