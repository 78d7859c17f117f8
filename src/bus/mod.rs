//! Message bus.
//!
//! This module contains:
//! - `Bus`: publish/send, request/reply, routing slips, byte streams and
//!   the consume lifecycle
//! - `BusBuilder`: registration of handlers, process managers,
//!   aggregators, stream handlers, filters and middleware
//! - `BusError`: errors surfaced by bus operations

mod builder;
mod consume;
mod outbound;
mod request;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::AggregatorDispatch;
use crate::broker::BrokerError;
use crate::client::Client;
use crate::config::{BusConfig, QueueOverrides};
use crate::handlers::{ByteStreamWriter, MessageHandlerProcessor, StreamProcessor};
use crate::message::{headers, Envelope, Message, MessageHeaders, MessageKind, MessageRegistry};
use crate::pipeline::{Filter, MessageSink, OutgoingMessage, ProcessMessageMiddleware};
use crate::process_manager::{ProcessManagerProcessor, TimeoutPoller};
use crate::storage::StoreError;

pub use builder::{BusBuilder, ProcessManagerRegistration};
use consume::InboundHandler;
use outbound::Outbound;
use request::{PendingRequests, RequestConfiguration};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Called with the failed envelope and the error text.
pub type ExceptionCallback = Arc<dyn Fn(&Envelope, &str) + Send + Sync>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No destination for message type {0}")]
    NoDestination(String),

    #[error("Unknown message type: {0}")]
    TypeResolution(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Request {0} timed out")]
    RequestTimeout(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Background work owned by a consuming bus.
struct ConsumingState {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct BusInner {
    config: BusConfig,
    registry: MessageRegistry,
    handlers: MessageHandlerProcessor,
    process_managers: ProcessManagerProcessor,
    aggregators: HashMap<String, Arc<dyn AggregatorDispatch>>,
    streams: StreamProcessor,
    before_filters: Vec<Arc<dyn Filter>>,
    after_filters: Vec<Arc<dyn Filter>>,
    process_middleware: Vec<Arc<dyn ProcessMessageMiddleware>>,
    exception_callback: Option<ExceptionCallback>,
    outbound: Arc<Outbound>,
    client: Client,
    requests: Arc<PendingRequests>,
    consuming: Mutex<Option<ConsumingState>>,
}

impl BusInner {
    /// Types this bus binds its queue to.
    fn consumed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .registry
            .type_names()
            .filter(|t| {
                self.handlers.handles(t)
                    || self.process_managers.handles(t)
                    || self.aggregators.contains_key(*t)
                    || self.streams.handles(t)
            })
            .map(str::to_string)
            .collect();
        types.sort();
        types
    }

    async fn route_outgoing(
        &self,
        mut message: OutgoingMessage,
        mut destinations: Vec<String>,
    ) -> Result<()> {
        if destinations.is_empty() {
            return Err(BusError::NoDestination(message.type_name));
        }
        let next = destinations.remove(0);
        if destinations.is_empty() {
            message.headers.remove(headers::ROUTING_SLIP);
        } else {
            message
                .headers
                .insert(headers::ROUTING_SLIP, serde_json::to_string(&destinations)?);
        }
        debug!(
            message_type = %message.type_name,
            destination = %next,
            remaining = destinations.len(),
            "Routing message"
        );
        self.outbound.dispatch(message.to([next])).await
    }
}

/// A message bus instance bound to one work queue.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder(config: BusConfig) -> BusBuilder {
        BusBuilder::new(config)
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Work queue this bus consumes and receives replies on.
    pub fn queue_name(&self) -> &str {
        &self.inner.config.transport.queue_name
    }

    /// Number of requests still waiting for replies.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    async fn dispatch(&self, message: OutgoingMessage) -> Result<()> {
        self.inner.outbound.dispatch(message).await
    }

    // ------------------------------------------------------------------
    // Publish / send
    // ------------------------------------------------------------------

    pub async fn publish<M: Message>(&self, message: &M) -> Result<()> {
        self.publish_with(message, MessageHeaders::new(), None).await
    }

    /// Publish with extra headers and an optional routing key.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(message_type = M::TYPE_NAME))]
    pub async fn publish_with<M: Message>(
        &self,
        message: &M,
        headers: MessageHeaders,
        routing_key: Option<&str>,
    ) -> Result<()> {
        let outgoing = OutgoingMessage::new(MessageKind::Publish, message)?
            .with_headers(&headers)
            .with_routing_key(routing_key.map(str::to_string));
        self.dispatch(outgoing).await
    }

    /// Send to the queues mapped for `M`.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        self.send_with(message, MessageHeaders::new(), &[]).await
    }

    pub async fn send_to<M: Message>(&self, endpoint: &str, message: &M) -> Result<()> {
        self.send_with(message, MessageHeaders::new(), &[endpoint.to_string()])
            .await
    }

    pub async fn send_to_many<M: Message>(&self, endpoints: &[String], message: &M) -> Result<()> {
        if endpoints.is_empty() {
            return Err(BusError::NoDestination(M::TYPE_NAME.to_string()));
        }
        self.send_with(message, MessageHeaders::new(), endpoints)
            .await
    }

    /// Send with extra headers. Empty `endpoints` uses the queue mapping.
    #[tracing::instrument(name = "bus.send", skip_all, fields(message_type = M::TYPE_NAME))]
    pub async fn send_with<M: Message>(
        &self,
        message: &M,
        headers: MessageHeaders,
        endpoints: &[String],
    ) -> Result<()> {
        let outgoing = OutgoingMessage::new(MessageKind::Send, message)?
            .with_headers(&headers)
            .to(endpoints.iter().cloned());
        self.dispatch(outgoing).await
    }

    // ------------------------------------------------------------------
    // Request / reply
    // ------------------------------------------------------------------

    fn request_message<M: Message>(
        kind: MessageKind,
        request_id: Uuid,
        message: &M,
    ) -> Result<OutgoingMessage> {
        let mut outgoing = OutgoingMessage::new(kind, message)?;
        outgoing
            .headers
            .insert(headers::MESSAGE_ID, request_id.to_string());
        outgoing
            .headers
            .insert(headers::REQUEST_MESSAGE_ID, request_id.to_string());
        Ok(outgoing)
    }

    /// Register a request that collects replies and signals completion.
    fn collect_replies<P: Message>(
        &self,
        request_id: Uuid,
        expected: Option<usize>,
    ) -> (Arc<StdMutex<Vec<P>>>, oneshot::Receiver<()>) {
        let replies = Arc::new(StdMutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        let sink = replies.clone();
        self.inner.requests.insert(
            request_id,
            RequestConfiguration::new(
                expected,
                move |reply: P| {
                    sink.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(reply)
                },
                move || {
                    let _ = done_tx.send(());
                },
            ),
        );
        (replies, done_rx)
    }

    /// Wait for completion. On timeout the request is removed; `strict`
    /// turns that into an error, otherwise the replies so far are returned.
    async fn await_replies<P: Message>(
        &self,
        request_id: Uuid,
        replies: Arc<StdMutex<Vec<P>>>,
        done: oneshot::Receiver<()>,
        timeout: Duration,
        strict: bool,
    ) -> Result<Vec<P>> {
        let completed = matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(())));
        if !completed {
            self.inner.requests.remove(request_id);
            if strict {
                warn!(request_id = %request_id, ?timeout, "Request timed out");
                return Err(BusError::RequestTimeout(request_id));
            }
        }
        let mut replies = replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(std::mem::take(&mut *replies))
    }

    async fn transmit_request(&self, request_id: Uuid, outgoing: OutgoingMessage) -> Result<()> {
        if let Err(e) = self.dispatch(outgoing).await {
            self.inner.requests.remove(request_id);
            return Err(e);
        }
        Ok(())
    }

    /// Send a request to one endpoint and wait for its reply.
    pub async fn send_request<R: Message, P: Message>(
        &self,
        endpoint: &str,
        request: &R,
        timeout: Duration,
    ) -> Result<P> {
        let replies = self
            .send_request_to_many::<R, P>(&[endpoint.to_string()], request, timeout)
            .await?;
        replies
            .into_iter()
            .next()
            .ok_or_else(|| BusError::Handler("request completed without a reply".into()))
    }

    /// Send a request to every endpoint and wait for one reply from each.
    pub async fn send_request_to_many<R: Message, P: Message>(
        &self,
        endpoints: &[String],
        request: &R,
        timeout: Duration,
    ) -> Result<Vec<P>> {
        if endpoints.is_empty() {
            return Err(BusError::NoDestination(R::TYPE_NAME.to_string()));
        }
        let request_id = Uuid::new_v4();
        let outgoing = Self::request_message(MessageKind::Send, request_id, request)?
            .to(endpoints.iter().cloned());
        let (replies, done) = self.collect_replies::<P>(request_id, Some(endpoints.len()));
        self.transmit_request(request_id, outgoing).await?;
        self.await_replies(request_id, replies, done, timeout, true)
            .await
    }

    /// Send a request to one endpoint; `callback` receives the reply.
    ///
    /// Returns the request id. The request is dropped if no reply arrives
    /// within `timeout`.
    pub async fn send_request_callback<R, P, F>(
        &self,
        endpoint: &str,
        request: &R,
        timeout: Duration,
        callback: F,
    ) -> Result<Uuid>
    where
        R: Message,
        P: Message,
        F: FnOnce(P) + Send + Sync + 'static,
    {
        self.send_request_to_many_callback::<R, P, _>(
            &[endpoint.to_string()],
            request,
            timeout,
            move |mut replies: Vec<P>| {
                if let Some(reply) = replies.pop() {
                    callback(reply);
                }
            },
        )
        .await
    }

    /// Send a request to every endpoint; `callback` runs once with all
    /// replies after the last endpoint answered.
    pub async fn send_request_to_many_callback<R, P, F>(
        &self,
        endpoints: &[String],
        request: &R,
        timeout: Duration,
        callback: F,
    ) -> Result<Uuid>
    where
        R: Message,
        P: Message,
        F: FnOnce(Vec<P>) + Send + Sync + 'static,
    {
        if endpoints.is_empty() {
            return Err(BusError::NoDestination(R::TYPE_NAME.to_string()));
        }
        let request_id = Uuid::new_v4();
        let outgoing = Self::request_message(MessageKind::Send, request_id, request)?
            .to(endpoints.iter().cloned());

        let replies = Arc::new(StdMutex::new(Vec::new()));
        let sink = replies.clone();
        self.inner.requests.insert(
            request_id,
            RequestConfiguration::new(
                Some(endpoints.len()),
                move |reply: P| {
                    sink.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(reply)
                },
                move || {
                    let collected = std::mem::take(
                        &mut *replies
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner()),
                    );
                    callback(collected);
                },
            ),
        );
        self.transmit_request(request_id, outgoing).await?;
        self.inner.requests.expire_after(request_id, timeout);
        Ok(request_id)
    }

    /// Publish a request and gather replies for up to `timeout`.
    ///
    /// With `expected` set, returns as soon as that many replies arrived.
    /// A timeout is not an error here: the replies received so far are
    /// returned.
    pub async fn publish_request<R: Message, P: Message>(
        &self,
        request: &R,
        expected: Option<usize>,
        timeout: Duration,
    ) -> Result<Vec<P>> {
        let request_id = Uuid::new_v4();
        let outgoing = Self::request_message(MessageKind::Publish, request_id, request)?;
        let (replies, done) = self.collect_replies::<P>(request_id, expected);
        self.transmit_request(request_id, outgoing).await?;
        self.await_replies(request_id, replies, done, timeout, false)
            .await
    }

    /// Publish a request; `callback` runs for every reply until `expected`
    /// replies arrived or `timeout` elapsed.
    pub async fn publish_request_callback<R, P, F>(
        &self,
        request: &R,
        expected: Option<usize>,
        timeout: Duration,
        callback: F,
    ) -> Result<Uuid>
    where
        R: Message,
        P: Message,
        F: FnMut(P) + Send + Sync + 'static,
    {
        let request_id = Uuid::new_v4();
        let outgoing = Self::request_message(MessageKind::Publish, request_id, request)?;
        self.inner.requests.insert(
            request_id,
            RequestConfiguration::new(expected, callback, || {}),
        );
        self.transmit_request(request_id, outgoing).await?;
        self.inner.requests.expire_after(request_id, timeout);
        Ok(request_id)
    }

    // ------------------------------------------------------------------
    // Routing slips and streams
    // ------------------------------------------------------------------

    /// Send to the first destination; each hop forwards to the next.
    pub async fn route<M: Message>(&self, message: &M, destinations: &[String]) -> Result<()> {
        let outgoing = OutgoingMessage::new(MessageKind::Send, message)?;
        self.inner
            .route_outgoing(outgoing, destinations.to_vec())
            .await
    }

    /// Open a byte stream to `endpoint`, announced by `message`.
    pub async fn create_stream<M: Message>(
        &self,
        endpoint: &str,
        message: &M,
    ) -> Result<ByteStreamWriter> {
        ByteStreamWriter::open(self.inner.outbound.producer().clone(), endpoint, message).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start_consuming(&self) -> Result<()> {
        self.start_consuming_with(&QueueOverrides::default()).await
    }

    /// Start consuming the work queue, plus the timeout poller and
    /// aggregator timers. Calling it again while consuming is a no-op.
    pub async fn start_consuming_with(&self, overrides: &QueueOverrides) -> Result<()> {
        let mut consuming = self.inner.consuming.lock().await;
        if consuming.is_some() {
            return Ok(());
        }

        let inner = &self.inner;
        let queue = inner.config.transport.queue_name.clone();
        let handler = Arc::new(InboundHandler {
            bus: Arc::downgrade(inner),
        });
        inner
            .client
            .start_consuming(&queue, &inner.consumed_types(), handler, overrides)
            .await?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        if inner.config.process_managers.timeouts_enabled {
            let poller = TimeoutPoller::new(
                inner.process_managers.finder().clone(),
                inner.outbound.clone(),
            );
            tasks.push(poller.spawn(cancel.clone()));
        }
        for aggregator in inner.aggregators.values() {
            if let Some(task) = aggregator.clone().start_timer(cancel.clone()) {
                tasks.push(task);
            }
        }

        info!(queue = %queue, background_tasks = tasks.len(), "Bus consuming");
        *consuming = Some(ConsumingState { cancel, tasks });
        Ok(())
    }

    /// Stop consumers and background tasks, waiting for in-flight work.
    pub async fn stop_consuming(&self) {
        let state = self.inner.consuming.lock().await.take();
        self.inner.client.stop().await;
        if let Some(state) = state {
            state.cancel.cancel();
            for task in state.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
    }

    /// Stop consuming and close the producer channel.
    pub async fn shutdown(&self) {
        self.stop_consuming().await;
        self.inner.outbound.producer().close().await;
        info!(queue = %self.queue_name(), "Bus shut down");
    }
}

#[cfg(test)]
mod tests;
