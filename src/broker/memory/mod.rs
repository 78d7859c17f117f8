//! In-memory broker for standalone mode and tests.
//!
//! Emulates the subset of AMQP semantics the bus relies on: direct, fanout
//! and topic exchanges, the default exchange, competing consumers on a
//! queue, purge/delete, and per-queue message TTL with a dead-letter
//! exchange. A failed declaration or binding closes the channel it was
//! issued on. A queue declared with both a TTL and a dead-letter exchange
//! holds each message for the TTL and then re-routes it through the
//! dead-letter exchange; such queues are never consumed directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind, NoopAck,
    QueueOptions, Result, DEFAULT_EXCHANGE,
};
use crate::message::Envelope;

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    envelope: Envelope,
    exchange: String,
    routing_key: String,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    deleted: AtomicBool,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<StoredMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, message: StoredMessage) {
        self.messages().push_back(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<StoredMessage> {
        loop {
            if self.deleted.load(Ordering::SeqCst) {
                return None;
            }
            let next = self.messages().pop_front();
            if next.is_some() {
                return next;
            }
            self.notify.notified().await;
        }
    }

    fn dead_letters(&self) -> bool {
        self.options.message_ttl.is_some() && self.options.dead_letter_exchange.is_some()
    }
}

#[derive(Debug, Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, Arc<QueueState>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topology: Mutex<Topology>,
    pending_failures: AtomicUsize,
}

impl BrokerState {
    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume one injected failure, if any are pending.
    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Check if a topic routing key matches a binding pattern.
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn route(
    state: &Arc<BrokerState>,
    exchange: &str,
    routing_key: &str,
    envelope: &Envelope,
) -> Result<()> {
    let targets: Vec<Arc<QueueState>> = {
        let topology = state.topology();
        if exchange == DEFAULT_EXCHANGE {
            topology.queues.get(routing_key).cloned().into_iter().collect()
        } else {
            let ex = topology.exchanges.get(exchange).ok_or_else(|| {
                BrokerError::Publish(format!("no exchange '{}' in vhost", exchange))
            })?;
            ex.bindings
                .iter()
                .filter(|b| match ex.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                })
                .filter_map(|b| topology.queues.get(&b.queue).cloned())
                .collect()
        }
    };

    if targets.is_empty() {
        debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
    }

    for queue in targets {
        let message = StoredMessage {
            envelope: envelope.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if queue.dead_letters() {
            schedule_dead_letter(state.clone(), queue, message);
        } else {
            queue.push(message);
        }
    }
    Ok(())
}

fn schedule_dead_letter(state: Arc<BrokerState>, queue: Arc<QueueState>, message: StoredMessage) {
    let (Some(ttl), Some(dlx)) = (
        queue.options.message_ttl,
        queue.options.dead_letter_exchange.clone(),
    ) else {
        return;
    };
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if queue.deleted.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = route(&state, &dlx, &message.routing_key, &message.envelope) {
            warn!(exchange = %dlx, error = %e, "Dead-letter routing failed");
        }
    });
}

/// In-process broker shared by every bus built from it.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` channel opens or publishes fail with a
    /// connection error.
    pub fn fail_next_operations(&self, count: usize) {
        self.state.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.topology().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.topology().queues.contains_key(name)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state
            .topology()
            .queues
            .get(name)
            .map(|q| q.options.clone())
    }

    /// Queues bound to an exchange, with their binding keys.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .topology()
            .exchanges
            .get(exchange)
            .map(|ex| {
                ex.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of ready messages in a queue.
    pub fn queue_len(&self, name: &str) -> usize {
        self.state
            .topology()
            .queues
            .get(name)
            .map(|q| q.messages().len())
            .unwrap_or(0)
    }

    /// Remove and return every ready message in a queue.
    pub fn drain(&self, name: &str) -> Vec<Envelope> {
        let queue = self.state.topology().queues.get(name).cloned();
        queue
            .map(|q| q.messages().drain(..).map(|m| m.envelope).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.state.take_failure() {
            return Err(BrokerError::Connection("injected connection failure".into()));
        }
        Ok(Arc::new(InMemoryChannel {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn kind(&self) -> &'static str {
        "InMemory"
    }
}

/// Channel onto an `InMemoryBroker`.
pub struct InMemoryChannel {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Channel("channel closed".into()))
        } else {
            Ok(())
        }
    }

    /// Declaration errors close the channel, as AMQP channel exceptions do.
    fn channel_exception(&self, error: BrokerError) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Err(error)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        self.ensure_open()?;
        let mut topology = self.state.topology();
        match topology.exchanges.get(name) {
            Some(existing) if existing.kind != kind => {
                self.channel_exception(BrokerError::Declare(format!(
                    "exchange '{}' already declared as {:?}",
                    name, existing.kind
                )))
            }
            Some(_) => Ok(()),
            None => {
                topology.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut topology = self.state.topology();
        match topology.queues.get(name) {
            Some(existing) if existing.options != *options => {
                self.channel_exception(BrokerError::Declare(format!(
                    "queue '{}' already declared with different arguments",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                topology
                    .queues
                    .insert(name.to_string(), Arc::new(QueueState::new(options.clone())));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut topology = self.state.topology();
        if !topology.queues.contains_key(queue) {
            return self.channel_exception(BrokerError::Declare(format!("no queue '{}'", queue)));
        }
        let Some(ex) = topology.exchanges.get_mut(exchange) else {
            return self.channel_exception(BrokerError::Declare(format!(
                "no exchange '{}'",
                exchange
            )));
        };
        let exists = ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        if self.state.take_failure() {
            return Err(BrokerError::Publish("injected publish failure".into()));
        }
        route(&self.state, exchange, routing_key, envelope)
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let queue = self
            .state
            .topology()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", queue)))?;

        let stream = futures::stream::unfold(queue, |queue| async move {
            let message = queue.pop().await?;
            let delivery = Delivery::new(
                message.envelope,
                message.exchange,
                message.routing_key,
                Box::new(NoopAck),
            );
            Some((Ok(delivery), queue))
        });
        Ok(Box::pin(stream))
    }

    async fn purge_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(q) = self.state.topology().queues.get(queue) {
            q.messages().clear();
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let removed = {
            let mut topology = self.state.topology();
            for ex in topology.exchanges.values_mut() {
                ex.bindings.retain(|b| b.queue != queue);
            }
            topology.queues.remove(queue)
        };
        if let Some(q) = removed {
            q.deleted.store(true, Ordering::SeqCst);
            q.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
