//! Bus construction and registration.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::outbound::Outbound;
use super::request::PendingRequests;
use super::{Bus, BusError, BusInner, ExceptionCallback, Result};
use crate::aggregator::{Aggregator, AggregatorDispatch, AggregatorProcessor};
use crate::broker::{Broker, InMemoryBroker};
use crate::client::Client;
use crate::config::BusConfig;
use crate::handlers::{MessageHandler, MessageHandlerProcessor, StreamHandler, StreamProcessor};
use crate::message::{Envelope, Message, MessageRegistry};
use crate::pipeline::{Filter, ProcessMessageMiddleware, SendMessageMiddleware};
use crate::process_manager::{
    ProcessManager, ProcessManagerHandler, ProcessManagerProcessor, StartProcessManager,
};
use crate::producer::Producer;
use crate::storage::memory::{InMemoryAggregatorPersistor, InMemoryProcessManagerFinder};
use crate::storage::{AggregatorPersistor, ProcessManagerFinder};

type AggregatorFactory =
    Box<dyn FnOnce(Arc<dyn AggregatorPersistor>, usize) -> Arc<dyn AggregatorDispatch> + Send>;

/// Builds a `Bus`.
///
/// Without an explicit broker or stores the bus runs on the in-memory
/// broker and in-memory persistence.
pub struct BusBuilder {
    config: BusConfig,
    broker: Option<Arc<dyn Broker>>,
    finder: Option<Arc<dyn ProcessManagerFinder>>,
    persistor: Option<Arc<dyn AggregatorPersistor>>,
    registry: MessageRegistry,
    handlers: MessageHandlerProcessor,
    process_managers: ProcessManagerProcessor,
    aggregators: Vec<AggregatorFactory>,
    streams: StreamProcessor,
    before_filters: Vec<Arc<dyn Filter>>,
    after_filters: Vec<Arc<dyn Filter>>,
    outgoing_filters: Vec<Arc<dyn Filter>>,
    process_middleware: Vec<Arc<dyn ProcessMessageMiddleware>>,
    send_middleware: Vec<Arc<dyn SendMessageMiddleware>>,
    exception_callback: Option<ExceptionCallback>,
}

impl BusBuilder {
    pub fn new(config: BusConfig) -> Self {
        let timeout_destination = config.transport.queue_name.clone();
        let streams = StreamProcessor::with_idle_timeout(config.limits.stream_idle_timeout());
        Self {
            config,
            broker: None,
            finder: None,
            persistor: None,
            registry: MessageRegistry::new(),
            handlers: MessageHandlerProcessor::new(),
            process_managers: ProcessManagerProcessor::new(
                Arc::new(InMemoryProcessManagerFinder::new()),
                &timeout_destination,
            ),
            aggregators: Vec::new(),
            streams,
            before_filters: Vec::new(),
            after_filters: Vec::new(),
            outgoing_filters: Vec::new(),
            process_middleware: Vec::new(),
            send_middleware: Vec::new(),
            exception_callback: None,
        }
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Connect to the RabbitMQ broker at `transport.url`.
    #[cfg(feature = "amqp")]
    pub async fn amqp(self) -> Result<Self> {
        let broker = crate::broker::AmqpBroker::connect(self.config.transport.url.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(self.broker(Arc::new(broker)))
    }

    pub fn process_manager_finder(mut self, finder: Arc<dyn ProcessManagerFinder>) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn aggregator_persistor(mut self, persistor: Arc<dyn AggregatorPersistor>) -> Self {
        self.persistor = Some(persistor);
        self
    }

    /// Make `M` resolvable on inbound messages without handling it, e.g.
    /// a derived type whose base type has handlers.
    pub fn register_message<M: Message>(mut self) -> Self {
        self.registry.register::<M>();
        self
    }

    /// Register a handler for `M`; `factory` runs once per message.
    pub fn handler<M, H, F>(mut self, factory: F) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register::<M>();
        self.handlers.register::<M, H, F>(factory, None);
        self
    }

    /// Register a handler that only sees publishes carrying one of
    /// `routing_keys`.
    pub fn handler_with_routing_keys<M, H, F>(mut self, factory: F, routing_keys: &[&str]) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register::<M>();
        let keys = routing_keys.iter().map(|k| k.to_string()).collect();
        self.handlers.register::<M, H, F>(factory, Some(keys));
        self
    }

    /// Register a process manager and its entry points.
    ///
    /// ```ignore
    /// builder.process_manager(OrderSaga::default, |pm| {
    ///     pm.starts_with::<OrderPlaced>().handles::<PaymentReceived>();
    /// })
    /// ```
    pub fn process_manager<P, F>(
        mut self,
        factory: F,
        configure: impl FnOnce(&mut ProcessManagerRegistration<'_, P, F>),
    ) -> Self
    where
        P: ProcessManager,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let mut registration = ProcessManagerRegistration {
            factory: Arc::new(factory),
            registry: &mut self.registry,
            processor: &mut self.process_managers,
            _saga: PhantomData,
        };
        configure(&mut registration);
        self
    }

    /// Register an aggregator for `M`.
    pub fn aggregator<M, A>(mut self, aggregator: A) -> Self
    where
        M: Message,
        A: Aggregator<M>,
    {
        self.registry.register::<M>();
        self.aggregators.push(Box::new(
            move |persistor: Arc<dyn AggregatorPersistor>, default_batch_size: usize| {
                let processor: Arc<dyn AggregatorDispatch> = Arc::new(AggregatorProcessor::<M, A>::new(
                    aggregator,
                    persistor,
                    default_batch_size,
                ));
                processor
            },
        ));
        self
    }

    /// Register the handler for byte streams announced by `M`.
    pub fn stream_handler<M, H, F>(mut self, factory: F) -> Self
    where
        M: Message,
        H: StreamHandler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register::<M>();
        self.streams.register::<M, H, F>(factory);
        self
    }

    pub fn before_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.before_filters.push(Arc::new(filter));
        self
    }

    pub fn after_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.after_filters.push(Arc::new(filter));
        self
    }

    pub fn outgoing_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.outgoing_filters.push(Arc::new(filter));
        self
    }

    pub fn process_middleware(mut self, middleware: impl ProcessMessageMiddleware + 'static) -> Self {
        self.process_middleware.push(Arc::new(middleware));
        self
    }

    pub fn send_middleware(mut self, middleware: impl SendMessageMiddleware + 'static) -> Self {
        self.send_middleware.push(Arc::new(middleware));
        self
    }

    /// Called for every message whose processing failed or panicked.
    pub fn on_exception<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Envelope, &str) + Send + Sync + 'static,
    {
        self.exception_callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<Bus> {
        self.config
            .validate()
            .map_err(|e| BusError::Configuration(e.to_string()))?;

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new()));
        let persistor = self
            .persistor
            .unwrap_or_else(|| Arc::new(InMemoryAggregatorPersistor::new()));

        let mut process_managers = self.process_managers;
        if let Some(finder) = self.finder {
            process_managers.bind_store(finder, &self.config.transport.queue_name);
        }

        let mut aggregators = HashMap::new();
        let default_batch_size = self.config.aggregators.default_batch_size;
        for factory in self.aggregators {
            let aggregator = factory(persistor.clone(), default_batch_size);
            aggregators.insert(aggregator.message_type().to_string(), aggregator);
        }

        let producer = Arc::new(Producer::new(broker.clone(), &self.config));
        let outbound = Arc::new(Outbound::new(
            producer,
            self.outgoing_filters,
            self.send_middleware,
        ));
        let client = Client::new(broker.clone(), self.config.transport.clone());

        info!(
            queue = %self.config.transport.queue_name,
            broker = broker.kind(),
            message_types = self.registry.len(),
            aggregators = aggregators.len(),
            "Bus built"
        );

        Ok(Bus {
            inner: Arc::new(BusInner {
                config: self.config,
                registry: self.registry,
                handlers: self.handlers,
                process_managers,
                aggregators,
                streams: self.streams,
                before_filters: self.before_filters,
                after_filters: self.after_filters,
                process_middleware: self.process_middleware,
                exception_callback: self.exception_callback,
                outbound,
                client,
                requests: Arc::new(PendingRequests::default()),
                consuming: Mutex::new(None),
            }),
        })
    }
}

/// Entry point registration for one process manager type.
pub struct ProcessManagerRegistration<'a, P, F> {
    factory: Arc<F>,
    registry: &'a mut MessageRegistry,
    processor: &'a mut ProcessManagerProcessor,
    _saga: PhantomData<fn() -> P>,
}

impl<P, F> ProcessManagerRegistration<'_, P, F>
where
    P: ProcessManager,
    F: Fn() -> P + Send + Sync + 'static,
{
    /// `M` may create a new instance.
    pub fn starts_with<M>(&mut self) -> &mut Self
    where
        M: Message,
        P: StartProcessManager<M>,
    {
        self.registry.register::<M>();
        self.processor
            .register_start::<P, M, F>(self.factory.clone());
        self
    }

    /// `M` continues an existing instance.
    pub fn handles<M>(&mut self) -> &mut Self
    where
        M: Message,
        P: ProcessManagerHandler<M>,
    {
        self.registry.register::<M>();
        self.processor
            .register_handler::<P, M, F>(self.factory.clone());
        self
    }
}
