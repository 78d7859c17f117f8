use super::*;
use crate::aggregator::Aggregator;
use crate::broker::InMemoryBroker;
use crate::handlers::{ByteStreamReader, ConsumeContext, HandlerError, MessageHandler, StreamHandler};
use crate::message::TimeoutMessage;
use crate::pipeline::{ProcessNext, SendMessageMiddleware, SendNext};
use crate::process_manager::{
    ProcessInstance, ProcessManager, ProcessManagerHandler, StartProcessManager,
};
use crate::storage::memory::InMemoryProcessManagerFinder;
use crate::test_utils::{eventually, Counter, OrderEvent, OrderPlaced, OrderSagaData, PaymentReceived};
use async_trait::async_trait;

fn config(queue: &str) -> BusConfig {
    BusConfig::for_test(queue)
}

fn order() -> OrderPlaced {
    OrderPlaced::new(Uuid::new_v4(), "o-1", 42)
}

/// Replies with a `PaymentReceived` naming the replying queue.
struct Responder {
    name: String,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for Responder {
    async fn execute(&self, message: &OrderPlaced, context: &ConsumeContext) -> std::result::Result<(), HandlerError> {
        context
            .reply(&PaymentReceived {
                correlation_id: message.correlation_id,
                order_id: self.name.clone(),
            })
            .await?;
        Ok(())
    }
}

async fn responder(broker: &InMemoryBroker, queue: &str) -> Bus {
    let name = queue.to_string();
    let bus = Bus::builder(config(queue))
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(move || Responder { name: name.clone() })
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();
    bus
}

async fn requester(broker: &InMemoryBroker) -> Bus {
    let bus = Bus::builder(config("checkout"))
        .broker(Arc::new(broker.clone()))
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();
    bus
}

struct Recorder {
    seen: Arc<StdMutex<Vec<MessageHeaders>>>,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for Recorder {
    async fn execute(&self, _message: &OrderPlaced, context: &ConsumeContext) -> std::result::Result<(), HandlerError> {
        self.seen.lock().unwrap().push(context.headers().clone());
        Ok(())
    }
}

fn recorder(seen: &Arc<StdMutex<Vec<MessageHeaders>>>) -> impl Fn() -> Recorder + Send + Sync + 'static {
    let seen = seen.clone();
    move || Recorder { seen: seen.clone() }
}

#[tokio::test]
async fn test_send_request_to_many_collects_one_reply_per_endpoint() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let _b = responder(&broker, "pricing.b").await;
    let client = requester(&broker).await;

    let mut replies: Vec<PaymentReceived> = client
        .send_request_to_many(
            &["pricing.a".to_string(), "pricing.b".to_string()],
            &order(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    replies.sort_by(|x, y| x.order_id.cmp(&y.order_id));
    let names: Vec<_> = replies.iter().map(|r| r.order_id.as_str()).collect();
    assert_eq!(names, vec!["pricing.a", "pricing.b"]);
    assert_eq!(client.pending_requests(), 0);
}

/// Fails the first `PaymentReceived` it sees.
struct FlakyPaymentHandler {
    calls: Counter,
}

#[async_trait]
impl MessageHandler<PaymentReceived> for FlakyPaymentHandler {
    async fn execute(&self, _message: &PaymentReceived, _context: &ConsumeContext) -> std::result::Result<(), HandlerError> {
        self.calls.incr();
        if self.calls.get() == 1 {
            return Err("payment ledger busy".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_retried_reply_is_not_counted_twice() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let calls = Counter::new();
    let handled = calls.clone();
    let client = Bus::builder(config("checkout"))
        .broker(Arc::new(broker.clone()))
        .handler::<PaymentReceived, _, _>(move || FlakyPaymentHandler {
            calls: handled.clone(),
        })
        .build()
        .unwrap();
    client.start_consuming().await.unwrap();

    let result: Result<Vec<PaymentReceived>> = client
        .send_request_to_many(
            &["pricing.a".to_string(), "pricing.missing".to_string()],
            &order(),
            Duration::from_millis(500),
        )
        .await;

    assert!(matches!(result, Err(BusError::RequestTimeout(_))));
    assert_eq!(calls.get(), 2);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_publish_request_callback_may_inspect_pending_requests() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let client = requester(&broker).await;
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let table = client.clone();
    let sink = seen.clone();
    client
        .publish_request_callback(
            &order(),
            Some(1),
            Duration::from_secs(2),
            move |_reply: PaymentReceived| sink.lock().unwrap().push(table.pending_requests()),
        )
        .await
        .unwrap();

    eventually(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![1]);
    eventually(|| client.pending_requests() == 0).await;
    client.stop_consuming().await;
}

#[tokio::test]
async fn test_send_request_single_endpoint() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let client = requester(&broker).await;

    let reply: PaymentReceived = client
        .send_request("pricing.a", &order(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.order_id, "pricing.a");
}

#[tokio::test]
async fn test_send_request_timeout_removes_pending_request() {
    let broker = InMemoryBroker::new();
    let client = requester(&broker).await;

    let result: Result<PaymentReceived> = client
        .send_request("nobody.home", &order(), Duration::from_millis(100))
        .await;

    assert!(matches!(result, Err(BusError::RequestTimeout(_))));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_callback_runs_once_with_all_replies() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let _b = responder(&broker, "pricing.b").await;
    let client = requester(&broker).await;

    let calls = Counter::new();
    let received = Arc::new(StdMutex::new(0usize));
    let (done, sink) = (calls.clone(), received.clone());
    client
        .send_request_to_many_callback(
            &["pricing.a".to_string(), "pricing.b".to_string()],
            &order(),
            Duration::from_secs(2),
            move |replies: Vec<PaymentReceived>| {
                *sink.lock().unwrap() = replies.len();
                done.incr();
            },
        )
        .await
        .unwrap();

    eventually(|| calls.get() == 1).await;
    assert_eq!(*received.lock().unwrap(), 2);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_callback_dropped_after_timeout() {
    let broker = InMemoryBroker::new();
    let client = requester(&broker).await;

    client
        .send_request_callback(
            "nobody.home",
            &order(),
            Duration::from_millis(50),
            |_: PaymentReceived| panic!("no reply expected"),
        )
        .await
        .unwrap();
    assert_eq!(client.pending_requests(), 1);

    eventually(|| client.pending_requests() == 0).await;
}

#[tokio::test]
async fn test_publish_request_gathers_replies_until_timeout() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let _b = responder(&broker, "pricing.b").await;
    let client = requester(&broker).await;

    let replies: Vec<PaymentReceived> = client
        .publish_request(&order(), None, Duration::from_millis(300))
        .await
        .unwrap();

    assert_eq!(replies.len(), 2);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_publish_request_returns_once_expected_count_reached() {
    let broker = InMemoryBroker::new();
    let _a = responder(&broker, "pricing.a").await;
    let client = requester(&broker).await;

    let replies: Vec<PaymentReceived> = client
        .publish_request(&order(), Some(1), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let broker = InMemoryBroker::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let mut subscribers = Vec::new();
    for queue in ["billing", "shipping"] {
        let bus = Bus::builder(config(queue))
            .broker(Arc::new(broker.clone()))
            .handler::<OrderPlaced, _, _>(recorder(&seen))
            .build()
            .unwrap();
        bus.start_consuming().await.unwrap();
        subscribers.push(bus);
    }
    let publisher = requester(&broker).await;

    publisher.publish(&order()).await.unwrap();

    eventually(|| seen.lock().unwrap().len() == 2).await;
    let seen = seen.lock().unwrap();
    assert!(seen
        .iter()
        .all(|h| h.get_str(headers::MESSAGE_TYPE).as_deref() == Some("Publish")));
}

#[tokio::test]
async fn test_send_uses_queue_mapping_and_reaches_base_type_handler() {
    struct BaseHandler(Counter);

    #[async_trait]
    impl MessageHandler<OrderEvent> for BaseHandler {
        async fn execute(&self, _message: &OrderEvent, _context: &ConsumeContext) -> std::result::Result<(), HandlerError> {
            self.0.incr();
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let calls = Counter::new();
    let handled = calls.clone();
    let receiver = Bus::builder(config("orders"))
        .broker(Arc::new(broker.clone()))
        .register_message::<OrderPlaced>()
        .handler::<OrderEvent, _, _>(move || BaseHandler(handled.clone()))
        .build()
        .unwrap();
    receiver.start_consuming().await.unwrap();

    let mut sender_config = config("web");
    sender_config.map_queue(OrderPlaced::TYPE_NAME, "orders");
    let sender = Bus::builder(sender_config)
        .broker(Arc::new(broker.clone()))
        .build()
        .unwrap();

    sender.send(&order()).await.unwrap();
    eventually(|| calls.get() == 1).await;

    let payment = PaymentReceived {
        correlation_id: Uuid::new_v4(),
        order_id: "o-1".into(),
    };
    let unmapped = sender.send(&payment).await;
    assert!(matches!(unmapped, Err(BusError::NoDestination(_))));
}

#[tokio::test]
async fn test_before_filter_stops_processing() {
    let broker = InMemoryBroker::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let after = Counter::new();
    let after_calls = after.clone();
    let bus = Bus::builder(config("filtered"))
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(recorder(&seen))
        .before_filter(|envelope: &mut Envelope| !envelope.headers.contains_key("Blocked"))
        .after_filter(move |_: &mut Envelope| {
            after_calls.incr();
            true
        })
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    let mut blocked = MessageHeaders::new();
    blocked.insert("Blocked", true);
    bus.send_with(&order(), blocked, &["filtered".to_string()])
        .await
        .unwrap();
    bus.send_to("filtered", &order()).await.unwrap();

    eventually(|| after.get() == 1).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(broker.queue_len("errors"), 0);
}

#[tokio::test]
async fn test_outgoing_filter_and_send_middleware() {
    struct Stamp;

    #[async_trait]
    impl SendMessageMiddleware for Stamp {
        async fn process(&self, message: &mut OutgoingMessage, next: SendNext<'_>) -> Result<()> {
            message.headers.insert("Tenant", "acme");
            next.run(message).await
        }
    }

    let broker = InMemoryBroker::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let bus = Bus::builder(config("stamped"))
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(recorder(&seen))
        .outgoing_filter(|envelope: &mut Envelope| !envelope.headers.contains_key("Drop"))
        .send_middleware(Stamp)
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    let mut dropped = MessageHeaders::new();
    dropped.insert("Drop", true);
    bus.send_with(&order(), dropped, &["stamped".to_string()])
        .await
        .unwrap();
    bus.send_to("stamped", &order()).await.unwrap();

    eventually(|| seen.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get_str("Tenant").as_deref(), Some("acme"));
}

#[tokio::test]
async fn test_process_middleware_can_skip_dispatch() {
    struct SkipLarge(Counter);

    #[async_trait]
    impl ProcessMessageMiddleware for SkipLarge {
        async fn process(
            &self,
            envelope: &mut Envelope,
            context: &ConsumeContext,
            next: ProcessNext<'_>,
        ) -> std::result::Result<(), HandlerError> {
            self.0.incr();
            let order: OrderPlaced = crate::message::codec::deserialize(&envelope.body)?;
            if order.amount > 100 {
                return Ok(());
            }
            next.run(envelope, context).await
        }
    }

    let broker = InMemoryBroker::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let wrapped = Counter::new();
    let bus = Bus::builder(config("guarded"))
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(recorder(&seen))
        .process_middleware(SkipLarge(wrapped.clone()))
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    bus.send_to("guarded", &OrderPlaced::new(Uuid::new_v4(), "big", 500))
        .await
        .unwrap();
    bus.send_to("guarded", &OrderPlaced::new(Uuid::new_v4(), "small", 5))
        .await
        .unwrap();

    eventually(|| wrapped.get() == 2).await;
    eventually(|| seen.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn test_routing_slip_visits_destinations_in_order() {
    struct Hop {
        name: &'static str,
        visits: Arc<StdMutex<Vec<(String, bool)>>>,
    }

    #[async_trait]
    impl MessageHandler<OrderPlaced> for Hop {
        async fn execute(&self, _message: &OrderPlaced, context: &ConsumeContext) -> std::result::Result<(), HandlerError> {
            let has_slip = context.headers().contains_key(headers::ROUTING_SLIP);
            self.visits
                .lock()
                .unwrap()
                .push((self.name.to_string(), has_slip));
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let visits = Arc::new(StdMutex::new(Vec::new()));
    let mut hops = Vec::new();
    for name in ["step.a", "step.b", "step.c"] {
        let visits = visits.clone();
        let bus = Bus::builder(config(name))
            .broker(Arc::new(broker.clone()))
            .handler::<OrderPlaced, _, _>(move || Hop {
                name,
                visits: visits.clone(),
            })
            .build()
            .unwrap();
        bus.start_consuming().await.unwrap();
        hops.push(bus);
    }
    let origin = requester(&broker).await;

    let route: Vec<String> = ["step.a", "step.b", "step.c"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    origin.route(&order(), &route).await.unwrap();

    eventually(|| visits.lock().unwrap().len() == 3).await;
    assert_eq!(
        *visits.lock().unwrap(),
        vec![
            ("step.a".to_string(), true),
            ("step.b".to_string(), true),
            ("step.c".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn test_route_without_destinations_fails() {
    let bus = requester(&InMemoryBroker::new()).await;
    assert!(matches!(
        bus.route(&order(), &[]).await,
        Err(BusError::NoDestination(_))
    ));
}

#[tokio::test]
async fn test_handler_panic_is_contained_and_reported() {
    struct Panics;

    #[async_trait]
    impl MessageHandler<OrderPlaced> for Panics {
        async fn execute(&self, _message: &OrderPlaced, _context: &ConsumeContext) -> std::result::Result<(), HandlerError> {
            panic!("boom");
        }
    }

    let broker = InMemoryBroker::new();
    let failures = Arc::new(StdMutex::new(Vec::new()));
    let sink = failures.clone();
    let mut cfg = config("fragile");
    cfg.transport.max_retries = 0;
    let bus = Bus::builder(cfg)
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(|| Panics)
        .on_exception(move |_envelope: &Envelope, error: &str| {
            sink.lock().unwrap().push(error.to_string())
        })
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    bus.send_to("fragile", &order()).await.unwrap();

    eventually(|| broker.queue_len("errors") == 1).await;
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("boom"));

    let failed = broker.drain("errors");
    assert!(failed[0]
        .headers
        .get_str(headers::EXCEPTION)
        .unwrap()
        .contains("boom"));
}

#[tokio::test]
async fn test_unregistered_message_type_fails_resolution() {
    let broker = InMemoryBroker::new();
    let failures = Arc::new(StdMutex::new(Vec::new()));
    let sink = failures.clone();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let mut cfg = config("strict");
    cfg.transport.max_retries = 0;
    let bus = Bus::builder(cfg)
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(recorder(&seen))
        .on_exception(move |_envelope: &Envelope, error: &str| {
            sink.lock().unwrap().push(error.to_string())
        })
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    bus.send_to(
        "strict",
        &PaymentReceived {
            correlation_id: Uuid::new_v4(),
            order_id: "o-1".into(),
        },
    )
    .await
    .unwrap();

    eventually(|| failures.lock().unwrap().len() == 1).await;
    assert!(failures.lock().unwrap()[0].contains("tests.PaymentReceived"));
}

#[derive(Clone)]
struct ShippingSaga {
    timeouts: Counter,
}

impl ProcessManager for ShippingSaga {
    type Data = OrderSagaData;
}

#[async_trait]
impl StartProcessManager<OrderPlaced> for ShippingSaga {
    async fn execute(
        &self,
        message: &OrderPlaced,
        instance: &mut ProcessInstance<OrderSagaData>,
    ) -> std::result::Result<(), HandlerError> {
        instance.data.order_id = message.order_id.clone();
        instance.request_timeout(Duration::ZERO).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessManagerHandler<TimeoutMessage> for ShippingSaga {
    async fn execute(
        &self,
        _message: &TimeoutMessage,
        instance: &mut ProcessInstance<OrderSagaData>,
    ) -> std::result::Result<(), HandlerError> {
        self.timeouts.incr();
        instance.mark_complete();
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_saga_timeout_is_delivered_and_completes_saga() {
    let broker = InMemoryBroker::new();
    let finder = Arc::new(InMemoryProcessManagerFinder::new());
    let saga = ShippingSaga {
        timeouts: Counter::new(),
    };
    let timeouts = saga.timeouts.clone();

    let bus = Bus::builder(config("shipping"))
        .broker(Arc::new(broker.clone()))
        .process_manager_finder(finder.clone())
        .process_manager(move || saga.clone(), |pm| {
            pm.starts_with::<OrderPlaced>()
                .handles::<TimeoutMessage>();
        })
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    bus.send_to("shipping", &order()).await.unwrap();

    // The poller checks again within a minute of its last poll.
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(timeouts.get(), 1);
    assert!(finder.is_empty().await);
    assert!(finder.pending_timeouts().await.is_empty());
    bus.shutdown().await;
}

#[tokio::test]
async fn test_aggregator_receives_batches() {
    struct Batches(Arc<StdMutex<Vec<usize>>>);

    #[async_trait]
    impl Aggregator<OrderPlaced> for Batches {
        fn batch_size(&self) -> usize {
            2
        }

        async fn execute(&self, messages: Vec<OrderPlaced>) -> std::result::Result<(), HandlerError> {
            self.0.lock().unwrap().push(messages.len());
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let batches = Arc::new(StdMutex::new(Vec::new()));
    let bus = Bus::builder(config("batched"))
        .broker(Arc::new(broker.clone()))
        .aggregator::<OrderPlaced, _>(Batches(batches.clone()))
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();

    for _ in 0..4 {
        bus.send_to("batched", &order()).await.unwrap();
    }

    eventually(|| batches.lock().unwrap().len() == 2).await;
    assert_eq!(*batches.lock().unwrap(), vec![2, 2]);
}

#[tokio::test]
async fn test_byte_stream_end_to_end() {
    struct Collect(Arc<StdMutex<Option<(String, Vec<u8>)>>>);

    #[async_trait]
    impl StreamHandler<OrderPlaced> for Collect {
        async fn execute(
            &self,
            message: OrderPlaced,
            mut stream: ByteStreamReader,
            _context: ConsumeContext,
        ) -> std::result::Result<(), HandlerError> {
            let data = stream.read_to_end().await;
            *self.0.lock().unwrap() = Some((message.order_id, data));
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let collected = Arc::new(StdMutex::new(None));
    let sink = collected.clone();
    let receiver = Bus::builder(config("files"))
        .broker(Arc::new(broker.clone()))
        .stream_handler::<OrderPlaced, _, _>(move || Collect(sink.clone()))
        .build()
        .unwrap();
    receiver.start_consuming().await.unwrap();

    let mut sender_config = config("uploader");
    sender_config.limits.max_message_size = 4;
    let sender = Bus::builder(sender_config)
        .broker(Arc::new(broker.clone()))
        .build()
        .unwrap();

    let payload = b"the quick brown fox".to_vec();
    let mut writer = sender.create_stream("files", &order()).await.unwrap();
    writer.write(&payload).await.unwrap();
    writer.close().await.unwrap();

    eventually(|| collected.lock().unwrap().is_some()).await;
    let (order_id, data) = collected.lock().unwrap().clone().unwrap();
    assert_eq!(order_id, "o-1");
    assert_eq!(data, payload);
}

#[tokio::test]
async fn test_stop_consuming_leaves_messages_queued() {
    let broker = InMemoryBroker::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let bus = Bus::builder(config("paused"))
        .broker(Arc::new(broker.clone()))
        .handler::<OrderPlaced, _, _>(recorder(&seen))
        .build()
        .unwrap();
    bus.start_consuming().await.unwrap();
    bus.start_consuming().await.unwrap();
    bus.stop_consuming().await;

    bus.send_to("paused", &order()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.queue_len("paused"), 1);
    assert!(seen.lock().unwrap().is_empty());

    bus.start_consuming().await.unwrap();
    eventually(|| seen.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let mut cfg = config("broken");
    cfg.transport.consumer_count = 0;
    assert!(matches!(
        Bus::builder(cfg).build(),
        Err(BusError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_consumed_types_cover_every_registration() {
    let bus = Bus::builder(config("types"))
        .register_message::<OrderEvent>()
        .handler::<OrderPlaced, _, _>(recorder(&Arc::new(StdMutex::new(Vec::new()))))
        .process_manager(
            || ShippingSaga {
                timeouts: Counter::new(),
            },
            |pm| {
                pm.handles::<TimeoutMessage>();
            },
        )
        .build()
        .unwrap();

    assert_eq!(
        bus.inner.consumed_types(),
        vec![TimeoutMessage::TYPE_NAME.to_string(), OrderPlaced::TYPE_NAME.to_string()]
    );
}
