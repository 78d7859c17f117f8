use super::*;
use crate::broker::{InMemoryBroker, QueueOptions};
use crate::config::BusConfig;
use crate::message::MessageHeaders;
use crate::test_utils::Counter;

struct RecordingHandler {
    calls: Counter,
    fail: bool,
}

#[async_trait]
impl ConsumeHandler for RecordingHandler {
    async fn consume(&self, envelope: Envelope) -> ConsumeOutcome {
        assert!(envelope.headers.contains_key(headers::TIME_RECEIVED));
        assert_eq!(
            envelope.headers.get_str(headers::DESTINATION_ADDRESS).as_deref(),
            Some("work")
        );
        self.calls.incr();
        if self.fail {
            ConsumeOutcome::failed("boom")
        } else {
            ConsumeOutcome::ok()
        }
    }
}

fn transport() -> TransportConfig {
    let mut transport = BusConfig::for_test("work").transport;
    transport.max_retries = 2;
    transport
}

fn handler(fail: bool) -> (Arc<RecordingHandler>, Counter) {
    let calls = Counter::new();
    (
        Arc::new(RecordingHandler {
            calls: calls.clone(),
            fail,
        }),
        calls,
    )
}

fn envelope(kind: MessageKind) -> Envelope {
    let mut map = MessageHeaders::new();
    map.insert(headers::MESSAGE_ID, uuid::Uuid::new_v4().to_string());
    map.insert(headers::MESSAGE_TYPE, kind.as_str());
    Envelope::new(b"{}".to_vec(), map)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_start_declares_topology() {
    let broker = InMemoryBroker::new();
    let mut transport = transport();
    transport.auditing_enabled = true;
    let client = Client::new(Arc::new(broker.clone()), transport);
    let (handler, _) = handler(false);

    client
        .start_consuming(
            "work",
            &["tests.OrderPlaced".to_string()],
            handler,
            &QueueOverrides::default(),
        )
        .await
        .unwrap();

    assert!(broker.has_queue("work"));
    let retry = broker.queue_options("work.Retries").unwrap();
    assert_eq!(retry.message_ttl, Some(Duration::from_millis(50)));
    assert_eq!(
        retry.dead_letter_exchange.as_deref(),
        Some("work.Retries.DeadLetter")
    );
    assert_eq!(
        broker.bindings("work.Retries.DeadLetter"),
        vec![("work".to_string(), String::new())]
    );
    assert!(broker.has_queue("errors"));
    assert!(broker.has_queue("audit"));

    assert_eq!(broker.bindings("testsOrderPlaced")[0].0, "work");

    client.stop().await;
}

#[tokio::test]
async fn test_queue_overrides_layer_over_defaults() {
    let broker = InMemoryBroker::new();
    let client = Client::new(Arc::new(broker.clone()), transport());
    let (handler, _) = handler(false);

    let overrides = QueueOverrides {
        durable: Some(false),
        auto_delete: Some(true),
        ..Default::default()
    };
    client
        .start_consuming("work", &[], handler, &overrides)
        .await
        .unwrap();

    let options = broker.queue_options("work").unwrap();
    assert!(!options.durable);
    assert!(options.auto_delete);
    assert!(!options.exclusive);
    assert!(!broker.has_queue("audit"));
    client.stop().await;
}

#[tokio::test]
async fn test_failed_message_escalates_to_error_queue_after_max_retries() {
    let broker = InMemoryBroker::new();
    let client = Client::new(Arc::new(broker.clone()), transport());
    let (handler, calls) = handler(true);
    client
        .start_consuming("work", &[], handler, &QueueOverrides::default())
        .await
        .unwrap();

    let channel = broker.open_channel().await.unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, "work", &envelope(MessageKind::Send))
        .await
        .unwrap();

    wait_for(|| broker.queue_len("errors") == 1).await;
    let failed = broker.drain("errors");
    assert_eq!(failed[0].headers.get_int(headers::RETRY_COUNT), Some(2));
    assert_eq!(failed[0].headers.get_str(headers::EXCEPTION).as_deref(), Some("boom"));

    // One initial attempt plus two retries, never a third retry.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.get(), 3);
    assert_eq!(broker.queue_len("work"), 0);
    client.stop().await;
}

#[tokio::test]
async fn test_disabled_errors_drop_exhausted_messages() {
    let broker = InMemoryBroker::new();
    let mut transport = transport();
    transport.max_retries = 0;
    transport.disable_errors = true;
    let client = Client::new(Arc::new(broker.clone()), transport);
    let (handler, calls) = handler(true);
    client
        .start_consuming("work", &[], handler, &QueueOverrides::default())
        .await
        .unwrap();

    let channel = broker.open_channel().await.unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, "work", &envelope(MessageKind::Send))
        .await
        .unwrap();

    wait_for(|| calls.get() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!broker.has_queue("errors"));
    assert_eq!(calls.get(), 1);
    client.stop().await;
}

#[tokio::test]
async fn test_successful_messages_are_audited_except_byte_streams() {
    let broker = InMemoryBroker::new();
    let mut transport = transport();
    transport.auditing_enabled = true;
    let client = Client::new(Arc::new(broker.clone()), transport);
    let (handler, calls) = handler(false);
    client
        .start_consuming("work", &[], handler, &QueueOverrides::default())
        .await
        .unwrap();

    let channel = broker.open_channel().await.unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, "work", &envelope(MessageKind::Send))
        .await
        .unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, "work", &envelope(MessageKind::ByteStream))
        .await
        .unwrap();

    wait_for(|| calls.get() == 2).await;
    client.stop().await;
    let audited = broker.drain("audit");
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].kind(), Some(MessageKind::Send));
}

#[tokio::test]
async fn test_purge_on_startup_discards_backlog() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    channel
        .declare_queue("work", &QueueOptions::durable())
        .await
        .unwrap();
    channel
        .publish(DEFAULT_EXCHANGE, "work", &envelope(MessageKind::Send))
        .await
        .unwrap();

    let client = Client::new(Arc::new(broker.clone()), transport());
    let (handler, calls) = handler(false);
    let overrides = QueueOverrides {
        purge_on_startup: Some(true),
        ..Default::default()
    };
    client
        .start_consuming("work", &[], handler, &overrides)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.get(), 0);
    client.stop().await;
}

#[tokio::test]
async fn test_conflicting_queue_declaration_does_not_break_remaining_topology() {
    let broker = InMemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();
    channel
        .declare_queue(
            "work",
            &QueueOptions {
                auto_delete: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let client = Client::new(Arc::new(broker.clone()), transport());
    let (handler, calls) = handler(false);
    client
        .start_consuming(
            "work",
            &["tests.OrderPlaced".to_string()],
            handler,
            &QueueOverrides::default(),
        )
        .await
        .unwrap();

    assert!(broker.queue_options("work").unwrap().auto_delete);
    assert!(broker.has_queue("work.Retries"));
    assert_eq!(
        broker.bindings("work.Retries.DeadLetter"),
        vec![("work".to_string(), String::new())]
    );
    assert!(broker.has_queue("errors"));
    assert_eq!(broker.bindings("testsOrderPlaced")[0].0, "work");

    channel
        .publish(DEFAULT_EXCHANGE, "work", &envelope(MessageKind::Send))
        .await
        .unwrap();
    wait_for(|| calls.get() == 1).await;
    client.stop().await;
}

#[tokio::test]
async fn test_unreachable_broker_fails_start() {
    let broker = InMemoryBroker::new();
    broker.fail_next_operations(2);
    let client = Client::new(Arc::new(broker), transport());
    let (handler, _) = handler(false);

    let result = client
        .start_consuming("work", &[], handler, &QueueOverrides::default())
        .await;
    assert!(matches!(result, Err(BusError::Connection(_))));
}

#[test]
fn test_exchange_name_strips_separators() {
    assert_eq!(exchange_name("tests.OrderPlaced"), "testsOrderPlaced");
    assert_eq!(exchange_name("orders::v2::Shipped"), "ordersv2Shipped");
}
