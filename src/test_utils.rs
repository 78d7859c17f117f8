//! Shared test fixtures: message types, sagas and recording helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{codec, headers, Envelope, Message, MessageHeaders, MessageKind};

/// Base of the order message hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderEvent {
    pub correlation_id: Uuid,
    pub order_id: String,
}

impl Message for OrderEvent {
    const TYPE_NAME: &'static str = "tests.OrderEvent";

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// `OrderPlaced : OrderEvent : Message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderPlaced {
    pub correlation_id: Uuid,
    pub order_id: String,
    pub amount: u32,
}

impl OrderPlaced {
    pub fn new(correlation_id: Uuid, order_id: &str, amount: u32) -> Self {
        Self {
            correlation_id,
            order_id: order_id.to_string(),
            amount,
        }
    }
}

impl Message for OrderPlaced {
    const TYPE_NAME: &'static str = "tests.OrderPlaced";
    const BASE_TYPES: &'static [&'static str] = &["tests.OrderEvent"];

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentReceived {
    pub correlation_id: Uuid,
    pub order_id: String,
}

impl Message for PaymentReceived {
    const TYPE_NAME: &'static str = "tests.PaymentReceived";

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Build an inbound envelope the way the producer would stamp it.
pub fn envelope_for<M: Message>(message: &M, kind: MessageKind) -> Envelope {
    let mut map = MessageHeaders::new();
    map.insert(headers::MESSAGE_ID, Uuid::new_v4().to_string());
    map.insert(headers::MESSAGE_TYPE, kind.as_str());
    map.insert(headers::FULL_TYPE_NAME, M::TYPE_NAME);
    map.insert(
        headers::TYPE_NAME,
        crate::message::short_type_name(M::TYPE_NAME),
    );
    map.insert(headers::SOURCE_ADDRESS, "tests.source");
    Envelope::new(codec::serialize(message).unwrap(), map)
}

/// Shared invocation counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Saga state for order workflows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderSagaData {
    pub correlation_id: Uuid,
    pub order_id: String,
    pub payments: u32,
}

impl crate::process_manager::ProcessManagerData for OrderSagaData {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    fn set_correlation_id(&mut self, id: Uuid) {
        self.correlation_id = id;
    }
}

/// Poll `condition` until it holds, failing the test after about two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
