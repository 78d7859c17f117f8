//! Header names and the header map carried on every envelope.
//!
//! String-valued headers travel as UTF-8 byte arrays; `RetryCount` and
//! `PacketNumber` travel as integers.

use std::collections::BTreeMap;

use uuid::Uuid;

pub const MESSAGE_ID: &str = "MessageId";
pub const MESSAGE_TYPE: &str = "MessageType";
pub const TYPE_NAME: &str = "TypeName";
pub const FULL_TYPE_NAME: &str = "FullTypeName";
pub const CONSUMER_TYPE: &str = "ConsumerType";
pub const SOURCE_ADDRESS: &str = "SourceAddress";
pub const DESTINATION_ADDRESS: &str = "DestinationAddress";
pub const SOURCE_MACHINE: &str = "SourceMachine";
pub const DESTINATION_MACHINE: &str = "DestinationMachine";
pub const TIME_SENT: &str = "TimeSent";
pub const TIME_RECEIVED: &str = "TimeReceived";
pub const RETRY_COUNT: &str = "RetryCount";
pub const REQUEST_MESSAGE_ID: &str = "RequestMessageId";
pub const RESPONSE_MESSAGE_ID: &str = "ResponseMessageId";
pub const ROUTING_KEY: &str = "RoutingKey";
pub const ROUTING_SLIP: &str = "RoutingSlip";
pub const SEQUENCE_ID: &str = "SequenceId";
pub const PACKET_NUMBER: &str = "PacketNumber";
pub const STOP: &str = "Stop";
pub const EXCEPTION: &str = "Exception";

/// Value stored under a header key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bytes(Vec<u8>),
    Int(i64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Bytes(value.into_bytes())
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// String-keyed header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    inner: BTreeMap<String, HeaderValue>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.inner.insert(key.into(), value.into());
    }

    /// Insert only when the key is absent.
    pub fn insert_if_absent(&mut self, key: &str, value: impl Into<HeaderValue>) {
        if !self.inner.contains_key(key) {
            self.inner.insert(key.to_string(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.inner.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.inner.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// String view of a header. Integers and booleans are rendered.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.inner.get(key)? {
            HeaderValue::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            HeaderValue::Int(i) => Some(i.to_string()),
            HeaderValue::Bool(b) => Some(b.to_string()),
        }
    }

    /// Integer view of a header. Numeric strings are parsed.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.inner.get(key)? {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.inner.get(key) {
            Some(HeaderValue::Bool(b)) => *b,
            Some(HeaderValue::Int(i)) => *i != 0,
            Some(HeaderValue::Bytes(bytes)) => bytes.eq_ignore_ascii_case(b"true"),
            None => false,
        }
    }

    pub fn get_uuid(&self, key: &str) -> Option<Uuid> {
        self.get_str(key).and_then(|s| Uuid::parse_str(s.trim()).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copy every entry of `other` over this map.
    pub fn merge(&mut self, other: &MessageHeaders) {
        for (key, value) in other.iter() {
            self.inner.insert(key.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, HeaderValue)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
