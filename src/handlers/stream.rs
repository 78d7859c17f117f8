//! Chunked byte streams.
//!
//! A stream is a sequence of `ByteStream` packets sharing a `SequenceId`:
//! packet 0 carries the serialized stream message, packets 1..n carry data
//! chunks no larger than the configured maximum message size, and a final
//! empty packet carries the `Stop` header. Packets may arrive out of order;
//! the reader yields chunks in packet order.
//!
//! A stream's slot is released once every packet was forwarded, when its
//! handler task ends, or after it saw no packet for the idle timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{ConsumeContext, HandlerError};
use crate::bus::BusError;
use crate::message::{codec, headers, Envelope, Message, MessageHeaders, MessageTypeInfo};
use crate::producer::Producer;

/// Handler receiving a stream message and its data.
#[async_trait]
pub trait StreamHandler<M: Message>: Send + Sync + 'static {
    async fn execute(
        &self,
        message: M,
        stream: ByteStreamReader,
        context: ConsumeContext,
    ) -> Result<(), HandlerError>;
}

#[derive(Debug)]
enum StreamPacket {
    Data(i64, Vec<u8>),
    End(i64),
}

/// In-order view of an inbound stream's data chunks.
pub struct ByteStreamReader {
    rx: mpsc::UnboundedReceiver<StreamPacket>,
    buffered: BTreeMap<i64, Vec<u8>>,
    next: i64,
    end: Option<i64>,
}

impl ByteStreamReader {
    fn new(rx: mpsc::UnboundedReceiver<StreamPacket>) -> Self {
        Self {
            rx,
            buffered: BTreeMap::new(),
            next: 1,
            end: None,
        }
    }

    /// Next chunk, or `None` once the stream has ended.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(chunk) = self.buffered.remove(&self.next) {
                self.next += 1;
                return Some(chunk);
            }
            if self.end == Some(self.next) {
                return None;
            }
            match self.rx.recv().await? {
                StreamPacket::Data(number, chunk) => {
                    self.buffered.insert(number, chunk);
                }
                StreamPacket::End(number) => self.end = Some(number),
            }
        }
    }

    /// Concatenate every remaining chunk.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// Outbound stream opened with `Bus::create_stream`.
pub struct ByteStreamWriter {
    producer: Arc<Producer>,
    endpoint: String,
    type_name: String,
    sequence_id: Uuid,
    next_packet: i64,
}

impl ByteStreamWriter {
    /// Send packet 0 carrying `message` and return the writer.
    pub(crate) async fn open<M: Message>(
        producer: Arc<Producer>,
        endpoint: &str,
        message: &M,
    ) -> Result<Self, BusError> {
        let mut writer = Self {
            producer,
            endpoint: endpoint.to_string(),
            type_name: M::TYPE_NAME.to_string(),
            sequence_id: Uuid::new_v4(),
            next_packet: 0,
        };
        writer
            .send_packet(codec::serialize(message)?, false)
            .await?;
        Ok(writer)
    }

    pub fn sequence_id(&self) -> Uuid {
        self.sequence_id
    }

    async fn send_packet(&mut self, body: Vec<u8>, stop: bool) -> Result<(), BusError> {
        let mut packet_headers = MessageHeaders::new();
        packet_headers.insert(headers::SEQUENCE_ID, self.sequence_id.to_string());
        packet_headers.insert(headers::PACKET_NUMBER, self.next_packet);
        if stop {
            packet_headers.insert(headers::STOP, true);
        }
        self.producer
            .send_bytes(&self.endpoint, &self.type_name, body, packet_headers)
            .await?;
        self.next_packet += 1;
        Ok(())
    }

    /// Write data, split into packets of at most the maximum message size.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
        let max = self.producer.max_message_size().max(1);
        for chunk in data.chunks(max) {
            self.send_packet(chunk.to_vec(), false).await?;
        }
        Ok(())
    }

    /// Send the terminating packet.
    pub async fn close(mut self) -> Result<(), BusError> {
        self.send_packet(Vec::new(), true).await?;
        debug!(
            sequence_id = %self.sequence_id,
            packets = self.next_packet,
            "Closed byte stream"
        );
        Ok(())
    }
}

type InvokeFuture = BoxFuture<'static, Result<(), HandlerError>>;

type StreamInvokeFn =
    Arc<dyn Fn(&[u8], ByteStreamReader, ConsumeContext) -> InvokeFuture + Send + Sync>;

struct StreamEntry {
    handler_type: &'static str,
    invoke: StreamInvokeFn,
}

/// Streams idle for this long are dropped with their buffered packets.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

struct StreamSlot {
    tx: mpsc::UnboundedSender<StreamPacket>,
    rx: Option<mpsc::UnboundedReceiver<StreamPacket>>,
    data_packets: i64,
    end: Option<i64>,
    touched: Instant,
}

impl StreamSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            data_packets: 0,
            end: None,
            touched: Instant::now(),
        }
    }

    /// Handler started and every packet up to `Stop` forwarded.
    fn finished(&self) -> bool {
        self.rx.is_none() && self.end == Some(self.data_packets + 1)
    }
}

/// Routes inbound stream packets to their handler task.
pub struct StreamProcessor {
    handlers: HashMap<String, StreamEntry>,
    streams: Arc<DashMap<String, StreamSlot>>,
    idle_timeout: Duration,
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_STREAM_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            streams: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    pub fn register<M, H, F>(&mut self, factory: F)
    where
        M: Message,
        H: StreamHandler<M>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let invoke: StreamInvokeFn = Arc::new(
            move |body: &[u8], reader: ByteStreamReader, context: ConsumeContext| -> InvokeFuture {
                let message = codec::deserialize::<M>(body);
                let factory = factory.clone();
                Box::pin(async move {
                    let message = message?;
                    factory().execute(message, reader, context).await
                })
            },
        );
        self.handlers.insert(
            M::TYPE_NAME.to_string(),
            StreamEntry {
                handler_type: std::any::type_name::<H>(),
                invoke,
            },
        );
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Number of streams with packets still expected.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn evict_idle(&self) {
        let now = Instant::now();
        self.streams.retain(|sequence_id, slot| {
            let idle = now.duration_since(slot.touched) >= self.idle_timeout;
            if idle {
                warn!(sequence_id = %sequence_id, "Dropping idle byte stream");
            }
            !idle
        });
    }

    /// Accept one packet. Packet 0 starts the handler task.
    pub fn process_packet(
        &self,
        info: Option<&MessageTypeInfo>,
        envelope: &Envelope,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        let sequence_id = envelope
            .headers
            .get_str(headers::SEQUENCE_ID)
            .ok_or("byte stream packet without SequenceId")?;
        let packet = envelope
            .headers
            .get_int(headers::PACKET_NUMBER)
            .ok_or("byte stream packet without PacketNumber")?;

        self.evict_idle();
        let mut slot = self
            .streams
            .entry(sequence_id.clone())
            .or_insert_with(StreamSlot::new);
        slot.touched = Instant::now();

        if packet == 0 {
            let entry = info
                .and_then(|info| self.handlers.get(&info.full_name))
                .ok_or_else(|| {
                    format!(
                        "no stream handler for {}",
                        envelope.type_name().unwrap_or_default()
                    )
                });
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    drop(slot);
                    self.streams.remove(&sequence_id);
                    return Err(e.into());
                }
            };
            let Some(rx) = slot.rx.take() else {
                return Err(format!("stream {} already started", sequence_id).into());
            };
            let task = (entry.invoke)(&envelope.body, ByteStreamReader::new(rx), context.clone());
            let handler_type = entry.handler_type;
            let stream_id = sequence_id.clone();
            let streams = Arc::clone(&self.streams);
            tokio::spawn(async move {
                if let Err(e) = task.await {
                    error!(
                        handler = handler_type,
                        sequence_id = %stream_id,
                        error = %e,
                        "Stream handler failed"
                    );
                }
                streams.remove(&stream_id);
            });
        } else if envelope.headers.get_bool(headers::STOP) {
            let _ = slot.tx.send(StreamPacket::End(packet));
            slot.end = Some(packet);
        } else {
            let _ = slot.tx.send(StreamPacket::Data(packet, envelope.body.clone()));
            slot.data_packets += 1;
        }

        let finished = slot.finished();
        drop(slot);
        if finished {
            self.streams.remove(&sequence_id);
        }
        Ok(())
    }
}
