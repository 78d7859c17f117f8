//! Aggregators: batch messages of one type before handling them.
//!
//! A batch is flushed when the buffer reaches the batch size or when the
//! aggregator's timer ticks, whichever comes first. Both paths take the same
//! per-aggregator lock, and a size-triggered flush restarts the timer's
//! countdown.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::handlers::HandlerError;
use crate::message::{codec, Message};
use crate::storage::AggregatorPersistor;

/// Batch handler for messages of type `M`.
#[async_trait]
pub trait Aggregator<M: Message>: Send + Sync + 'static {
    /// Flush once this many messages are buffered. Zero disables size flushes.
    fn batch_size(&self) -> usize {
        0
    }

    /// Flush whatever is buffered on this period.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, messages: Vec<M>) -> Result<(), HandlerError>;
}

/// Type-erased aggregator as held by the bus.
#[async_trait]
pub trait AggregatorDispatch: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn process(&self, body: &[u8]) -> Result<(), HandlerError>;

    /// Start the periodic flush, if the aggregator has a timeout.
    fn start_timer(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>>;
}

/// Buffers messages through an `AggregatorPersistor` and flushes them to an
/// `Aggregator`.
pub struct AggregatorProcessor<M, A> {
    aggregator: A,
    persistor: Arc<dyn AggregatorPersistor>,
    batch_size: usize,
    timeout: Option<Duration>,
    lock: Mutex<()>,
    timer_reset: Notify,
    _message: PhantomData<fn() -> M>,
}

impl<M, A> AggregatorProcessor<M, A>
where
    M: Message,
    A: Aggregator<M>,
{
    /// `default_batch_size` applies when the aggregator declares neither a
    /// batch size nor a timeout.
    pub fn new(aggregator: A, persistor: Arc<dyn AggregatorPersistor>, default_batch_size: usize) -> Self {
        let timeout = aggregator.timeout().filter(|t| !t.is_zero());
        let batch_size = match (aggregator.batch_size(), timeout) {
            (0, None) => default_batch_size,
            (size, _) => size,
        };
        Self {
            aggregator,
            persistor,
            batch_size,
            timeout,
            lock: Mutex::new(()),
            timer_reset: Notify::new(),
            _message: PhantomData,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Buffer one message, flushing if the batch is full.
    pub async fn process_message(&self, body: &[u8]) -> Result<(), HandlerError> {
        codec::deserialize::<M>(body)?;

        let _guard = self.lock.lock().await;
        self.persistor.insert_data(M::TYPE_NAME, body.to_vec()).await?;

        if self.batch_size == 0 {
            return Ok(());
        }
        let buffered = self.persistor.count(M::TYPE_NAME).await?;
        if buffered >= self.batch_size {
            self.flush_locked().await?;
            self.timer_reset.notify_one();
        }
        Ok(())
    }

    /// Flush the buffer now. Returns the number of messages handled.
    pub async fn flush(&self) -> Result<usize, HandlerError> {
        let _guard = self.lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<usize, HandlerError> {
        let raw = self.persistor.get_data(M::TYPE_NAME).await?;
        if raw.is_empty() {
            return Ok(0);
        }
        let messages = raw
            .iter()
            .map(|body| codec::deserialize::<M>(body))
            .collect::<Result<Vec<M>, _>>()?;
        let count = messages.len();

        if let Err(e) = self.aggregator.execute(messages).await {
            error!(
                aggregator = std::any::type_name::<A>(),
                message_type = M::TYPE_NAME,
                buffered = count,
                error = %e,
                "Aggregator failed, buffer kept"
            );
            return Err(e);
        }

        self.persistor.remove_data(M::TYPE_NAME, count).await?;
        debug!(
            aggregator = std::any::type_name::<A>(),
            message_type = M::TYPE_NAME,
            count,
            "Flushed aggregator batch"
        );
        Ok(count)
    }

    async fn run_timer(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        info!(message_type = M::TYPE_NAME, period_ms = period.as_millis() as u64, "Aggregator timer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.timer_reset.notified() => continue,
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.flush().await {
                        error!(message_type = M::TYPE_NAME, error = %e, "Timed aggregator flush failed");
                    }
                }
            }
        }
        debug!(message_type = M::TYPE_NAME, "Aggregator timer stopped");
    }
}

#[async_trait]
impl<M, A> AggregatorDispatch for AggregatorProcessor<M, A>
where
    M: Message,
    A: Aggregator<M>,
{
    fn message_type(&self) -> &'static str {
        M::TYPE_NAME
    }

    async fn process(&self, body: &[u8]) -> Result<(), HandlerError> {
        self.process_message(body).await
    }

    fn start_timer(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.timeout?;
        Some(tokio::spawn(self.run_timer(period, cancel)))
    }
}
