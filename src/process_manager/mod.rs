//! Process managers (sagas).
//!
//! This module contains:
//! - `ProcessManagerData`: correlation-keyed saga state
//! - `ProcessManager`: a saga type, its data and correlation mapping
//! - `StartProcessManager<M>` / `ProcessManagerHandler<M>`: start and
//!   continuation entry points per message type
//! - `ProcessInstance<D>`: state handed to a saga for one message
//! - `ProcessManagerProcessor`: lookup, execute and persist
//! - `TimeoutPoller`: dispatches due timeouts as `TimeoutMessage`s

mod mapper;
mod processor;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::handlers::{ConsumeContext, HandlerError};
use crate::message::Message;
use crate::storage::{ProcessManagerFinder, StoreError, TimeoutData};

pub use mapper::{CorrelationKey, ProcessManagerPropertyMapper};
pub use processor::ProcessManagerProcessor;
pub use timeout::{TimeoutDispatcher, TimeoutPoller};

/// Saga state. Records are keyed by `correlation_id`.
pub trait ProcessManagerData:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    fn correlation_id(&self) -> Uuid;

    fn set_correlation_id(&mut self, id: Uuid);
}

/// A saga type.
pub trait ProcessManager: Send + Sync + 'static {
    type Data: ProcessManagerData;

    /// Declare how inbound messages locate stored data. Message types
    /// without a mapping match on correlation id.
    fn configure_mapper(_mapper: &mut ProcessManagerPropertyMapper<Self::Data>)
    where
        Self: Sized,
    {
    }
}

/// Entry point that may create a new saga instance.
#[async_trait]
pub trait StartProcessManager<M: Message>: ProcessManager {
    async fn execute(
        &self,
        message: &M,
        instance: &mut ProcessInstance<Self::Data>,
    ) -> Result<(), HandlerError>;
}

/// Entry point for an existing saga instance.
#[async_trait]
pub trait ProcessManagerHandler<M: Message>: ProcessManager {
    async fn execute(
        &self,
        message: &M,
        instance: &mut ProcessInstance<Self::Data>,
    ) -> Result<(), HandlerError>;
}

/// Saga state for the duration of one message.
pub struct ProcessInstance<D> {
    pub data: D,
    complete: bool,
    context: ConsumeContext,
    finder: Arc<dyn ProcessManagerFinder>,
    timeout_destination: Arc<str>,
}

impl<D: ProcessManagerData> ProcessInstance<D> {
    pub(crate) fn new(
        data: D,
        context: ConsumeContext,
        finder: Arc<dyn ProcessManagerFinder>,
        timeout_destination: Arc<str>,
    ) -> Self {
        Self {
            data,
            complete: false,
            context,
            finder,
            timeout_destination,
        }
    }

    /// Delete the saga's data once this message is handled.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn context(&self) -> &ConsumeContext {
        &self.context
    }

    pub fn finder(&self) -> &Arc<dyn ProcessManagerFinder> {
        &self.finder
    }

    /// Schedule a `TimeoutMessage` for this saga after `delay`.
    pub async fn request_timeout(&self, delay: Duration) -> Result<Uuid, StoreError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| StoreError::Backend(format!("timeout delay out of range: {}", e)))?;
        self.request_timeout_at(Utc::now() + delay).await
    }

    /// Schedule a `TimeoutMessage` for this saga at `at`.
    pub async fn request_timeout_at(&self, at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let timeout = TimeoutData::new(
            self.data.correlation_id(),
            self.timeout_destination.as_ref(),
            at,
        );
        let id = timeout.id;
        self.finder.insert_timeout(timeout).await?;
        Ok(id)
    }
}
