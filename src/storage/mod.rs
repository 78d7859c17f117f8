//! Persistence contracts for process managers and aggregators.
//!
//! This module contains:
//! - `ProcessManagerFinder`: correlation-keyed saga records with optimistic
//!   concurrency, plus the timeout queue
//! - `ProcessManagerFinderExt`: typed wrapper over the JSON record contract
//! - `AggregatorPersistor`: per-type message buffers
//! - In-memory implementations of both

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process_manager::ProcessManagerData;

pub mod memory;

pub use memory::{InMemoryAggregatorPersistor, InMemoryProcessManagerFinder};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Process manager data already exists: correlation_id={0}")]
    DuplicateCorrelation(Uuid),

    #[error("Process manager data not found: correlation_id={0}")]
    NotFound(Uuid),

    #[error("Concurrency conflict on {correlation_id}: expected version {expected}, stored {actual}")]
    ConcurrencyConflict {
        correlation_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A process manager record as held by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredData {
    /// Data type discriminator; records of different saga types never match.
    pub data_type: String,
    pub correlation_id: Uuid,
    pub version: u64,
    pub data: serde_json::Value,
}

/// Saga data with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistanceData<D> {
    pub data: D,
    pub version: u64,
}

/// A scheduled callback to a process manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutData {
    pub id: Uuid,
    /// Correlation id of the requesting process manager.
    pub process_manager_id: Uuid,
    /// Queue receiving the `TimeoutMessage`.
    pub destination: String,
    /// Due time.
    pub time: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
}

impl TimeoutData {
    pub fn new(process_manager_id: Uuid, destination: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_manager_id,
            destination: destination.into(),
            time,
            headers: BTreeMap::new(),
        }
    }
}

/// Result of a timeout poll.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutsBatch {
    /// Timeouts whose due time has passed.
    pub due: Vec<TimeoutData>,
    /// When to poll next; never more than one minute away.
    pub next_query_time: DateTime<Utc>,
}

/// Longest interval between timeout polls.
pub fn max_poll_interval() -> chrono::Duration {
    chrono::Duration::minutes(1)
}

/// Predicate over stored JSON records.
pub type RecordPredicate<'a> = &'a (dyn Fn(&serde_json::Value) -> bool + Send + Sync);

/// Interface for process manager persistence.
///
/// Implementations must make `update_data` atomic with respect to its
/// version check: of two updates carrying the same version, exactly one
/// succeeds.
#[async_trait]
pub trait ProcessManagerFinder: Send + Sync {
    /// First record of `data_type` satisfying `predicate`.
    async fn find_data(&self, data_type: &str, predicate: RecordPredicate<'_>)
        -> Result<Option<StoredData>>;

    /// Insert at version 1. Fails if the correlation id already exists.
    async fn insert_data(&self, record: StoredData) -> Result<()>;

    /// Replace the record if `record.version` equals the stored version.
    /// Returns the new stored version.
    async fn update_data(&self, record: StoredData) -> Result<u64>;

    async fn delete_data(&self, data_type: &str, correlation_id: Uuid) -> Result<()>;

    async fn insert_timeout(&self, timeout: TimeoutData) -> Result<()>;

    async fn get_timeouts_batch(&self) -> Result<TimeoutsBatch>;

    async fn remove_dispatched_timeout(&self, id: Uuid) -> Result<()>;
}

/// Storage key for a data type.
pub fn data_type_name<D: 'static>() -> &'static str {
    std::any::type_name::<D>()
}

/// Typed access over a `ProcessManagerFinder`.
#[async_trait]
pub trait ProcessManagerFinderExt: ProcessManagerFinder {
    /// Find the record of type `D` for which `matches` holds.
    async fn find_typed<D, F>(&self, matches: F) -> Result<Option<PersistanceData<D>>>
    where
        D: ProcessManagerData,
        F: Fn(&D) -> bool + Send + Sync,
    {
        let predicate = |value: &serde_json::Value| {
            serde_json::from_value::<D>(value.clone())
                .map(|data| matches(&data))
                .unwrap_or(false)
        };
        match self.find_data(data_type_name::<D>(), &predicate).await? {
            Some(record) => Ok(Some(PersistanceData {
                data: serde_json::from_value(record.data)?,
                version: record.version,
            })),
            None => Ok(None),
        }
    }

    async fn insert_typed<D: ProcessManagerData>(&self, data: &D) -> Result<()> {
        self.insert_data(StoredData {
            data_type: data_type_name::<D>().to_string(),
            correlation_id: data.correlation_id(),
            version: 1,
            data: serde_json::to_value(data)?,
        })
        .await
    }

    async fn update_typed<D: ProcessManagerData>(&self, data: &PersistanceData<D>) -> Result<u64> {
        self.update_data(StoredData {
            data_type: data_type_name::<D>().to_string(),
            correlation_id: data.data.correlation_id(),
            version: data.version,
            data: serde_json::to_value(&data.data)?,
        })
        .await
    }

    async fn delete_typed<D: ProcessManagerData>(&self, data: &D) -> Result<()> {
        self.delete_data(data_type_name::<D>(), data.correlation_id())
            .await
    }
}

impl<T: ProcessManagerFinder + ?Sized> ProcessManagerFinderExt for T {}

/// Interface for aggregator buffers, keyed by message type name.
#[async_trait]
pub trait AggregatorPersistor: Send + Sync {
    /// Append a serialized message.
    async fn insert_data(&self, message_type: &str, message: Vec<u8>) -> Result<()>;

    /// Buffered messages, oldest first.
    async fn get_data(&self, message_type: &str) -> Result<Vec<Vec<u8>>>;

    /// Drop the oldest `count` messages.
    async fn remove_data(&self, message_type: &str, count: usize) -> Result<()>;

    async fn count(&self, message_type: &str) -> Result<usize>;
}
