//! In-memory storage backends.
//!
//! Each instance owns its state; buses sharing a store must share the
//! instance explicitly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    max_poll_interval, AggregatorPersistor, ProcessManagerFinder, RecordPredicate, Result,
    StoreError, StoredData, TimeoutData, TimeoutsBatch,
};

/// Process manager records and timeouts held in memory.
#[derive(Default)]
pub struct InMemoryProcessManagerFinder {
    records: RwLock<HashMap<(String, Uuid), StoredData>>,
    timeouts: RwLock<Vec<TimeoutData>>,
}

impl InMemoryProcessManagerFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all data types.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Raw record lookup by correlation id.
    pub async fn get(&self, data_type: &str, correlation_id: Uuid) -> Option<StoredData> {
        self.records
            .read()
            .await
            .get(&(data_type.to_string(), correlation_id))
            .cloned()
    }

    pub async fn pending_timeouts(&self) -> Vec<TimeoutData> {
        self.timeouts.read().await.clone()
    }
}

#[async_trait]
impl ProcessManagerFinder for InMemoryProcessManagerFinder {
    async fn find_data(
        &self,
        data_type: &str,
        predicate: RecordPredicate<'_>,
    ) -> Result<Option<StoredData>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .find(|r| r.data_type == data_type && predicate(&r.data))
            .cloned())
    }

    async fn insert_data(&self, record: StoredData) -> Result<()> {
        let mut records = self.records.write().await;
        let key = (record.data_type.clone(), record.correlation_id);
        if records.contains_key(&key) {
            return Err(StoreError::DuplicateCorrelation(record.correlation_id));
        }
        records.insert(key, StoredData { version: 1, ..record });
        Ok(())
    }

    async fn update_data(&self, record: StoredData) -> Result<u64> {
        let mut records = self.records.write().await;
        let key = (record.data_type.clone(), record.correlation_id);
        let stored = records
            .get_mut(&key)
            .ok_or(StoreError::NotFound(record.correlation_id))?;
        if stored.version != record.version {
            return Err(StoreError::ConcurrencyConflict {
                correlation_id: record.correlation_id,
                expected: record.version,
                actual: stored.version,
            });
        }
        stored.version += 1;
        stored.data = record.data;
        Ok(stored.version)
    }

    async fn delete_data(&self, data_type: &str, correlation_id: Uuid) -> Result<()> {
        self.records
            .write()
            .await
            .remove(&(data_type.to_string(), correlation_id));
        Ok(())
    }

    async fn insert_timeout(&self, timeout: TimeoutData) -> Result<()> {
        self.timeouts.write().await.push(timeout);
        Ok(())
    }

    async fn get_timeouts_batch(&self) -> Result<TimeoutsBatch> {
        let now = Utc::now();
        let cap = now + max_poll_interval();
        let timeouts = self.timeouts.read().await;

        let due = timeouts.iter().filter(|t| t.time <= now).cloned().collect();
        let next_query_time = timeouts
            .iter()
            .filter(|t| t.time > now)
            .map(|t| t.time)
            .min()
            .map_or(cap, |next| next.min(cap));

        Ok(TimeoutsBatch {
            due,
            next_query_time,
        })
    }

    async fn remove_dispatched_timeout(&self, id: Uuid) -> Result<()> {
        self.timeouts.write().await.retain(|t| t.id != id);
        Ok(())
    }
}

/// Aggregator buffers held in memory.
#[derive(Default)]
pub struct InMemoryAggregatorPersistor {
    buffers: RwLock<HashMap<String, Vec<Vec<u8>>>>,
}

impl InMemoryAggregatorPersistor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregatorPersistor for InMemoryAggregatorPersistor {
    async fn insert_data(&self, message_type: &str, message: Vec<u8>) -> Result<()> {
        self.buffers
            .write()
            .await
            .entry(message_type.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_data(&self, message_type: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .buffers
            .read()
            .await
            .get(message_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_data(&self, message_type: &str, count: usize) -> Result<()> {
        if let Some(buffer) = self.buffers.write().await.get_mut(message_type) {
            let count = count.min(buffer.len());
            buffer.drain(..count);
        }
        Ok(())
    }

    async fn count(&self, message_type: &str) -> Result<usize> {
        Ok(self
            .buffers
            .read()
            .await
            .get(message_type)
            .map_or(0, Vec::len))
    }
}
