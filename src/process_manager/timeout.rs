//! Timeout polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handlers::HandlerError;
use crate::storage::{ProcessManagerFinder, StoreError, TimeoutData};

/// Delivers a due timeout to its process manager.
#[async_trait]
pub trait TimeoutDispatcher: Send + Sync {
    async fn dispatch_timeout(&self, timeout: &TimeoutData) -> Result<(), HandlerError>;
}

/// Polls the store for due timeouts and dispatches them.
///
/// Each timeout is removed only after it was dispatched, so a stop request
/// or a failed dispatch leaves it pending for the next poll.
pub struct TimeoutPoller {
    finder: Arc<dyn ProcessManagerFinder>,
    dispatcher: Arc<dyn TimeoutDispatcher>,
    error_delay: Duration,
}

impl TimeoutPoller {
    pub fn new(finder: Arc<dyn ProcessManagerFinder>, dispatcher: Arc<dyn TimeoutDispatcher>) -> Self {
        Self {
            finder,
            dispatcher,
            error_delay: Duration::from_secs(5),
        }
    }

    /// Dispatch every due timeout. Returns when to poll next.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<DateTime<Utc>, StoreError> {
        let batch = self.finder.get_timeouts_batch().await?;
        for timeout in &batch.due {
            if cancel.is_cancelled() {
                break;
            }
            match self.dispatcher.dispatch_timeout(timeout).await {
                Ok(()) => {
                    self.finder.remove_dispatched_timeout(timeout.id).await?;
                    debug!(
                        timeout_id = %timeout.id,
                        process_manager_id = %timeout.process_manager_id,
                        destination = %timeout.destination,
                        "Dispatched timeout"
                    );
                }
                Err(e) => warn!(
                    timeout_id = %timeout.id,
                    error = %e,
                    "Timeout dispatch failed, will retry on next poll"
                ),
            }
        }
        Ok(batch.next_query_time)
    }

    /// Poll until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Timeout poller started");
        while !cancel.is_cancelled() {
            let wait = match self.poll_once(&cancel).await {
                Ok(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                Err(e) => {
                    error!(error = %e, "Timeout poll failed");
                    self.error_delay
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Timeout poller stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
