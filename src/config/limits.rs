//! Byte stream limits.
//!
//! Byte streams are chunked so that no packet exceeds `max_message_size`.
//! The default is conservative; RabbitMQ itself accepts far larger frames.

use std::time::Duration;

use serde::Deserialize;

/// Default maximum packet size (256 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Default idle time before an inbound stream is dropped.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum body bytes per byte-stream packet.
    pub max_message_size: usize,
    /// Seconds an inbound stream may go without a packet.
    pub stream_idle_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stream_idle_timeout_secs: DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
        }
    }
}

impl Limits {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}
