//! Queue backends and the event source that drains them into functions.
//!
//! - [`memory`]: in-process queues with visibility timeouts
//! - [`source`]: `QueueEventSource`, the polling/batching event source mapping

pub mod memory;
pub mod source;

use async_trait::async_trait;
use serde::Serialize;

pub use memory::{InMemoryQueue, QueueStore};
pub use source::{QueueEventSource, SourceState};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue not found: {name}")]
    NotFound { name: String },
    #[error("queue {name} already exists")]
    AlreadyExists { name: String },
    #[error("receipt handle is not valid for queue {queue}: {receipt_handle}")]
    InvalidReceipt { queue: String, receipt_handle: String },
}

/// A message handed out by [`QueueBackend::receive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    /// Identifies this particular receive; required to delete the message.
    pub receipt_handle: String,
    pub body: String,
    pub receive_count: u32,
    /// Milliseconds since the Unix epoch.
    pub sent_timestamp_ms: u64,
    pub first_receive_timestamp_ms: u64,
}

/// Queue-like backend a [`QueueEventSource`] polls.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &str;

    fn arn(&self) -> String;

    /// Receives up to `max` visible messages, hiding each one for the
    /// queue's visibility timeout.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Deletes received messages by receipt handle.
    ///
    /// Unknown handles fail the call after every known handle was deleted.
    async fn delete(&self, receipt_handles: &[String]) -> Result<(), QueueError>;
}
