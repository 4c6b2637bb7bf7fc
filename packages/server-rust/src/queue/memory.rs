//! In-process queue backend.
//!
//! Messages received are hidden for the queue's visibility timeout and become
//! visible again unless deleted with the receipt handle of that receive.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use localfaas_core::QueueDeclaration;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{QueueBackend, QueueError, QueueMessage};
use crate::config::EmulatorConfig;

struct StoredMessage {
    id: String,
    body: String,
    sent_ms: u64,
    first_receive_ms: Option<u64>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// One named queue.
pub struct InMemoryQueue {
    name: String,
    arn: String,
    visibility_timeout: Duration,
    messages: Mutex<VecDeque<StoredMessage>>,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new(name: impl Into<String>, region: &str, visibility_timeout: Duration) -> Self {
        let name = name.into();
        Self {
            arn: format!("arn:aws:sqs:{region}:{}:{name}", localfaas_core::manifest::LOCAL_ACCOUNT_ID),
            name,
            visibility_timeout,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a message and returns its id.
    pub fn send(&self, body: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.messages.lock().push_back(StoredMessage {
            id: id.clone(),
            body: body.into(),
            sent_ms: now_ms(),
            first_receive_ms: None,
            receive_count: 0,
            invisible_until: None,
            receipt: None,
        });
        debug!(queue = %self.name, message_id = %id, "message enqueued");
        id
    }

    /// Messages currently available to receive.
    #[must_use]
    pub fn approximate_count(&self) -> usize {
        let now = Instant::now();
        self.messages.lock().iter().filter(|m| m.is_visible(now)).count()
    }

    /// Messages received but not yet deleted or expired.
    #[must_use]
    pub fn approximate_in_flight(&self) -> usize {
        let now = Instant::now();
        self.messages.lock().iter().filter(|m| !m.is_visible(now)).count()
    }

    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn arn(&self) -> String {
        self.arn.clone()
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let now = Instant::now();
        let received_ms = now_ms();
        let mut messages = self.messages.lock();
        let received = messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(max)
            .map(|m| {
                let receipt = uuid::Uuid::new_v4().to_string();
                m.invisible_until = Some(now + self.visibility_timeout);
                m.receipt = Some(receipt.clone());
                m.receive_count += 1;
                let first_receive_ms = *m.first_receive_ms.get_or_insert(received_ms);
                QueueMessage {
                    message_id: m.id.clone(),
                    receipt_handle: receipt,
                    body: m.body.clone(),
                    receive_count: m.receive_count,
                    sent_timestamp_ms: m.sent_ms,
                    first_receive_timestamp_ms: first_receive_ms,
                }
            })
            .collect();
        Ok(received)
    }

    async fn delete(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        let mut messages = self.messages.lock();
        let mut unknown = None;
        for handle in receipt_handles {
            match messages.iter().position(|m| m.receipt.as_ref() == Some(handle)) {
                Some(index) => {
                    messages.remove(index);
                }
                None => unknown = Some(handle.clone()),
            }
        }
        match unknown {
            Some(receipt_handle) => Err(QueueError::InvalidReceipt {
                queue: self.name.clone(),
                receipt_handle,
            }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueStore
// ---------------------------------------------------------------------------

/// All local queues, by name.
pub struct QueueStore {
    region: String,
    default_visibility: Duration,
    queues: DashMap<String, Arc<InMemoryQueue>>,
}

impl QueueStore {
    #[must_use]
    pub fn new(config: &EmulatorConfig) -> Self {
        Self {
            region: config.region.clone(),
            default_visibility: Duration::from_secs(30),
            queues: DashMap::new(),
        }
    }

    /// Creates a queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyExists` if the name is taken.
    pub fn create(&self, declaration: &QueueDeclaration) -> Result<Arc<InMemoryQueue>, QueueError> {
        match self.queues.entry(declaration.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(QueueError::AlreadyExists {
                name: declaration.name.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let queue = Arc::new(InMemoryQueue::new(
                    declaration.name.clone(),
                    &self.region,
                    Duration::from_secs(declaration.visibility_timeout),
                ));
                slot.insert(Arc::clone(&queue));
                Ok(queue)
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    /// Returns the named queue, creating it with the default visibility
    /// timeout when missing.
    pub fn get_or_create(&self, name: &str) -> Arc<InMemoryQueue> {
        let queue = self.queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(InMemoryQueue::new(name, &self.region, self.default_visibility))
        });
        Arc::clone(queue.value())
    }

    /// Enqueues into an existing queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotFound` if the queue does not exist.
    pub fn send(&self, name: &str, body: impl Into<String>) -> Result<String, QueueError> {
        self.get(name)
            .map(|q| q.send(body))
            .ok_or_else(|| QueueError::NotFound { name: name.to_string() })
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
