//! Queue event source mapping.
//!
//! While enabled, a [`QueueEventSource`] runs two tasks:
//!
//! - a poll loop receiving from the backend with an adaptive interval that
//!   grows while the queue is empty and snaps back after a non-empty receive
//! - a batch loop that accumulates received messages and flushes when the
//!   batch is full or the batching window since its first message elapses
//!
//! Each flush filters the batch, invokes the function once with the records
//! that passed, and deletes what the outcome says was processed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use localfaas_core::{FilterCriteria, PatternError, QueueTrigger, TriggerInfo, TriggerKind};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{QueueBackend, QueueMessage};
use crate::config::{EmulatorConfig, QueueDefaults};
use crate::invoker::FunctionInvoker;

/// Lifecycle of an event source mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Creating,
    Enabling,
    Enabled,
    Disabling,
    Disabled,
}

pub struct QueueEventSource {
    trigger: QueueTrigger,
    filter: FilterCriteria,
    queue: Arc<dyn QueueBackend>,
    invoker: Arc<FunctionInvoker>,
    defaults: QueueDefaults,
    region: String,
    state: watch::Sender<SourceState>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl QueueEventSource {
    /// # Errors
    ///
    /// Returns an error if a filter pattern of the trigger is invalid.
    pub fn new(
        invoker: Arc<FunctionInvoker>,
        trigger: QueueTrigger,
        queue: Arc<dyn QueueBackend>,
        config: &EmulatorConfig,
    ) -> Result<Arc<Self>, PatternError> {
        let filter = trigger.filter_criteria()?;
        Ok(Arc::new(Self {
            trigger,
            filter,
            queue,
            invoker,
            defaults: config.queue.clone(),
            region: config.region.clone(),
            state: watch::Sender::new(SourceState::Creating),
            running: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn trigger(&self) -> &QueueTrigger {
        &self.trigger
    }

    #[must_use]
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        self.invoker.name()
    }

    /// Starts polling. No-op unless the source is `Creating` or `Disabled`.
    pub fn enable(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if !matches!(self.state(), SourceState::Creating | SourceState::Disabled) {
            return;
        }
        self.state.send_replace(SourceState::Enabling);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(self.trigger.batch_size + self.defaults.receive_batch);
        let tasks = vec![
            tokio::spawn(Arc::clone(self).poll_loop(tx, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).batch_loop(rx, shutdown_rx)),
        ];
        *running = Some(Running { shutdown, tasks });

        self.state.send_replace(SourceState::Enabled);
        info!(
            queue = %self.queue.name(),
            function = %self.invoker.name(),
            batch_size = self.trigger.batch_size,
            window_secs = self.trigger.maximum_batching_window,
            "queue event source enabled"
        );
    }

    /// Stops both loops and waits for them to exit. Batches already handed
    /// to the function run to completion; buffered messages become visible
    /// again once their visibility timeout lapses.
    pub async fn disable(&self) {
        let running = {
            let mut running = self.running.lock();
            if self.state() != SourceState::Enabled {
                return;
            }
            self.state.send_replace(SourceState::Disabling);
            running.take()
        };
        if let Some(Running { shutdown, tasks }) = running {
            let _ = shutdown.send(true);
            for task in tasks {
                let _ = task.await;
            }
        }
        self.state.send_replace(SourceState::Disabled);
        info!(queue = %self.queue.name(), function = %self.invoker.name(), "queue event source disabled");
    }

    async fn poll_loop(self: Arc<Self>, tx: mpsc::Sender<QueueMessage>, mut shutdown: watch::Receiver<bool>) {
        let receive_batch = self.defaults.receive_batch;
        let mut interval = self.defaults.min_poll_interval;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                () = tokio::time::sleep(interval) => {}
            }
            let received = self.queue.receive(receive_batch).await;
            interval = next_poll_interval(interval, received.as_ref().map(Vec::len), &self.defaults);
            match received {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    debug!(queue = %self.queue.name(), count = messages.len(), "received messages");
                    for message in messages {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(queue = %self.queue.name(), error = %e, "receive failed");
                }
            }
        }
    }

    async fn batch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<QueueMessage>, mut shutdown: watch::Receiver<bool>) {
        let window = Duration::from_secs(self.trigger.maximum_batching_window);
        let batch_size = self.trigger.batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + window);
                    }
                    batch.push(message);
                    if batch.len() >= batch_size {
                        deadline = None;
                        self.spawn_flush(std::mem::take(&mut batch));
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.spawn_flush(std::mem::take(&mut batch));
                }
                _ = shutdown.changed() => break,
            }
        }

        if !batch.is_empty() {
            debug!(queue = %self.queue.name(), count = batch.len(), "dropping unflushed batch");
        }
    }

    fn spawn_flush(self: &Arc<Self>, batch: Vec<QueueMessage>) {
        tokio::spawn(Arc::clone(self).flush(batch));
    }

    async fn flush(self: Arc<Self>, batch: Vec<QueueMessage>) {
        let arn = self.queue.arn();
        let (accepted, filtered): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|m| {
                let record = sqs_record(&m, &arn, &self.region);
                (m, record)
            })
            .partition(|(_, record)| self.filter.accepts(&filter_view(record)));

        if !filtered.is_empty() {
            debug!(queue = %self.queue.name(), count = filtered.len(), "messages filtered out");
            self.delete(filtered.iter().map(|(m, _)| m)).await;
        }
        if accepted.is_empty() {
            return;
        }

        let (messages, records): (Vec<_>, Vec<_>) = accepted.into_iter().unzip();
        let event = json!({ "Records": records });
        let result = self
            .invoker
            .invoke(event, TriggerInfo::new(TriggerKind::Queue), None)
            .await;

        let processed: Vec<&QueueMessage> = match result {
            Err(e) => {
                warn!(
                    queue = %self.queue.name(),
                    function = %self.invoker.name(),
                    count = messages.len(),
                    error = %e,
                    "batch failed, messages left for redelivery"
                );
                Vec::new()
            }
            Ok(_) if !self.trigger.reports_item_failures() => messages.iter().collect(),
            Ok(output) => {
                let ids: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
                match failed_item_ids(output.as_value().unwrap_or(&Value::Null), &ids) {
                    Some(failed) => {
                        if !failed.is_empty() {
                            info!(queue = %self.queue.name(), failed = failed.len(), "partial batch failure");
                        }
                        messages.iter().filter(|m| !failed.contains(m.message_id.as_str())).collect()
                    }
                    None => {
                        warn!(queue = %self.queue.name(), "invalid batchItemFailures response, batch treated as failed");
                        Vec::new()
                    }
                }
            }
        };
        self.delete(processed.into_iter()).await;
    }

    async fn delete<'a>(&self, messages: impl Iterator<Item = &'a QueueMessage>) {
        let handles: Vec<String> = messages.map(|m| m.receipt_handle.clone()).collect();
        if handles.is_empty() {
            return;
        }
        if let Err(e) = self.queue.delete(&handles).await {
            warn!(queue = %self.queue.name(), error = %e, "delete failed");
        }
    }
}

/// Poll interval after a receive that returned `received` messages: grows
/// by the backoff step while the queue stays empty, snaps back to the floor
/// after a non-empty receive and jumps to the ceiling after an error.
fn next_poll_interval<E>(current: Duration, received: Result<usize, E>, defaults: &QueueDefaults) -> Duration {
    match received {
        Ok(0) => (current + defaults.poll_backoff_step).min(defaults.max_poll_interval),
        Ok(_) => defaults.min_poll_interval,
        Err(_) => defaults.max_poll_interval,
    }
}

/// Message ids a handler reported as failed.
///
/// `None` marks the whole batch failed: an entry without a string
/// `itemIdentifier`, or one naming a message outside the batch. A missing,
/// null or empty `batchItemFailures` means every message succeeded.
fn failed_item_ids<'a>(response: &Value, batch: &HashSet<&'a str>) -> Option<HashSet<&'a str>> {
    let failures = match response.get("batchItemFailures") {
        None | Some(Value::Null) => return Some(HashSet::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return None,
    };
    failures
        .iter()
        .map(|item| {
            let id = item.get("itemIdentifier")?.as_str()?;
            batch.get(id).copied()
        })
        .collect()
}

fn sqs_record(message: &QueueMessage, arn: &str, region: &str) -> Value {
    json!({
        "messageId": message.message_id,
        "receiptHandle": message.receipt_handle,
        "body": message.body,
        "attributes": {
            "ApproximateReceiveCount": message.receive_count.to_string(),
            "SentTimestamp": message.sent_timestamp_ms.to_string(),
            "SenderId": localfaas_core::manifest::LOCAL_ACCOUNT_ID,
            "ApproximateFirstReceiveTimestamp": message.first_receive_timestamp_ms.to_string(),
        },
        "messageAttributes": {},
        "eventSource": "aws:sqs",
        "eventSourceARN": arn,
        "awsRegion": region,
    })
}

/// The record as filter patterns see it: a JSON body is matched
/// structurally, anything else as the raw string.
fn filter_view(record: &Value) -> Value {
    let mut view = record.as_object().cloned().unwrap_or_else(Map::new);
    if let Some(Value::String(body)) = view.get("body") {
        if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
            view.insert("body".into(), parsed);
        }
    }
    Value::Object(view)
}
