//! Success/failure destinations.
//!
//! The invoker decides *whether* an invocation outcome is delivered; a
//! [`DeliverySink`] decides *how*. [`LocalDelivery`] is the in-process sink:
//! function targets are invoked asynchronously, queue targets are enqueued in
//! the local [`QueueStore`], and topic targets are broadcast to in-process
//! subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use localfaas_core::{function_arn, Destination, DestinationKind, TriggerInfo, TriggerKind};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::queue::QueueStore;
use crate::registry::EndpointRegistry;
use crate::service::{BackgroundRunnable, BackgroundWorker};

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 256;

/// Interval of the delivery statistics log.
const STATS_INTERVAL_MS: u64 = 60_000;

/// One outcome to deliver to one destination.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: Destination,
    /// Output name of the function that produced the outcome.
    pub function: String,
    pub request_id: String,
    /// The event the function was invoked with.
    pub event: Value,
    /// Handler result on success, error payload on failure.
    pub payload: Value,
    pub success: bool,
    /// Dead-letter deliveries carry the original event instead of a
    /// destination record.
    pub dead_letter: bool,
}

/// Receiver of invocation outcomes.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Hands one delivery to the sink. Must not wait for the target.
    async fn deliver(&self, delivery: Delivery);
}

// ---------------------------------------------------------------------------
// Destination record
// ---------------------------------------------------------------------------

/// Envelope function and queue destinations receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRecord {
    pub version: &'static str,
    pub timestamp: String,
    pub request_context: RequestContext,
    pub request_payload: Value,
    pub response_context: ResponseContext,
    pub response_payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub request_id: String,
    pub function_arn: String,
    /// `Success` or `RetriesExhausted`.
    pub condition: &'static str,
    pub approximate_invoke_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseContext {
    pub status_code: u16,
    pub executed_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_error: Option<&'static str>,
}

impl DestinationRecord {
    #[must_use]
    pub fn new(delivery: &Delivery, region: &str) -> Self {
        Self {
            version: "1.0",
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            request_context: RequestContext {
                request_id: delivery.request_id.clone(),
                function_arn: format!("{}:$LATEST", function_arn(region, &delivery.function)),
                condition: if delivery.success { "Success" } else { "RetriesExhausted" },
                approximate_invoke_count: 1,
            },
            request_payload: delivery.event.clone(),
            response_context: ResponseContext {
                status_code: 200,
                executed_version: "$LATEST",
                function_error: (!delivery.success).then_some("Unhandled"),
            },
            response_payload: delivery.payload.clone(),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Message published to a local topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopicMessage {
    pub topic_arn: String,
    pub message: String,
    pub message_attributes: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// LocalDelivery
// ---------------------------------------------------------------------------

type Topics = Arc<RwLock<HashMap<String, broadcast::Sender<TopicMessage>>>>;

/// In-process delivery sink backed by a [`BackgroundWorker`].
pub struct LocalDelivery {
    worker: BackgroundWorker<DeliveryRunnable>,
    topics: Topics,
}

impl LocalDelivery {
    /// Starts the delivery worker. Function targets are looked up in
    /// `registry` at delivery time.
    pub fn start(registry: Weak<EndpointRegistry>, queues: Arc<QueueStore>, region: impl Into<String>) -> Self {
        let topics: Topics = Arc::default();
        let runnable = DeliveryRunnable {
            registry,
            queues,
            topics: Arc::clone(&topics),
            region: region.into(),
            delivered: 0,
            failed: 0,
            reported: (0, 0),
        };
        Self {
            worker: BackgroundWorker::start(runnable, STATS_INTERVAL_MS),
            topics,
        }
    }

    /// Subscribes to messages published on `topic`.
    #[must_use]
    pub fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<TopicMessage> {
        topic_sender(&self.topics, topic).subscribe()
    }

    /// Stops the worker after pending deliveries are processed.
    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

#[async_trait]
impl DeliverySink for LocalDelivery {
    async fn deliver(&self, delivery: Delivery) {
        if let Err(e) = self.worker.submit(delivery).await {
            warn!(error = %e, "dropping destination delivery");
        }
    }
}

fn topic_sender(topics: &Topics, topic: &str) -> broadcast::Sender<TopicMessage> {
    if let Some(tx) = topics.read().get(topic) {
        return tx.clone();
    }
    topics
        .write()
        .entry(topic.to_string())
        .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
        .clone()
}

struct DeliveryRunnable {
    registry: Weak<EndpointRegistry>,
    queues: Arc<QueueStore>,
    topics: Topics,
    region: String,
    delivered: u64,
    failed: u64,
    reported: (u64, u64),
}

impl DeliveryRunnable {
    fn deliver_to_function(&self, delivery: &Delivery, body: Value) -> Result<(), String> {
        let registry = self.registry.upgrade().ok_or("registry is gone")?;
        let invoker = registry
            .get_by_name(&delivery.destination.name)
            .ok_or_else(|| format!("function {} is not registered", delivery.destination.name))?;
        tokio::spawn(async move {
            // Destination hops are async invocations; their own outcome is
            // delivered by the target's invoker.
            let _ = invoker.invoke(body, TriggerInfo::new(TriggerKind::Async), None).await;
        });
        Ok(())
    }

    fn deliver_to_queue(&self, delivery: &Delivery, body: &Value) {
        let queue = self.queues.get_or_create(&delivery.destination.name);
        queue.send(body.to_string());
    }

    fn deliver_to_topic(&self, delivery: &Delivery, body: &Value) {
        let topic = &delivery.destination.name;
        let mut attributes = HashMap::new();
        let message = if delivery.success {
            body.to_string()
        } else {
            attributes.insert("RequestID".to_string(), delivery.request_id.clone());
            attributes.insert("ErrorCode".to_string(), "200".to_string());
            attributes.insert(
                "ErrorMessage".to_string(),
                delivery.payload["errorMessage"].as_str().unwrap_or_default().to_string(),
            );
            match &delivery.event {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        };
        let message = TopicMessage {
            topic_arn: format!("arn:aws:sns:{}:{}:{topic}", self.region, localfaas_core::manifest::LOCAL_ACCOUNT_ID),
            message,
            message_attributes: attributes,
        };
        let receivers = topic_sender(&self.topics, topic).send(message.clone()).unwrap_or(0);
        info!(topic = %topic, receivers, message = %message.message, "published to topic");
    }
}

#[async_trait]
impl BackgroundRunnable for DeliveryRunnable {
    type Task = Delivery;

    async fn run(&mut self, delivery: Delivery) {
        let body = if delivery.dead_letter {
            delivery.event.clone()
        } else {
            DestinationRecord::new(&delivery, &self.region).to_value()
        };
        let kind = delivery.destination.kind;
        let result = match kind {
            DestinationKind::Function => self.deliver_to_function(&delivery, body),
            DestinationKind::Queue => {
                self.deliver_to_queue(&delivery, &body);
                Ok(())
            }
            DestinationKind::Topic => {
                self.deliver_to_topic(&delivery, &body);
                Ok(())
            }
        };
        match result {
            Ok(()) => {
                self.delivered += 1;
                info!(
                    function = %delivery.function,
                    request_id = %delivery.request_id,
                    destination = %delivery.destination.name,
                    kind = kind.as_str(),
                    success = delivery.success,
                    "delivered invocation outcome"
                );
            }
            Err(reason) => {
                self.failed += 1;
                warn!(
                    function = %delivery.function,
                    destination = %delivery.destination.name,
                    kind = kind.as_str(),
                    %reason,
                    "destination delivery failed"
                );
            }
        }
    }

    async fn on_tick(&mut self) {
        if self.reported != (self.delivered, self.failed) {
            self.reported = (self.delivered, self.failed);
            debug!(delivered = self.delivered, failed = self.failed, "destination delivery totals");
        }
    }
}

/// Failure payload for dead-letter and failure destinations.
#[must_use]
pub fn error_value(payload: &localfaas_core::ErrorPayload) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| json!({ "errorMessage": payload.error_message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;

    fn delivery(kind: DestinationKind, name: &str, success: bool) -> Delivery {
        Delivery {
            destination: Destination {
                kind,
                name: name.into(),
            },
            function: "producer".into(),
            request_id: "req-1".into(),
            event: json!({ "order": 7 }),
            payload: if success {
                json!({ "ok": true })
            } else {
                json!({ "errorType": "Error", "errorMessage": "boom" })
            },
            success,
            dead_letter: false,
        }
    }

    #[test]
    fn destination_record_shape() {
        let record = DestinationRecord::new(&delivery(DestinationKind::Queue, "q", false), "eu-west-3").to_value();
        assert_eq!(record["version"], "1.0");
        assert_eq!(record["requestContext"]["requestId"], "req-1");
        assert_eq!(record["requestContext"]["condition"], "RetriesExhausted");
        assert_eq!(
            record["requestContext"]["functionArn"],
            "arn:aws:lambda:eu-west-3:000000000000:function:producer:$LATEST"
        );
        assert_eq!(record["requestPayload"]["order"], 7);
        assert_eq!(record["responseContext"]["functionError"], "Unhandled");
        assert_eq!(record["responsePayload"]["errorMessage"], "boom");

        let ok = DestinationRecord::new(&delivery(DestinationKind::Queue, "q", true), "us-east-1").to_value();
        assert_eq!(ok["requestContext"]["condition"], "Success");
        assert!(ok["responseContext"].get("functionError").is_none());
    }

    #[tokio::test]
    async fn queue_and_topic_targets() {
        let queues = Arc::new(QueueStore::new(&EmulatorConfig::default()));
        let sink = LocalDelivery::start(Weak::new(), Arc::clone(&queues), "us-east-1");
        let mut topic = sink.subscribe_topic("alerts");

        sink.deliver(delivery(DestinationKind::Queue, "results", true)).await;
        sink.deliver(delivery(DestinationKind::Topic, "alerts", false)).await;
        let mut dlq = delivery(DestinationKind::Queue, "dlq", false);
        dlq.dead_letter = true;
        sink.deliver(dlq).await;
        sink.stop().await;

        let results = queues.get("results").unwrap();
        assert_eq!(results.approximate_count(), 1);
        let dlq = queues.get("dlq").unwrap();
        assert_eq!(dlq.approximate_count(), 1);

        let published = topic.recv().await.unwrap();
        assert_eq!(published.topic_arn, "arn:aws:sns:us-east-1:000000000000:alerts");
        assert_eq!(published.message, r#"{"order":7}"#);
        assert_eq!(published.message_attributes["ErrorMessage"], "boom");
    }

    #[tokio::test]
    async fn missing_function_target_is_logged_not_fatal() {
        let queues = Arc::new(QueueStore::new(&EmulatorConfig::default()));
        let sink = LocalDelivery::start(Weak::new(), queues, "us-east-1");
        sink.deliver(delivery(DestinationKind::Function, "nobody", true)).await;
        sink.stop().await;
    }
}
