//! Trigger classification for invocations.
//!
//! Every invocation carries a [`TriggerInfo`] describing what caused it. The
//! invoker uses the classification to decide whether success/failure
//! destinations fire: only asynchronous triggers deliver to sinks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What caused an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    /// API-gateway style HTTP request.
    Gateway,
    /// Load-balancer style HTTP request.
    Balancer,
    /// Direct synchronous invoke through the invoke API.
    Invoke,
    /// Direct asynchronous invoke (`Event` invocation type) or destination hop.
    Async,
    /// Queue event source mapping batch.
    Queue,
    /// Stream event source mapping batch.
    Stream,
    /// Object storage notification.
    Storage,
    /// Pub/sub topic notification.
    PubSub,
}

impl TriggerKind {
    /// Returns `true` for trigger kinds the platform always treats as
    /// asynchronous.
    #[must_use]
    pub fn is_async(self) -> bool {
        match self {
            Self::Async | Self::Queue | Self::Stream | Self::Storage | Self::PubSub => true,
            Self::Gateway | Self::Balancer | Self::Invoke => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Balancer => "balancer",
            Self::Invoke => "invoke",
            Self::Async => "async",
            Self::Queue => "queue",
            Self::Stream => "stream",
            Self::Storage => "storage",
            Self::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger metadata passed alongside each invocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    /// Forces asynchronous classification regardless of `kind`, e.g. an HTTP
    /// endpoint declared `async: true`.
    #[serde(default, rename = "async")]
    pub force_async: bool,
}

impl TriggerInfo {
    #[must_use]
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            force_async: false,
        }
    }

    #[must_use]
    pub fn with_async(mut self, force_async: bool) -> Self {
        self.force_async = force_async;
        self
    }

    /// Whether destinations should be notified for this invocation.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.force_async || self.kind.is_async()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_triggers_are_sync() {
        assert!(!TriggerInfo::new(TriggerKind::Gateway).is_async());
        assert!(!TriggerInfo::new(TriggerKind::Balancer).is_async());
        assert!(!TriggerInfo::new(TriggerKind::Invoke).is_async());
    }

    #[test]
    fn event_triggers_are_async() {
        for kind in [
            TriggerKind::Async,
            TriggerKind::Queue,
            TriggerKind::Stream,
            TriggerKind::Storage,
            TriggerKind::PubSub,
        ] {
            assert!(TriggerInfo::new(kind).is_async(), "{kind} should be async");
        }
    }

    #[test]
    fn explicit_flag_forces_async() {
        let info = TriggerInfo::new(TriggerKind::Balancer).with_async(true);
        assert!(info.is_async());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(TriggerInfo::new(TriggerKind::PubSub)).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "pubSub", "async": false }));
    }
}
