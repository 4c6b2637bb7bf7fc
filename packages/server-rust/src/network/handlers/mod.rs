//! HTTP handlers of the request server.
//!
//! `AppState` is the shared state carried through axum extractors; every
//! field is behind an `Arc` so cloning per request is cheap.

pub mod health;
pub mod invoke;
pub mod queue;
pub mod route;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use invoke::invoke_handler;
pub use queue::enqueue_handler;
pub use route::route_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::config::EmulatorConfig;
use crate::queue::QueueStore;
use crate::registry::EndpointRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EndpointRegistry>,
    pub queues: Arc<QueueStore>,
    pub emulator: Arc<EmulatorConfig>,
    /// Health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Used for uptime reporting.
    pub start_time: Instant,
}
