//! Tower middleware layers for the invocation pipeline.
//!
//! - [`timeout`]: Per-invocation timeout enforcement
//! - [`metrics`]: Invocation timing, counters and the `invocation` span
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers around a runner

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_invocation_pipeline, InvocationPipeline, RunnerService};
pub use timeout::TimeoutLayer;
