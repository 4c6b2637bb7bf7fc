//! Invocation service stack.
//!
//! 1. **Runner service** (`middleware::pipeline::RunnerService`): adapts a
//!    mounted [`Runner`](crate::runner::Runner) to `tower::Service`
//! 2. **Middleware** (`middleware`): Tower layers (load-shedding, metrics, timeout)
//! 3. **Background workers** (`worker`): channel-fed tasks with periodic ticks

pub mod middleware;
pub mod worker;

pub use middleware::{build_invocation_pipeline, InvocationPipeline};
pub use worker::{BackgroundRunnable, BackgroundWorker};
