//! Function runners: the execution backends behind a `FunctionInvoker`.
//!
//! - [`thread`]: Rhai scripts on a dedicated in-process worker thread
//! - [`process`]: Python/Ruby handlers in an interpreter subprocess
//! - [`UnsupportedRuntime`]: placeholder for runtimes with no backend
//!
//! A runner is mounted once and then shared by every concurrent invocation
//! of its function; it multiplexes in-flight calls by request id.

mod pending;
pub mod process;
pub mod thread;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use localfaas_core::{FunctionDefinition, Runtime};

use crate::config::EmulatorConfig;
use crate::invocation::{InvocationOutput, InvocationRequest};

pub use process::ProcessRunner;
pub use thread::ThreadRunner;

/// Log target for output produced by handler code.
pub const HANDLER_TARGET: &str = "localfaas::handler";

/// Mount state of a function's runner, as tracked by its invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Unmounted,
    Mounting,
    Mounted,
    /// Subprocess is being respawned after a source change.
    Reloading,
    /// Last mount failed; invocations fail fast until reset.
    Failed,
}

/// Lifecycle changes a runner initiates on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// The worker raised an error outside any invocation and was torn down.
    Uncaught(String),
    /// The worker sent a frame that could not be decoded and was torn down.
    Protocol(String),
    /// The worker exited unexpectedly.
    Exited,
    /// Handler source changed; the worker is being respawned.
    Reloading,
    /// Respawn finished; `mounted` tells whether the new worker is up.
    Reloaded { mounted: bool },
}

/// Callback through which a runner reports [`RunnerEvent`]s to its owner.
pub type RunnerHook = Arc<dyn Fn(RunnerEvent) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("runner is not mounted")]
    NotMounted,
    #[error("handler error: {0}")]
    Handler(localfaas_core::ErrorPayload),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported runtime {runtime}")]
    Unsupported { runtime: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Execution backend for one function.
///
/// Implementations never enforce timeouts themselves; the invoker races
/// `invoke` against its own timer and reports the outcome via `on_complete`.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Starts the worker and loads the handler.
    async fn mount(&self) -> Result<(), RunnerError>;

    /// Stops the worker. `force` skips waiting for in-flight calls.
    async fn unmount(&self, force: bool);

    /// Runs one invocation to completion.
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, RunnerError>;

    /// Reports that an invocation finished on the host side.
    fn on_complete(&self, request_id: &str, timed_out: bool);

    fn is_mounted(&self) -> bool;

    /// Installs the callback fired on runner-initiated lifecycle changes.
    fn set_event_hook(&self, hook: RunnerHook);
}

/// Builds the runner matching a function's runtime.
#[must_use]
pub fn create_runner(definition: &FunctionDefinition, config: &EmulatorConfig) -> Arc<dyn Runner> {
    match &definition.runtime {
        Runtime::Rhai => Arc::new(ThreadRunner::new(definition.clone())),
        Runtime::Python(_) | Runtime::Ruby(_) => {
            Arc::new(ProcessRunner::new(definition.clone(), config))
        }
        Runtime::Unsupported(tag) => Arc::new(UnsupportedRuntime::new(tag.clone())),
    }
}

// ---------------------------------------------------------------------------
// UnsupportedRuntime
// ---------------------------------------------------------------------------

/// Runner for runtimes with no backend: mounts fine, every invocation fails
/// with `Runtime.Unsupported`.
#[derive(Debug)]
pub struct UnsupportedRuntime {
    runtime: String,
}

impl UnsupportedRuntime {
    #[must_use]
    pub fn new(runtime: String) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Runner for UnsupportedRuntime {
    async fn mount(&self) -> Result<(), RunnerError> {
        tracing::warn!(runtime = %self.runtime, "no runner available for runtime");
        Ok(())
    }

    async fn unmount(&self, _force: bool) {}

    async fn invoke(&self, _request: InvocationRequest) -> Result<InvocationOutput, RunnerError> {
        Err(RunnerError::Unsupported {
            runtime: self.runtime.clone(),
        })
    }

    fn on_complete(&self, _request_id: &str, _timed_out: bool) {}

    fn is_mounted(&self) -> bool {
        true
    }

    fn set_event_hook(&self, _hook: RunnerHook) {}
}
