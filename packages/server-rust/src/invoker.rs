//! Per-function invocation lifecycle.
//!
//! A [`FunctionInvoker`] owns one runner and drives every invocation of its
//! function through it:
//!
//! 1. mount on first use (single-flight; concurrent callers share the outcome)
//! 2. notify observers and run the request through the invocation pipeline
//!    (load shedding, metrics, timeout)
//! 3. report completion to the runner, then deliver the outcome to the
//!    function's destinations when the trigger is asynchronous
//! 4. re-arm the idle timer that unmounts the runner after inactivity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use localfaas_core::{Destination, FunctionDefinition, TriggerInfo};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::EmulatorConfig;
use crate::delivery::{error_value, Delivery, DeliverySink};
use crate::invocation::{InvocationOutput, InvocationRequest, InvokeError};
use crate::observer::{CompositeInvocationObserver, InvocationObserver};
use crate::runner::{create_runner, Runner, RunnerEvent, RunnerState};
use crate::service::{build_invocation_pipeline, InvocationPipeline};

pub const COLD_STARTS_TOTAL: &str = "localfaas_cold_starts_total";

/// Mount state as published to waiters.
#[derive(Debug, Clone)]
struct MountStatus {
    state: RunnerState,
    /// Error of the last failed mount while `state` is `Failed`.
    failure: Option<InvokeError>,
}

impl MountStatus {
    fn new(state: RunnerState) -> Self {
        Self { state, failure: None }
    }
}

pub struct FunctionInvoker {
    definition: Arc<FunctionDefinition>,
    config: Arc<EmulatorConfig>,
    runner: Arc<dyn Runner>,
    pipeline: Mutex<InvocationPipeline>,
    status: Arc<watch::Sender<MountStatus>>,
    mount_lock: tokio::sync::Mutex<()>,
    observers: RwLock<CompositeInvocationObserver>,
    sink: Option<Arc<dyn DeliverySink>>,
    in_flight: AtomicUsize,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    this: Weak<FunctionInvoker>,
}

impl FunctionInvoker {
    /// Creates the invoker and the runner matching the function's runtime.
    #[must_use]
    pub fn new(
        definition: FunctionDefinition,
        config: Arc<EmulatorConfig>,
        sink: Option<Arc<dyn DeliverySink>>,
    ) -> Arc<Self> {
        let runner = create_runner(&definition, &config);
        Self::with_runner(definition, runner, config, sink)
    }

    /// Creates the invoker around an existing runner.
    #[must_use]
    pub fn with_runner(
        definition: FunctionDefinition,
        runner: Arc<dyn Runner>,
        config: Arc<EmulatorConfig>,
        sink: Option<Arc<dyn DeliverySink>>,
    ) -> Arc<Self> {
        let status = Arc::new(watch::Sender::new(MountStatus::new(RunnerState::Unmounted)));
        install_runner_hook(&runner, &status, &definition.name);
        let pipeline = build_invocation_pipeline(Arc::clone(&runner), &config);

        Arc::new_cyclic(|this| Self {
            definition: Arc::new(definition),
            config,
            runner,
            pipeline: Mutex::new(pipeline),
            status,
            mount_lock: tokio::sync::Mutex::new(()),
            observers: RwLock::new(CompositeInvocationObserver::default()),
            sink,
            in_flight: AtomicUsize::new(0),
            idle_timer: Mutex::new(None),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.status.borrow().state
    }

    /// Invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn add_observer(&self, observer: Arc<dyn InvocationObserver>) {
        self.observers.write().add(observer);
    }

    /// Clears a failed mount so the next invocation retries it.
    pub fn reset(&self) {
        self.status.send_if_modified(|status| {
            if status.state == RunnerState::Failed {
                *status = MountStatus::new(RunnerState::Unmounted);
                true
            } else {
                false
            }
        });
    }

    /// Runs one invocation to completion.
    ///
    /// # Errors
    ///
    /// Returns the classified failure: mount failure, handler error, timeout,
    /// protocol error or overload. Every variant converts to the structured
    /// error payload via [`InvokeError::payload`].
    pub async fn invoke(
        &self,
        event: Value,
        trigger: TriggerInfo,
        client_context: Option<Value>,
    ) -> Result<InvocationOutput, InvokeError> {
        let budget = Duration::from_secs(self.definition.timeout_secs(self.config.default_timeout_secs));
        let timeout = self.config.timeouts_enabled.then_some(budget);
        let request = InvocationRequest::new(
            &self.definition,
            &self.config.region,
            event,
            trigger,
            client_context,
            budget,
            timeout,
        );

        let result = {
            let _counted = InFlight::enter(&self.in_flight);
            self.run(&request).await
        };

        self.settle(&request, &result).await;
        self.arm_idle_timer();
        result
    }

    async fn run(&self, request: &InvocationRequest) -> Result<InvocationOutput, InvokeError> {
        self.ensure_mounted().await?;
        self.observers.read().on_invoke(request);

        let pipeline = self.pipeline.lock().clone();
        let result = pipeline.oneshot(request.clone()).await;
        let timed_out = matches!(&result, Err(e) if e.is_timeout());
        self.runner.on_complete(&request.request_id, timed_out);
        result
    }

    /// Observers, logging and destination delivery after an invocation.
    async fn settle(&self, request: &InvocationRequest, result: &Result<InvocationOutput, InvokeError>) {
        let is_async = request.trigger.is_async();
        match result {
            Ok(output) => {
                self.observers.read().on_success(request, output);
                if is_async {
                    if let Some(dest) = &self.definition.on_success {
                        let payload = output.clone().into_value();
                        self.deliver(dest, request, payload, true, false).await;
                    }
                }
            }
            Err(err) => {
                self.observers.read().on_error(request, err);
                let payload = err.payload();
                warn!(
                    function = %self.name(),
                    request_id = %request.request_id,
                    error_type = %payload.error_type,
                    error = %payload.error_message,
                    "invocation failed"
                );
                let has_sinks = self.definition.on_failure.is_some() || self.definition.dead_letter.is_some();
                if !is_async {
                    if has_sinks {
                        debug!(function = %self.name(), "synchronous trigger, failure destinations not notified");
                    }
                    return;
                }
                let payload = error_value(&payload);
                if let Some(dest) = &self.definition.on_failure {
                    self.deliver(dest, request, payload.clone(), false, false).await;
                }
                if let Some(dest) = &self.definition.dead_letter {
                    self.deliver(dest, request, payload, false, true).await;
                }
            }
        }
    }

    async fn deliver(&self, destination: &Destination, request: &InvocationRequest, payload: Value, success: bool, dead_letter: bool) {
        let Some(sink) = &self.sink else {
            debug!(function = %self.name(), destination = %destination.name, "no delivery sink configured");
            return;
        };
        sink.deliver(Delivery {
            destination: destination.clone(),
            function: self.definition.output_name().to_string(),
            request_id: request.request_id.clone(),
            event: request.event.clone(),
            payload,
            success,
            dead_letter,
        })
        .await;
    }

    /// Mounts the runner unless it already is. Concurrent callers wait for
    /// and share a single mount attempt.
    async fn ensure_mounted(&self) -> Result<(), InvokeError> {
        let mut rx = self.status.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s.state, RunnerState::Reloading | RunnerState::Mounting))
            .await
            .map(|s| s.clone())
            .map_err(|_| InvokeError::Protocol {
                message: "invoker state channel closed".into(),
            })?;
        if let Some(result) = Self::settled_outcome(&settled) {
            return result;
        }

        let _mount = self.mount_lock.lock().await;
        let current = self.status.borrow().clone();
        if let Some(result) = Self::settled_outcome(&current) {
            return result;
        }

        self.status.send_replace(MountStatus::new(RunnerState::Mounting));
        info!(function = %self.name(), runtime = %self.definition.runtime, "cold start");
        metrics::counter!(COLD_STARTS_TOTAL, "function" => self.name().to_string()).increment(1);

        match self.runner.mount().await {
            Ok(()) => {
                self.status.send_replace(MountStatus::new(RunnerState::Mounted));
                Ok(())
            }
            Err(e) => {
                let err = match InvokeError::from_runner(self.name(), e) {
                    InvokeError::Protocol { message } => InvokeError::MountFailed {
                        function: self.name().to_string(),
                        message,
                    },
                    other => other,
                };
                error!(function = %self.name(), error = %err, "mount failed");
                self.status.send_replace(MountStatus {
                    state: RunnerState::Failed,
                    failure: Some(err.clone()),
                });
                Err(err)
            }
        }
    }

    /// `Some` when no mount is needed: `Ok` if mounted, the stored error if
    /// the last mount failed.
    fn settled_outcome(status: &MountStatus) -> Option<Result<(), InvokeError>> {
        match status.state {
            RunnerState::Mounted => Some(Ok(())),
            RunnerState::Failed => Some(Err(status.failure.clone().unwrap_or_else(|| InvokeError::Protocol {
                message: "runner failed".into(),
            }))),
            RunnerState::Unmounted | RunnerState::Mounting | RunnerState::Reloading => None,
        }
    }

    fn arm_idle_timer(&self) {
        let idle = self.config.idle_eviction;
        let this = self.this.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(invoker) = this.upgrade() {
                invoker.evict_idle().await;
            }
        });
        if let Some(previous) = self.idle_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    async fn evict_idle(&self) {
        let _mount = self.mount_lock.lock().await;
        if self.state() != RunnerState::Mounted || self.in_flight() > 0 {
            return;
        }
        info!(function = %self.name(), "unmounting idle runner");
        // Callers arriving during teardown must remount, not reach the old runner.
        self.status.send_replace(MountStatus::new(RunnerState::Unmounted));
        self.runner.unmount(false).await;
    }

    /// Unmounts the runner now, e.g. on shutdown.
    pub async fn unmount(&self, force: bool) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
        }
        let _mount = self.mount_lock.lock().await;
        self.status.send_replace(MountStatus::new(RunnerState::Unmounted));
        self.runner.unmount(force).await;
    }
}

/// Counts one running invocation for as long as it lives, including when the
/// caller drops the invocation future.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for FunctionInvoker {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Maps runner-initiated lifecycle changes onto the mount state.
fn install_runner_hook(runner: &Arc<dyn Runner>, status: &Arc<watch::Sender<MountStatus>>, function: &str) {
    let status = Arc::downgrade(status);
    let function = function.to_string();
    runner.set_event_hook(Arc::new(move |event| {
        let Some(status) = status.upgrade() else { return };
        let next = match &event {
            RunnerEvent::Reloading => RunnerState::Reloading,
            RunnerEvent::Reloaded { mounted: true } => RunnerState::Mounted,
            RunnerEvent::Reloaded { mounted: false } => RunnerState::Unmounted,
            RunnerEvent::Uncaught(reason) | RunnerEvent::Protocol(reason) => {
                warn!(function = %function, %reason, "runner torn down, remounting on next invocation");
                RunnerState::Unmounted
            }
            RunnerEvent::Exited => {
                warn!(function = %function, "runner exited, remounting on next invocation");
                RunnerState::Unmounted
            }
        };
        status.send_replace(MountStatus::new(next));
    }));
}
