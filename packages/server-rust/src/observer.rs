//! Invocation observer trait and composite implementation.
//!
//! Defines [`InvocationObserver`] for reacting to invocation lifecycle events
//! of a `FunctionInvoker`, and [`CompositeInvocationObserver`] which fans out
//! notifications to multiple observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::invocation::{InvocationOutput, InvocationRequest, InvokeError};

/// Observer for invocations of one function.
///
/// Every method has an empty default so implementations only override the
/// events they care about. Used as `Arc<dyn InvocationObserver>`.
pub trait InvocationObserver: Send + Sync {
    /// Called before the request is handed to the runner.
    fn on_invoke(&self, _request: &InvocationRequest) {}

    /// Called after the handler produced a result.
    fn on_success(&self, _request: &InvocationRequest, _output: &InvocationOutput) {}

    /// Called after the invocation failed, timeouts included.
    fn on_error(&self, _request: &InvocationRequest, _error: &InvokeError) {}
}

/// Composite observer that fans out to multiple observers.
///
/// A panicking observer is logged and skipped; it never aborts the
/// invocation or the remaining observers.
#[derive(Default, Clone)]
pub struct CompositeInvocationObserver {
    observers: Vec<Arc<dyn InvocationObserver>>,
}

impl CompositeInvocationObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn InvocationObserver>>) -> Self {
        Self { observers }
    }

    pub fn add(&mut self, observer: Arc<dyn InvocationObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn each(&self, event: &'static str, request: &InvocationRequest, f: impl Fn(&dyn InvocationObserver)) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                tracing::warn!(
                    function = %request.function,
                    request_id = %request.request_id,
                    event,
                    "invocation observer panicked"
                );
            }
        }
    }
}

impl InvocationObserver for CompositeInvocationObserver {
    fn on_invoke(&self, request: &InvocationRequest) {
        self.each("invoke", request, |o| o.on_invoke(request));
    }

    fn on_success(&self, request: &InvocationRequest, output: &InvocationOutput) {
        self.each("success", request, |o| o.on_success(request, output));
    }

    fn on_error(&self, request: &InvocationRequest, error: &InvokeError) {
        self.each("error", request, |o| o.on_error(request, error));
    }
}
