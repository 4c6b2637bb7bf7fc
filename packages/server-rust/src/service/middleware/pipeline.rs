//! Pipeline composition: wraps a function's runner in the middleware stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder};

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::config::EmulatorConfig;
use crate::invocation::{InvocationOutput, InvocationRequest, InvokeError};
use crate::runner::Runner;

/// Type-erased invocation pipeline of one function.
pub type InvocationPipeline = BoxCloneService<InvocationRequest, InvocationOutput, InvokeError>;

// ---------------------------------------------------------------------------
// RunnerService
// ---------------------------------------------------------------------------

/// Innermost service: hands the request to the runner and classifies its
/// errors.
#[derive(Clone)]
pub struct RunnerService {
    runner: Arc<dyn Runner>,
}

impl RunnerService {
    #[must_use]
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }
}

impl Service<InvocationRequest> for RunnerService {
    type Response = InvocationOutput;
    type Error = InvokeError;
    type Future = Pin<Box<dyn Future<Output = Result<InvocationOutput, InvokeError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: InvocationRequest) -> Self::Future {
        let runner = Arc::clone(&self.runner);
        Box::pin(async move {
            let function = req.function.clone();
            runner
                .invoke(req)
                .await
                .map_err(|e| InvokeError::from_runner(&function, e))
        })
    }
}

/// Build the invocation pipeline around `runner`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when the function is saturated (fail fast)
/// 2. `MetricsLayer` -- record timing and outcome, timeouts included
/// 3. `TimeoutLayer` -- race the runner against the request's timeout
#[must_use]
pub fn build_invocation_pipeline(runner: Arc<dyn Runner>, config: &EmulatorConfig) -> InvocationPipeline {
    let service = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_invocations))
        .layer(MetricsLayer)
        .layer(TimeoutLayer)
        .service(RunnerService::new(runner));
    BoxCloneService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
