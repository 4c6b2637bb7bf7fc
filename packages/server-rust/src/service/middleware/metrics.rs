//! Metrics middleware for invocations.
//!
//! Wraps each invocation in an `invocation` span carrying its duration and
//! outcome, and records the `localfaas_invocations_total` counter and the
//! `localfaas_invocation_duration_ms` histogram through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::invocation::{InvocationOutput, InvocationRequest, InvokeError};

pub const INVOCATIONS_TOTAL: &str = "localfaas_invocations_total";
pub const INVOCATION_DURATION_MS: &str = "localfaas_invocation_duration_ms";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records invocation duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<InvocationRequest> for MetricsService<S>
where
    S: Service<InvocationRequest, Response = InvocationOutput, Error = InvokeError> + Send,
    S::Future: Send + 'static,
{
    type Response = InvocationOutput;
    type Error = InvokeError;
    type Future = Pin<Box<dyn Future<Output = Result<InvocationOutput, InvokeError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: InvocationRequest) -> Self::Future {
        let function = req.function.clone();
        let span = info_span!(
            "invocation",
            function = %req.function,
            request_id = %req.request_id,
            trigger = %req.trigger.kind,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.outcome(),
                };

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::info!(function = %function, duration_ms, outcome, "invocation complete");

                metrics::counter!(INVOCATIONS_TOTAL, "function" => function.clone(), "outcome" => outcome)
                    .increment(1);
                #[allow(clippy::cast_precision_loss)]
                metrics::histogram!(INVOCATION_DURATION_MS, "function" => function).record(duration_ms as f64);

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
