//! Timeout middleware for invocations.
//!
//! Races each invocation against its `timeout` and fails it with
//! `InvokeError::Timeout` when the timer wins. Requests without a timeout
//! (timeouts disabled) run unbounded.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::invocation::{InvocationOutput, InvocationRequest, InvokeError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-invocation timeout enforcement.
///
/// The timeout is read from each request's `timeout` field, so functions with
/// different budgets can share one layer.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-invocation timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<InvocationRequest> for TimeoutService<S>
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
        let Some(duration) = req.timeout else {
            return Box::pin(self.inner.call(req));
        };
        let function = req.function.clone();
        let request_id = req.request_id.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(InvokeError::Timeout {
                    function,
                    request_id,
                    timeout_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::invocation::testing::request;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay: Duration,
    }

    impl Service<InvocationRequest> for SlowService {
        type Response = InvocationOutput;
        type Error = InvokeError;
        type Future = Pin<Box<dyn Future<Output = Result<InvocationOutput, InvokeError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: InvocationRequest) -> Self::Future {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(InvocationOutput::Value(Value::Null))
            })
        }
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(SlowService {
            delay: Duration::from_millis(10),
        });
        let out = svc.oneshot(request("f", Some(Duration::from_secs(1)))).await.unwrap();
        assert_eq!(out, InvocationOutput::Value(Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_at_the_deadline_not_before() {
        let svc = TimeoutLayer.layer(SlowService {
            delay: Duration::from_secs(3600),
        });
        let started = tokio::time::Instant::now();
        let err = svc.oneshot(request("f", Some(Duration::from_secs(3)))).await.unwrap_err();
        assert!(matches!(err, InvokeError::Timeout { timeout_ms: 3000, ref function, .. } if function == "f"));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_runs_unbounded() {
        let svc = TimeoutLayer.layer(SlowService {
            delay: Duration::from_secs(3600),
        });
        assert!(svc.oneshot(request("f", None)).await.is_ok());
    }
}
