//! Load-shedding middleware for invocations.
//!
//! Rejects invocations once a function already has `max_concurrent` calls in
//! flight, failing them with `InvokeError::Overloaded`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::invocation::{InvocationOutput, InvocationRequest, InvokeError};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent invocations via a semaphore.
///
/// When all permits are taken, incoming invocations are rejected immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<InvocationRequest> for LoadShedService<S>
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
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            tracing::warn!(function = %req.function, "concurrency limit reached, shedding invocation");
            return Box::pin(async { Err(InvokeError::Overloaded) });
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
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
    async fn allows_invocations_under_limit() {
        let svc = LoadShedLayer::new(10).layer(SlowService {
            delay: Duration::from_millis(1),
        });
        assert!(svc.oneshot(request("f", None)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let layer = LoadShedLayer::new(1);
        let mut svc = layer.layer(SlowService {
            delay: Duration::from_millis(500),
        });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        // The permit is taken in `call`, before the future is polled.
        let in_flight = tokio::spawn(svc.call(request("f", None)));

        let err = svc.call(request("f", None)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Overloaded));

        in_flight.await.unwrap().unwrap();
        assert!(svc.call(request("f", None)).await.is_ok());
    }
}
