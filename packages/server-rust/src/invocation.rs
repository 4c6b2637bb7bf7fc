//! Invocation request/response types and the invocation error taxonomy.

use std::time::Duration;

use localfaas_core::{function_arn, ErrorPayload, FunctionDefinition, InvocationContext, TriggerInfo};
use serde_json::Value;

use crate::runner::RunnerError;

/// One call of a function, as it travels through the invocation pipeline and
/// into a runner.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub request_id: String,
    pub function: String,
    pub event: Value,
    pub trigger: TriggerInfo,
    pub context: InvocationContext,
    /// `None` disables timeout enforcement for this call.
    pub timeout: Option<Duration>,
}

impl InvocationRequest {
    /// Builds a request with a fresh id and a context whose deadline is
    /// `budget` from now.
    ///
    /// `timeout` is the enforced limit; `None` leaves the call unbounded while
    /// the handler still sees `budget` as its remaining time.
    #[must_use]
    pub fn new(
        definition: &FunctionDefinition,
        region: &str,
        event: Value,
        trigger: TriggerInfo,
        client_context: Option<Value>,
        budget: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        Self {
            context: InvocationContext {
                function_name: definition.output_name().to_string(),
                function_version: "$LATEST".to_string(),
                invoked_function_arn: function_arn(region, definition.output_name()),
                memory_limit_in_mb: definition.memory_size,
                aws_request_id: request_id.clone(),
                deadline_ms: now_ms.saturating_add(budget_ms),
                client_context,
            },
            request_id,
            function: definition.name.clone(),
            event,
            trigger,
            timeout,
        }
    }
}

/// Successful result of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutput {
    /// Value returned by the handler, or passed to an explicit `succeed`.
    Value(Value),
    /// Response the handler produced incrementally.
    Streamed {
        content_type: Option<String>,
        body: String,
    },
}

impl InvocationOutput {
    /// JSON view of the result; a streamed body becomes a string.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Streamed { body, .. } => Value::String(body),
        }
    }

    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Streamed { .. } => None,
        }
    }
}

/// Errors returned by `FunctionInvoker::invoke`.
///
/// Every variant maps to the structured `{errorType, errorMessage, trace?}`
/// payload through [`InvokeError::payload`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("function {function} failed to mount: {message}")]
    MountFailed { function: String, message: String },
    #[error("handler error: {0}")]
    Handler(ErrorPayload),
    #[error("function {function} timed out after {timeout_ms}ms (request {request_id})")]
    Timeout {
        function: String,
        request_id: String,
        timeout_ms: u64,
    },
    #[error("runner protocol error: {message}")]
    Protocol { message: String },
    #[error("too many concurrent invocations")]
    Overloaded,
    #[error("unsupported runtime {runtime}")]
    Unsupported { runtime: String },
    #[error("function not found: {name}")]
    NotFound { name: String },
}

impl InvokeError {
    /// Structured payload returned to callers and failure destinations.
    #[must_use]
    pub fn payload(&self) -> ErrorPayload {
        match self {
            Self::MountFailed { message, .. } => {
                ErrorPayload::new("Runtime.ImportModuleError", message.clone())
            }
            Self::Handler(payload) => payload.clone(),
            Self::Timeout { timeout_ms, .. } => {
                #[allow(clippy::cast_precision_loss)]
                let secs = *timeout_ms as f64 / 1000.0;
                ErrorPayload::new("TimeoutError", format!("Task timed out after {secs:.2} seconds"))
            }
            Self::Protocol { message } => {
                ErrorPayload::new("Runtime.ProtocolError", message.clone())
            }
            Self::Overloaded => ErrorPayload::new("TooManyRequestsException", "Rate Exceeded."),
            Self::Unsupported { runtime } => ErrorPayload::new(
                "Runtime.Unsupported",
                format!("Runtime {runtime} is not supported"),
            ),
            Self::NotFound { name } => ErrorPayload::new(
                "ResourceNotFoundException",
                format!("Function not found: {name}"),
            ),
        }
    }

    /// Short label used for metrics and logs.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::MountFailed { .. } => "mount_failed",
            Self::Handler(_) => "error",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol_error",
            Self::Overloaded => "overloaded",
            Self::Unsupported { .. } => "unsupported",
            Self::NotFound { .. } => "not_found",
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn from_runner(function: &str, err: RunnerError) -> Self {
        match err {
            RunnerError::Handler(payload) => Self::Handler(payload),
            RunnerError::Protocol(message) => Self::Protocol { message },
            RunnerError::Unsupported { runtime } => Self::Unsupported { runtime },
            RunnerError::Mount(message) => Self::MountFailed {
                function: function.to_string(),
                message,
            },
            RunnerError::NotMounted => Self::Protocol {
                message: format!("runner for {function} is not mounted"),
            },
            RunnerError::Io(e) => Self::Protocol {
                message: e.to_string(),
            },
        }
    }
}

/// Request builders shared by unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use localfaas_core::{HandlerRef, Runtime, TriggerKind};

    use super::*;

    pub(crate) fn definition(name: &str) -> FunctionDefinition {
        FunctionDefinition::new(
            name,
            Runtime::Rhai,
            HandlerRef::try_from("handler.main".to_string()).unwrap(),
        )
    }

    pub(crate) fn request(function: &str, timeout: Option<Duration>) -> InvocationRequest {
        InvocationRequest::new(
            &definition(function),
            "us-east-1",
            Value::Null,
            TriggerInfo::new(TriggerKind::Invoke),
            None,
            Duration::from_secs(6),
            timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_payload_shape() {
        let err = InvokeError::Timeout {
            function: "slow".into(),
            request_id: "r".into(),
            timeout_ms: 3000,
        };
        let payload = err.payload();
        assert_eq!(payload.error_type, "TimeoutError");
        assert_eq!(payload.error_message, "Task timed out after 3.00 seconds");
        assert!(err.is_timeout());
    }

    #[test]
    fn handler_payload_passes_through() {
        let inner = ErrorPayload::new("ValidationError", "bad input").with_trace(vec!["at x".into()]);
        let err = InvokeError::Handler(inner.clone());
        assert_eq!(err.payload(), inner);
        assert_eq!(err.outcome(), "error");
    }

    #[test]
    fn runner_errors_are_classified() {
        let err = InvokeError::from_runner("f", RunnerError::Protocol("truncated".into()));
        assert_eq!(err.payload().error_type, "Runtime.ProtocolError");
        let err = InvokeError::from_runner("f", RunnerError::Mount("syntax error".into()));
        assert!(matches!(err, InvokeError::MountFailed { .. }));
    }

    #[test]
    fn new_request_carries_context() {
        let req = testing::request("hello", Some(Duration::from_secs(3)));
        assert_eq!(req.context.aws_request_id, req.request_id);
        assert_eq!(req.context.function_name, "hello");
        assert_eq!(
            req.context.invoked_function_arn,
            "arn:aws:lambda:us-east-1:000000000000:function:hello"
        );
        assert!(req.context.deadline_ms > 0);
        assert_ne!(req.request_id, testing::request("hello", None).request_id);
    }

    #[test]
    fn streamed_output_as_value() {
        let out = InvocationOutput::Streamed {
            content_type: Some("text/plain".into()),
            body: "abc".into(),
        };
        assert!(out.as_value().is_none());
        assert_eq!(out.into_value(), Value::String("abc".into()));
    }
}
