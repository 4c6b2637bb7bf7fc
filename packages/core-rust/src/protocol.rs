//! Runner wire protocol.
//!
//! Runners talk to their worker (an in-process thread or an interpreter
//! subprocess) with JSON envelopes tagged by `channel`:
//!
//! - host to worker: `import` (load handler), `exec` (run one invocation),
//!   `complete` (invocation finished or timed out on the host side);
//! - worker to host: `ready` (import acknowledged), `return`, `succeed`,
//!   `fail`, `stream` (per invocation) and `fatal` (uncaught error outside an
//!   invocation).
//!
//! Subprocess workers write replies on stdout prefixed by
//! [`RESPONSE_SENTINEL`] and out-of-band errors on stderr prefixed by
//! [`ERROR_SENTINEL`]. Any other line is handler log output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of a stdout line carrying a [`WorkerReply`].
pub const RESPONSE_SENTINEL: &str = "__|response|__";
/// Prefix of a stderr line carrying an [`ErrorPayload`].
pub const ERROR_SENTINEL: &str = "__|error|__";

/// Structured error returned to callers and failure destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            trace: None,
        }
    }

    #[must_use]
    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Coerces an arbitrary value a handler failed with into a payload.
    ///
    /// Objects carrying `errorType`/`errorMessage` (or `name`/`message`) keep
    /// them; strings become the message of a generic `Error`; anything else is
    /// serialized as the message.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::new("Error", message.clone()),
            Value::Object(obj) => {
                let text = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|k| obj.get(*k).and_then(Value::as_str))
                        .map(ToString::to_string)
                };
                let trace = obj
                    .get("trace")
                    .or_else(|| obj.get("stackTrace"))
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .map(|l| l.as_str().map_or_else(|| l.to_string(), ToString::to_string))
                            .collect()
                    });
                Self {
                    error_type: text(&["errorType", "name"]).unwrap_or_else(|| "Error".into()),
                    error_message: text(&["errorMessage", "message"])
                        .unwrap_or_else(|| value.to_string()),
                    trace,
                }
            }
            other => Self::new("Error", other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

/// Per-invocation context handed to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub function_name: String,
    pub function_version: String,
    pub invoked_function_arn: String,
    pub memory_limit_in_mb: u32,
    pub aws_request_id: String,
    /// Wall-clock deadline in milliseconds since the Unix epoch.
    pub deadline_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_context: Option<Value>,
}

/// Host to worker envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    Import,
    Exec {
        request_id: String,
        event: Value,
        context: InvocationContext,
    },
    Complete {
        request_id: String,
        timed_out: bool,
    },
}

/// One increment of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StreamChunk {
    Write { chunk: String },
    ContentType { value: String },
    End,
}

/// Worker to host envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum WorkerReply {
    Ready,
    Return { request_id: String, data: Value },
    Succeed { request_id: String, data: Value },
    Fail { request_id: String, data: ErrorPayload },
    Stream { request_id: String, data: StreamChunk },
    Fatal { data: ErrorPayload },
}

impl WorkerReply {
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Return { request_id, .. }
            | Self::Succeed { request_id, .. }
            | Self::Fail { request_id, .. }
            | Self::Stream { request_id, .. } => Some(request_id),
            Self::Ready | Self::Fatal { .. } => None,
        }
    }
}

/// Classification of one line read from a subprocess worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    /// Plain handler output.
    Log(String),
    Reply(WorkerReply),
    Error(ErrorPayload),
    /// A sentinel was present but the envelope did not decode.
    Malformed { line: String, reason: String },
}

impl WorkerLine {
    /// Classifies a stdout line.
    #[must_use]
    pub fn from_stdout(line: &str) -> Self {
        match line.strip_prefix(RESPONSE_SENTINEL) {
            Some(body) => match serde_json::from_str(body) {
                Ok(reply) => Self::Reply(reply),
                Err(e) => Self::Malformed {
                    line: line.to_string(),
                    reason: e.to_string(),
                },
            },
            None => Self::Log(line.to_string()),
        }
    }

    /// Classifies a stderr line.
    #[must_use]
    pub fn from_stderr(line: &str) -> Self {
        match line.strip_prefix(ERROR_SENTINEL) {
            Some(body) => match serde_json::from_str::<Value>(body) {
                Ok(value) => Self::Error(ErrorPayload::from_value(&value)),
                Err(e) => Self::Malformed {
                    line: line.to_string(),
                    reason: e.to_string(),
                },
            },
            None => Self::Log(line.to_string()),
        }
    }
}

impl WorkerMessage {
    /// Serializes the envelope as one newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if the event or context fails to serialize.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
