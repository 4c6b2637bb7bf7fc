//! Direct invoke API: `POST /2015-03-31/functions/{name}/invocations` and
//! its short alias `POST /@invoke/{name}`.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use localfaas_core::{function_arn, TriggerInfo, TriggerKind};
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::delivery::error_value;
use crate::invocation::{InvocationOutput, InvokeError};

pub const INVOCATION_TYPE_HEADER: &str = "x-amz-invocation-type";
pub const CLIENT_CONTEXT_HEADER: &str = "x-amz-client-context";
pub const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";
pub const EXECUTED_VERSION_HEADER: &str = "x-amz-executed-version";
pub const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvocationType {
    RequestResponse,
    Event,
    DryRun,
}

impl InvocationType {
    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("RequestResponse") => Some(Self::RequestResponse),
            Some("Event") => Some(Self::Event),
            Some("DryRun") => Some(Self::DryRun),
            Some(_) => None,
        }
    }
}

/// Error answer of the invoke API itself, as opposed to a function error.
fn api_error(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        [(ERROR_TYPE_HEADER, error_type)],
        axum::Json(json!({ "Type": "User", "Message": message.into() })),
    )
        .into_response()
}

fn client_context(headers: &HeaderMap) -> Result<Option<Value>, ()> {
    let Some(raw) = headers.get(CLIENT_CONTEXT_HEADER) else {
        return Ok(None);
    };
    let decoded = BASE64.decode(raw.as_bytes()).map_err(|_| ())?;
    match serde_json::from_slice::<Value>(&decoded) {
        Ok(value @ Value::Object(_)) => Ok(Some(value)),
        _ => Err(()),
    }
}

pub async fn invoke_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(invoker) = state.registry.get_by_name(&name) else {
        return api_error(
            StatusCode::NOT_FOUND,
            "ResourceNotFoundException",
            format!("Function not found: {}", function_arn(&state.emulator.region, &name)),
        );
    };

    let requested = headers.get(INVOCATION_TYPE_HEADER).and_then(|v| v.to_str().ok());
    let Some(invocation_type) = InvocationType::parse(requested) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "InvalidParameterValueException",
            "Unsupported invocation type",
        );
    };
    let Ok(client_context) = client_context(&headers) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "InvalidRequestContentException",
            "Client context must be a valid Base64-encoded JSON object.",
        );
    };
    let event = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(event) => event,
            Err(_) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "InvalidRequestContentException",
                    "Could not parse request body into json",
                )
            }
        }
    };

    debug!(function = %invoker.name(), ?invocation_type, "invoke API call");
    match invocation_type {
        InvocationType::DryRun => StatusCode::NO_CONTENT.into_response(),
        InvocationType::Event => {
            tokio::spawn(async move {
                let _ = invoker
                    .invoke(event, TriggerInfo::new(TriggerKind::Async), client_context)
                    .await;
            });
            StatusCode::ACCEPTED.into_response()
        }
        InvocationType::RequestResponse => {
            let _guard = state.shutdown.in_flight_guard();
            let result = invoker
                .invoke(event, TriggerInfo::new(TriggerKind::Invoke), client_context)
                .await;
            invoke_response(result)
        }
    }
}

fn invoke_response(result: Result<InvocationOutput, InvokeError>) -> Response {
    let version = [(EXECUTED_VERSION_HEADER, "$LATEST")];
    match result {
        Ok(InvocationOutput::Value(value)) => (
            StatusCode::OK,
            version,
            [(header::CONTENT_TYPE, "application/json")],
            value.to_string(),
        )
            .into_response(),
        Ok(InvocationOutput::Streamed { content_type, body }) => (
            StatusCode::OK,
            version,
            [(
                header::CONTENT_TYPE,
                content_type.unwrap_or_else(|| "application/octet-stream".into()),
            )],
            body,
        )
            .into_response(),
        Err(InvokeError::Overloaded) => api_error(
            StatusCode::TOO_MANY_REQUESTS,
            "TooManyRequestsException",
            "Rate Exceeded.",
        ),
        Err(err) => (
            StatusCode::OK,
            version,
            [(FUNCTION_ERROR_HEADER, "Unhandled")],
            axum::Json(error_value(&err.payload())),
        )
            .into_response(),
    }
}
