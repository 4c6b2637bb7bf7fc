//! HTTP trigger event construction and response translation.
//!
//! An inbound request becomes one of three event shapes depending on the
//! matched endpoint: a balancer event, a version 1 gateway event (REST
//! style) or a version 2 gateway event (HTTP-API style). The function's
//! result goes the other way: a proxy response object becomes status,
//! headers and body; errors and timeouts become the status codes the
//! corresponding platform front end answers with.

use std::collections::BTreeMap;

use axum::extract::Query;
use http::{HeaderMap, Uri};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use localfaas_core::manifest::LOCAL_ACCOUNT_ID;
use localfaas_core::{EndpointDescriptor, EndpointKind, EndpointStyle, HttpMethod, MultiMap};
use serde_json::{json, Map, Value};

use crate::invocation::{InvocationOutput, InvokeError};

/// Query parameter and header that restrict routing to one endpoint style.
pub const KIND_HINT_PARAM: &str = "x_mock_type";
pub const KIND_HINT_HEADER: &str = "x-mock-type";

// ---------------------------------------------------------------------------
// Inbound request
// ---------------------------------------------------------------------------

/// An inbound HTTP request, with the routing hint already stripped.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    /// Lowercase names in arrival order.
    pub headers: Vec<(String, String)>,
    /// Decoded query pairs in arrival order.
    pub query: Vec<(String, String)>,
    pub body: Bytes,
    pub source_ip: String,
}

impl HttpRequest {
    /// Captures a request and extracts its routing hint.
    #[must_use]
    pub fn new(method: &str, uri: &Uri, headers: &HeaderMap, body: Bytes) -> (Self, Option<EndpointStyle>) {
        let mut hint = headers
            .get(KIND_HINT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut query = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        if let Some(i) = query.iter().position(|(k, _)| k == KIND_HINT_PARAM) {
            hint = Some(query[i].1.clone());
        }
        query.retain(|(k, _)| k != KIND_HINT_PARAM);

        let raw_query = uri
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(KIND_HINT_PARAM))
            .collect::<Vec<_>>()
            .join("&");

        let headers = headers
            .iter()
            .filter(|(name, _)| name.as_str() != KIND_HINT_HEADER)
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let request = Self {
            method: method.to_ascii_uppercase(),
            path: uri.path().to_string(),
            raw_query,
            headers,
            query,
            body,
            source_ip: "127.0.0.1".to_string(),
        };
        (request, hint.as_deref().and_then(EndpointStyle::from_hint))
    }

    #[must_use]
    pub fn header_map(&self) -> MultiMap {
        to_multimap(&self.headers)
    }

    #[must_use]
    pub fn query_map(&self) -> MultiMap {
        to_multimap(&self.query)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Body as event field: text as-is, anything else base64-encoded.
    fn body_field(&self) -> (Option<String>, bool) {
        if self.body.is_empty() {
            return (None, false);
        }
        match std::str::from_utf8(&self.body) {
            Ok(text) => (Some(text.to_string()), false),
            Err(_) => (Some(BASE64.encode(&self.body)), true),
        }
    }
}

fn to_multimap(pairs: &[(String, String)]) -> MultiMap {
    let mut map = MultiMap::new();
    for (k, v) in pairs {
        map.entry(k.clone()).or_default().push(v.clone());
    }
    map
}

fn last_values(map: &MultiMap) -> Map<String, Value> {
    map.iter()
        .filter_map(|(k, vs)| vs.last().map(|v| (k.clone(), Value::String(v.clone()))))
        .collect()
}

fn joined_values(map: &MultiMap) -> Map<String, Value> {
    map.iter()
        .map(|(k, vs)| (k.clone(), Value::String(vs.join(","))))
        .collect()
}

fn all_values(map: &MultiMap) -> Map<String, Value> {
    map.iter()
        .map(|(k, vs)| (k.clone(), json!(vs)))
        .collect()
}

fn non_empty(map: Map<String, Value>) -> Value {
    if map.is_empty() {
        Value::Null
    } else {
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Event construction
// ---------------------------------------------------------------------------

/// Identity of the invocation the event is built for.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub function: &'a str,
    pub region: &'a str,
    pub request_id: &'a str,
}

/// Builds the event for `req` as seen through `descriptor`.
#[must_use]
pub fn build_event(req: &HttpRequest, descriptor: &EndpointDescriptor, ctx: EventContext<'_>) -> Value {
    match descriptor.kind() {
        EndpointKind::Balancer {
            multi_value_headers, ..
        } => balancer_event(req, *multi_value_headers, ctx),
        EndpointKind::Gateway { version, .. } if *version >= 2 => gateway_v2_event(req, descriptor, ctx),
        EndpointKind::Gateway { .. } => gateway_v1_event(req, descriptor, ctx),
    }
}

fn balancer_event(req: &HttpRequest, multi_value: bool, ctx: EventContext<'_>) -> Value {
    let (body, encoded) = req.body_field();
    let headers = req.header_map();
    let query = req.query_map();
    let mut event = json!({
        "requestContext": {
            "elb": {
                "targetGroupArn": format!(
                    "arn:aws:elasticloadbalancing:{}:{LOCAL_ACCOUNT_ID}:targetgroup/{}/local",
                    ctx.region, ctx.function
                ),
            },
        },
        "httpMethod": req.method,
        "path": req.path,
        "body": body.unwrap_or_default(),
        "isBase64Encoded": encoded,
    });
    if multi_value {
        event["multiValueHeaders"] = Value::Object(all_values(&headers));
        event["multiValueQueryStringParameters"] = Value::Object(all_values(&query));
    } else {
        event["headers"] = Value::Object(last_values(&headers));
        event["queryStringParameters"] = Value::Object(last_values(&query));
    }
    event
}

fn request_time() -> (String, i64) {
    let now = chrono::Utc::now();
    (now.format("%d/%b/%Y:%H:%M:%S %z").to_string(), now.timestamp_millis())
}

fn gateway_v1_event(req: &HttpRequest, descriptor: &EndpointDescriptor, ctx: EventContext<'_>) -> Value {
    let (body, encoded) = req.body_field();
    let headers = req.header_map();
    let query = req.query_map();
    let resource = descriptor.resource_for(&req.path).unwrap_or(&req.path);
    let params: Map<String, Value> = descriptor
        .path_parameters(&req.path)
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    let (time, epoch) = request_time();

    json!({
        "resource": resource,
        "path": req.path,
        "httpMethod": req.method,
        "headers": last_values(&headers),
        "multiValueHeaders": all_values(&headers),
        "queryStringParameters": non_empty(last_values(&query)),
        "multiValueQueryStringParameters": non_empty(all_values(&query)),
        "pathParameters": non_empty(params),
        "stageVariables": null,
        "requestContext": {
            "accountId": LOCAL_ACCOUNT_ID,
            "apiId": "local",
            "domainName": req.header("host").unwrap_or("localhost"),
            "httpMethod": req.method,
            "path": req.path,
            "protocol": "HTTP/1.1",
            "requestId": ctx.request_id,
            "requestTime": time,
            "requestTimeEpoch": epoch,
            "resourceId": "local",
            "resourcePath": resource,
            "stage": "local",
            "identity": {
                "sourceIp": req.source_ip,
                "userAgent": req.header("user-agent"),
            },
        },
        "body": body,
        "isBase64Encoded": encoded,
    })
}

fn gateway_v2_event(req: &HttpRequest, descriptor: &EndpointDescriptor, ctx: EventContext<'_>) -> Value {
    let (body, encoded) = req.body_field();
    let mut headers = req.header_map();
    let cookies: Vec<String> = headers
        .remove("cookie")
        .unwrap_or_default()
        .iter()
        .flat_map(|c| c.split(';'))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let query = req.query_map();
    let resource = descriptor.resource_for(&req.path).unwrap_or(&req.path);
    let route_key = if resource == "*" || resource == "/*" {
        "$default".to_string()
    } else {
        let method = if descriptor.methods().contains(&HttpMethod::Any) {
            "ANY"
        } else {
            req.method.as_str()
        };
        format!("{method} {resource}")
    };
    let params: Map<String, Value> = descriptor
        .path_parameters(&req.path)
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    let (time, epoch) = request_time();

    let mut event = json!({
        "version": "2.0",
        "routeKey": route_key,
        "rawPath": req.path,
        "rawQueryString": req.raw_query,
        "headers": joined_values(&headers),
        "requestContext": {
            "accountId": LOCAL_ACCOUNT_ID,
            "apiId": "local",
            "domainName": req.header("host").unwrap_or("localhost"),
            "http": {
                "method": req.method,
                "path": req.path,
                "protocol": "HTTP/1.1",
                "sourceIp": req.source_ip,
                "userAgent": req.header("user-agent").unwrap_or_default(),
            },
            "requestId": ctx.request_id,
            "routeKey": route_key,
            "stage": "$default",
            "time": time,
            "timeEpoch": epoch,
        },
        "isBase64Encoded": encoded,
    });
    if !cookies.is_empty() {
        event["cookies"] = json!(cookies);
    }
    if !query.is_empty() {
        event["queryStringParameters"] = Value::Object(joined_values(&query));
    }
    if !params.is_empty() {
        event["pathParameters"] = Value::Object(params);
    }
    if let Some(body) = body {
        event["body"] = Value::String(body);
    }
    event
}

// ---------------------------------------------------------------------------
// Response translation
// ---------------------------------------------------------------------------

/// Wire response produced from an invocation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(body.to_string()),
        }
    }

    fn text(status: u16, body: &'static str) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    /// Response of an endpoint declared asynchronous.
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// No endpoint matched the request.
    #[must_use]
    pub fn not_found() -> Self {
        Self::json(404, &json!({ "message": "Not Found" }))
    }
}

/// Translates an invocation result into the front end's response.
#[must_use]
pub fn translate_result(descriptor: &EndpointDescriptor, result: Result<InvocationOutput, InvokeError>) -> HttpResponse {
    let (style, version) = match descriptor.kind() {
        EndpointKind::Balancer { .. } => (EndpointStyle::Balancer, 0),
        EndpointKind::Gateway { version, .. } => (EndpointStyle::Gateway, *version),
    };

    match result {
        Ok(InvocationOutput::Streamed { content_type, body }) => HttpResponse {
            status: 200,
            headers: vec![(
                "content-type".into(),
                content_type.unwrap_or_else(|| "application/octet-stream".into()),
            )],
            body: Bytes::from(body),
        },
        Ok(InvocationOutput::Value(value)) => {
            let parsed = proxy_response(&value, style == EndpointStyle::Gateway && version >= 2);
            parsed.unwrap_or_else(|| {
                tracing::warn!("function returned a malformed proxy response");
                match style {
                    EndpointStyle::Balancer => HttpResponse::text(502, "502 Bad Gateway"),
                    EndpointStyle::Gateway => HttpResponse::json(502, &json!({ "message": "Internal server error" })),
                }
            })
        }
        Err(err) => match style {
            EndpointStyle::Balancer => HttpResponse::text(502, "502 Bad Gateway"),
            EndpointStyle::Gateway if err.is_timeout() && version >= 2 => {
                HttpResponse::json(503, &json!({ "message": "Service Unavailable" }))
            }
            EndpointStyle::Gateway if err.is_timeout() => {
                HttpResponse::json(504, &json!({ "message": "Endpoint request timed out" }))
            }
            EndpointStyle::Gateway => HttpResponse::json(500, &json!({ "message": "Internal Server Error" })),
        },
    }
}

/// Parses a `{statusCode, headers, multiValueHeaders, cookies, body,
/// isBase64Encoded}` result. With `allow_bare`, anything without a
/// `statusCode` is sent as a JSON 200.
fn proxy_response(value: &Value, allow_bare: bool) -> Option<HttpResponse> {
    let Some(status) = value.get("statusCode") else {
        return allow_bare.then(|| HttpResponse::json(200, value));
    };
    let status = match status {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .and_then(|s| u16::try_from(s).ok())
    .filter(|s| (100..=599).contains(s))?;

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(Value::Object(single)) = value.get("headers") {
        for (name, v) in single {
            if let Some(v) = scalar_string(v) {
                headers.entry(name.to_ascii_lowercase()).or_default().push(v);
            }
        }
    }
    if let Some(Value::Object(multi)) = value.get("multiValueHeaders") {
        for (name, vs) in multi {
            let values: Vec<String> = vs.as_array().into_iter().flatten().filter_map(scalar_string).collect();
            if !values.is_empty() {
                headers.insert(name.to_ascii_lowercase(), values);
            }
        }
    }
    if let Some(Value::Array(cookies)) = value.get("cookies") {
        let entry = headers.entry("set-cookie".into()).or_default();
        entry.extend(cookies.iter().filter_map(|c| c.as_str().map(str::to_string)));
    }

    let encoded = value.get("isBase64Encoded").and_then(Value::as_bool).unwrap_or(false);
    let body = match value.get("body") {
        None | Some(Value::Null) => Bytes::new(),
        Some(Value::String(s)) if encoded => Bytes::from(BASE64.decode(s).ok()?),
        Some(Value::String(s)) => Bytes::from(s.clone()),
        Some(other) => Bytes::from(other.to_string()),
    };

    Some(HttpResponse {
        status,
        headers: headers
            .into_iter()
            .flat_map(|(k, vs)| vs.into_iter().map(move |v| (k.clone(), v)))
            .collect(),
        body,
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use localfaas_core::{EndpointConfig, ErrorPayload};

    use super::*;

    fn descriptor(config: Value) -> EndpointDescriptor {
        EndpointDescriptor::compile(serde_json::from_value::<EndpointConfig>(config).unwrap()).unwrap()
    }

    fn request(method: &str, uri: &str, headers: &[(&'static str, &'static str)], body: &'static [u8]) -> (HttpRequest, Option<EndpointStyle>) {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.append(*k, HeaderValue::from_static(*v));
        }
        HttpRequest::new(method, &uri.parse().unwrap(), &map, Bytes::from_static(body))
    }

    const CTX: EventContext<'static> = EventContext {
        function: "users",
        region: "us-east-1",
        request_id: "req-1",
    };

    #[test]
    fn hint_is_extracted_and_stripped() {
        let (req, hint) = request("get", "/a?x=1&x_mock_type=alb&y=2", &[], b"");
        assert_eq!(hint, Some(EndpointStyle::Balancer));
        assert_eq!(req.raw_query, "x=1&y=2");
        assert_eq!(req.method, "GET");
        assert!(req.query.iter().all(|(k, _)| k != KIND_HINT_PARAM));

        let (req, hint) = request("GET", "/a", &[("x-mock-type", "apg")], b"");
        assert_eq!(hint, Some(EndpointStyle::Gateway));
        assert!(req.headers.is_empty());
    }

    #[test]
    fn balancer_event_shape() {
        let d = descriptor(json!({ "kind": "balancer", "paths": ["/users/*"] }));
        let (req, _) = request("POST", "/users/42?tag=a&tag=b", &[("x-trace", "t1")], b"hello");
        let event = build_event(&req, &d, CTX);

        assert_eq!(event["httpMethod"], "POST");
        assert_eq!(event["path"], "/users/42");
        assert_eq!(event["body"], "hello");
        assert_eq!(event["isBase64Encoded"], false);
        assert_eq!(event["headers"]["x-trace"], "t1");
        assert_eq!(event["queryStringParameters"]["tag"], "b");
        assert!(event["requestContext"]["elb"]["targetGroupArn"]
            .as_str()
            .unwrap()
            .contains("targetgroup/users/"));

        let d = descriptor(json!({ "kind": "balancer", "paths": ["/users/*"], "multiValueHeaders": true }));
        let event = build_event(&req, &d, CTX);
        assert_eq!(event["multiValueQueryStringParameters"]["tag"], json!(["a", "b"]));
        assert!(event.get("headers").is_none());
    }

    #[test]
    fn binary_body_is_base64_encoded() {
        let d = descriptor(json!({ "kind": "balancer", "paths": ["/bin"] }));
        let (req, _) = request("POST", "/bin", &[], &[0xff, 0xfe, 0x00]);
        let event = build_event(&req, &d, CTX);
        assert_eq!(event["isBase64Encoded"], true);
        assert_eq!(event["body"], "//4A");
    }

    #[test]
    fn gateway_v1_event_carries_resource_and_parameters() {
        let d = descriptor(json!({ "kind": "gateway", "paths": ["/users/{id}/files/{path+}"] }));
        let (req, _) = request("GET", "/users/7/files/a/b.txt", &[("host", "localhost:3000")], b"");
        let event = build_event(&req, &d, CTX);

        assert_eq!(event["resource"], "/users/{id}/files/{path+}");
        assert_eq!(event["pathParameters"]["id"], "7");
        assert_eq!(event["pathParameters"]["path"], "a/b.txt");
        assert_eq!(event["queryStringParameters"], Value::Null);
        assert_eq!(event["body"], Value::Null);
        assert_eq!(event["requestContext"]["requestId"], "req-1");
        assert_eq!(event["requestContext"]["domainName"], "localhost:3000");
    }

    #[test]
    fn gateway_v2_event_shape() {
        let d = descriptor(json!({ "kind": "gateway", "version": 2, "paths": ["/items/{id}"], "methods": ["GET"] }));
        let (req, _) = request("GET", "/items/9?a=1&a=2", &[("cookie", "s=1; t=2"), ("accept", "json")], b"");
        let event = build_event(&req, &d, CTX);

        assert_eq!(event["version"], "2.0");
        assert_eq!(event["routeKey"], "GET /items/{id}");
        assert_eq!(event["rawPath"], "/items/9");
        assert_eq!(event["rawQueryString"], "a=1&a=2");
        assert_eq!(event["cookies"], json!(["s=1", "t=2"]));
        assert!(event["headers"].get("cookie").is_none());
        assert_eq!(event["queryStringParameters"]["a"], "1,2");
        assert_eq!(event["pathParameters"]["id"], "9");
        assert!(event.get("body").is_none());
    }

    #[test]
    fn proxy_response_is_translated() {
        let d = descriptor(json!({ "kind": "gateway", "paths": ["/x"] }));
        let out = InvocationOutput::Value(json!({
            "statusCode": 201,
            "headers": { "Content-Type": "text/plain", "X-Count": 3 },
            "multiValueHeaders": { "Set-Cookie": ["a=1", "b=2"] },
            "body": "created",
        }));
        let resp = translate_result(&d, Ok(out));
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, Bytes::from_static(b"created"));
        assert!(resp.headers.contains(&("x-count".into(), "3".into())));
        assert_eq!(resp.headers.iter().filter(|(k, _)| k == "set-cookie").count(), 2);
    }

    #[test]
    fn base64_body_is_decoded() {
        let d = descriptor(json!({ "kind": "balancer", "paths": ["/x"] }));
        let out = InvocationOutput::Value(json!({ "statusCode": 200, "body": "aGk=", "isBase64Encoded": true }));
        assert_eq!(translate_result(&d, Ok(out)).body, Bytes::from_static(b"hi"));
    }

    #[test]
    fn bare_results_only_for_v2() {
        let v2 = descriptor(json!({ "kind": "gateway", "version": 2, "paths": ["/x"] }));
        let resp = translate_result(&v2, Ok(InvocationOutput::Value(json!({ "ok": true }))));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from_static(br#"{"ok":true}"#));

        let v1 = descriptor(json!({ "kind": "gateway", "paths": ["/x"] }));
        assert_eq!(translate_result(&v1, Ok(InvocationOutput::Value(json!("hi")))).status, 502);
        let alb = descriptor(json!({ "kind": "balancer", "paths": ["/x"] }));
        assert_eq!(translate_result(&alb, Ok(InvocationOutput::Value(json!({ "statusCode": "abc" })))).status, 502);
    }

    #[test]
    fn errors_map_to_front_end_statuses() {
        let handler = || Err(InvokeError::Handler(ErrorPayload::new("Error", "boom")));
        let timeout = || {
            Err(InvokeError::Timeout {
                function: "f".into(),
                request_id: "r".into(),
                timeout_ms: 1000,
            })
        };
        let alb = descriptor(json!({ "kind": "balancer", "paths": ["/x"] }));
        let v1 = descriptor(json!({ "kind": "gateway", "paths": ["/x"] }));
        let v2 = descriptor(json!({ "kind": "gateway", "version": 2, "paths": ["/x"] }));

        assert_eq!(translate_result(&alb, handler()).status, 502);
        let resp = translate_result(&v1, handler());
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, Bytes::from_static(br#"{"message":"Internal Server Error"}"#));
        assert_eq!(translate_result(&v2, handler()).status, 500);
        assert_eq!(translate_result(&v1, timeout()).status, 504);
        assert_eq!(translate_result(&v2, timeout()).status, 503);
    }

    #[test]
    fn streamed_output_keeps_content_type() {
        let d = descriptor(json!({ "kind": "gateway", "version": 2, "paths": ["/s"] }));
        let out = InvocationOutput::Streamed {
            content_type: Some("text/event-stream".into()),
            body: "data: 1\n\n".into(),
        };
        let resp = translate_result(&d, Ok(out));
        assert_eq!(resp.headers, vec![("content-type".to_string(), "text/event-stream".to_string())]);
        assert_eq!(resp.body, Bytes::from_static(b"data: 1\n\n"));
    }
}
