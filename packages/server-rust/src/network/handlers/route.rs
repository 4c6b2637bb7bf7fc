//! Fallback handler: routes any other request to a function endpoint.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use localfaas_core::{EndpointStyle, HttpMethod, RouteRequest, TriggerInfo, TriggerKind};
use tracing::debug;

use super::AppState;
use crate::events::{build_event, translate_result, EventContext, HttpRequest, HttpResponse};
use crate::registry::RouteMatch;

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        for (name, value) in self.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => debug!(header = %name, "dropping invalid response header"),
            }
        }
        response
    }
}

pub async fn route_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Ok(body) = axum::body::to_bytes(body, state.config.max_body_bytes).await else {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    };
    let (req, hint) = HttpRequest::new(parts.method.as_str(), &parts.uri, &parts.headers, body);

    let Ok(method) = req.method.parse::<HttpMethod>() else {
        return HttpResponse::not_found().into_response();
    };
    let headers = req.header_map();
    let query = req.query_map();
    let route = RouteRequest {
        method,
        path: &req.path,
        headers: &headers,
        query: &query,
        raw_query: &req.raw_query,
    };
    let Some(RouteMatch { invoker, descriptor }) = state.registry.route(&route, hint) else {
        debug!(method = %req.method, path = %req.path, ?hint, "no endpoint matched");
        return HttpResponse::not_found().into_response();
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let event = build_event(
        &req,
        &descriptor,
        EventContext {
            function: invoker.definition().output_name(),
            region: &state.emulator.region,
            request_id: &request_id,
        },
    );
    let kind = match descriptor.style() {
        EndpointStyle::Gateway => TriggerKind::Gateway,
        EndpointStyle::Balancer => TriggerKind::Balancer,
    };
    let trigger = TriggerInfo::new(kind).with_async(descriptor.is_async());

    if descriptor.is_async() {
        tokio::spawn(async move {
            let _ = invoker.invoke(event, trigger, None).await;
        });
        return HttpResponse::accepted().into_response();
    }

    let _guard = state.shutdown.in_flight_guard();
    let result = invoker.invoke(event, trigger, None).await;
    translate_result(&descriptor, result).into_response()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::handlers::testing::{register_script, state};

    async fn send(state: &AppState, method: &str, uri: &str, body: &'static str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "localhost")
            .body(Body::from(body))
            .unwrap();
        let resp = route_handler(State(state.clone()), request).await;
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn balancer_endpoint_round_trip() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        register_script(
            &state,
            dir.path(),
            "users",
            r#"fn main(event) { #{ statusCode: 201, headers: #{ "x-path": event.path }, body: event.httpMethod + " " + event.body } }"#,
            &[json!({ "kind": "balancer", "paths": ["/users/*"] })],
        );

        let (status, body) = send(&state, "POST", "/users/42/profile", "hello").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, "POST hello");
    }

    #[tokio::test]
    async fn gateway_v2_bare_result_and_path_parameters() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        register_script(
            &state,
            dir.path(),
            "items",
            "fn main(event) { #{ id: event.pathParameters.id, route: event.routeKey } }",
            &[json!({ "kind": "gateway", "version": 2, "paths": ["/items/{id}"], "methods": ["GET"] })],
        );

        let (status, body) = send(&state, "GET", "/items/7", "").await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({ "id": "7", "route": "GET /items/{id}" }));

        let (status, _) = send(&state, "GET", "/items/7/extra", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gateway_handler_error_is_500() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        register_script(
            &state,
            dir.path(),
            "broken",
            r#"fn main(event) { throw "boom"; }"#,
            &[json!({ "kind": "gateway", "paths": ["/broken"] })],
        );

        let (status, body) = send(&state, "GET", "/broken", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, r#"{"message":"Internal Server Error"}"#);
    }

    #[tokio::test]
    async fn kind_hint_selects_endpoint_style() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        register_script(
            &state,
            dir.path(),
            "alb",
            r#"fn main(event) { #{ statusCode: 200, body: "alb" } }"#,
            &[json!({ "kind": "balancer", "paths": ["/ping"] })],
        );
        register_script(
            &state,
            dir.path(),
            "apg",
            r#"fn main(event) { #{ statusCode: 200, body: "apg" } }"#,
            &[json!({ "kind": "gateway", "paths": ["/ping"] })],
        );

        assert_eq!(send(&state, "GET", "/ping", "").await.1, "alb");
        assert_eq!(send(&state, "GET", "/ping?x_mock_type=apg", "").await.1, "apg");
    }

    #[tokio::test]
    async fn async_endpoint_answers_immediately() {
        let state = state();
        let dir = tempfile::tempdir().unwrap();
        register_script(
            &state,
            dir.path(),
            "later",
            "fn main(event) { 1 }",
            &[json!({ "kind": "gateway", "paths": ["/later"], "async": true })],
        );

        let (status, body) = send(&state, "POST", "/later", "{}").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unmatched_request_is_404() {
        let state = state();
        let (status, _) = send(&state, "GET", "/nothing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
