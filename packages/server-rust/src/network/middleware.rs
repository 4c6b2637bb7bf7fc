//! Transport-level middleware for the request server.
//!
//! The first layer listed is the outermost: it sees the request first and
//! the response last. Invocation-level concerns (load shedding, timeouts,
//! metrics) live in the per-function pipeline, not here.

use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        RequestBodyLimitLayer,
        tower::layer::util::Stack<
            MapResponseBodyLayer<fn(tower_http::limit::ResponseBody<axum::body::Body>) -> axum::body::Body>,
            tower::layer::util::Stack<
            TimeoutLayer,
            tower::layer::util::Stack<
                CorsLayer,
                tower::layer::util::Stack<
                    CompressionLayer,
                    tower::layer::util::Stack<
                        TraceLayer<
                            tower_http::classify::SharedClassifier<
                                tower_http::classify::ServerErrorsAsFailures,
                            >,
                        >,
                        tower::layer::util::Stack<
                            SetRequestIdLayer<MakeRequestUuid>,
                            tower::layer::util::Identity,
                        >,
                    >,
                >,
            >,
            >,
        >,
    >,
>;

/// Builds the HTTP middleware stack.
///
/// **Ordering (outermost to innermost):**
/// 1. `SetRequestId`: assigns a UUID v4 `X-Request-Id`
/// 2. `Tracing`: request/response spans
/// 3. `Compression`: gzip when the client accepts it
/// 4. `CORS`: configured origins, any method (functions choose their own)
/// 5. `Timeout`: transport ceiling, well above function timeouts
/// 6. `RequestBodyLimit`: rejects oversized payloads with 413
/// 7. `PropagateRequestId`: copies `X-Request-Id` to the response
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            config.request_timeout,
        ))
        // Type adapter only: `Timeout` needs a `Default` response body.
        .layer(MapResponseBodyLayer::new(
            axum::body::Body::new as fn(tower_http::limit::ResponseBody<axum::body::Body>) -> axum::body::Body,
        ))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// A wildcard `"*"` allows any origin; otherwise each entry is parsed into
/// an explicit allowlist and unparsable entries are skipped.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}
