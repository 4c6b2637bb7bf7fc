//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Detailed health as JSON. Always 200; the `state` field carries the
/// actual health.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "functions": state.registry.len(),
        "queues": state.queues.names(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: 200 while the process answers at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 once serving, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use localfaas_core::QueueDeclaration;

    use super::*;
    use crate::network::handlers::testing::{register_script, state};

    #[tokio::test]
    async fn health_reports_functions_and_queues() {
        let state = state();
        state.shutdown.set_ready();
        let dir = tempfile::tempdir().unwrap();
        register_script(&state, dir.path(), "a", "fn main(event) { 1 }", &[]);
        register_script(&state, dir.path(), "b", "fn main(event) { 2 }", &[]);
        state
            .queues
            .create(&QueueDeclaration {
                name: "jobs".into(),
                visibility_timeout: 30,
            })
            .unwrap();
        let _guard = state.shutdown.in_flight_guard();

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["state"], "ready");
        assert_eq!(body["functions"], 2);
        assert_eq!(body["queues"], json!(["jobs"]));
        assert_eq!(body["in_flight"], 1);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_health_state() {
        let state = state();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::SERVICE_UNAVAILABLE);
        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);
        state.shutdown.trigger_shutdown();
        assert_eq!(readiness_handler(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }
}
