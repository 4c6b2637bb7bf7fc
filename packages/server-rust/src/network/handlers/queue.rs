//! `POST /@queue/{name}`: enqueue the request body into a local queue.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;

use super::AppState;
use crate::queue::QueueError;

pub async fn enqueue_handler(State(state): State<AppState>, Path(name): Path<String>, body: Bytes) -> Response {
    let body = String::from_utf8_lossy(&body).into_owned();
    match state.queues.send(&name, body) {
        Ok(message_id) => Json(json!({ "MessageId": message_id })).into_response(),
        Err(e @ QueueError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(json!({ "message": e.to_string() }))).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "message": e.to_string() }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use localfaas_core::QueueDeclaration;

    use super::*;
    use crate::network::handlers::testing::state;

    #[tokio::test]
    async fn enqueues_into_declared_queue() {
        let state = state();
        let queue = state
            .queues
            .create(&QueueDeclaration {
                name: "jobs".into(),
                visibility_timeout: 30,
            })
            .unwrap();

        let resp = enqueue_handler(State(state.clone()), Path("jobs".into()), Bytes::from_static(b"hello")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(queue.approximate_count(), 1);

        let resp = enqueue_handler(State(state), Path("nope".into()), Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
