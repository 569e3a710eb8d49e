//! Health endpoints for queue workers
//!
//! - `/health`: liveness, always OK while the process serves requests
//! - `/ready`: readiness, the backend answers `size` for every polled queue
//! - `/metrics`: Prometheus text format

use crate::backend::QueueBackend;
use crate::metrics;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub backend: Arc<dyn QueueBackend>,
    pub app_name: String,
    pub app_version: String,
    pub queues: Vec<String>,
}

impl HealthState {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        queues: Vec<String>,
    ) -> Self {
        Self {
            backend,
            app_name: app_name.into(),
            app_version: app_version.into(),
            queues,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
    pub connection: String,
}

pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
        connection: state.backend.name().to_string(),
    })
}

/// Ready when the backend reports a size for every polled queue.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let mut queues = Map::new();
    let mut ready = true;
    for queue in &state.queues {
        match state.backend.size(Some(queue)).await {
            Ok(size) => {
                queues.insert(queue.clone(), json!({ "size": size }));
            }
            Err(e) => {
                ready = false;
                queues.insert(queue.clone(), json!({ "error": e.to_string() }));
            }
        }
    }

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "connection": state.backend.name(),
            "queues": queues,
        })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render_metrics(),
    )
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryQueue;
    use crate::job::Job;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(backend: Arc<MemoryQueue>) -> HealthState {
        HealthState::new(backend, "queue-worker", "0.1.0", vec!["default".to_string()])
    }

    #[tokio::test]
    async fn test_health_reports_connection() {
        let app = router(state(Arc::new(MemoryQueue::new())));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.connection, "memory");
    }

    #[tokio::test]
    async fn test_ready_includes_queue_sizes() {
        let backend = Arc::new(MemoryQueue::new());
        backend.push(&Job::raw("noop", json!({})), None).await.unwrap();

        let app = router(state(backend));
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let ready: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ready["queues"]["default"]["size"], 1);
    }
}
