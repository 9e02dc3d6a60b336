//! HTTP surface: liveness/readiness probes, per-chain status, the
//! Prometheus scrape endpoint, and a mount point for user-defined routes
//! (the operational HTTP surface).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::status::StatusStore;
use crate::storage::Storage;

#[derive(Clone)]
pub struct ApiState<S: Storage> {
    pub status: Arc<StatusStore<S>>,
}

pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler::<S>))
        .route("/status", get(status_handler::<S>))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(cors)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ready_handler<S: Storage>(State(state): State<ApiState<S>>) -> impl IntoResponse {
    match state.status.is_ready().await {
        Ok(true) => (StatusCode::OK, "ready").into_response(),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn status_handler<S: Storage>(State(state): State<ApiState<S>>) -> impl IntoResponse {
    match state.status.all().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (StatusCode::OK, crate::metrics::gather_metrics())
}
