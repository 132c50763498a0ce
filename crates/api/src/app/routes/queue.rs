use std::sync::Arc;

use axum::{
    extract::Extension,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use renderq_infra::queue::JobQueue;

use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/", get(queue_state))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/clear", post(clear))
}

pub async fn queue_state(Extension(queue): Extension<Arc<JobQueue>>) -> axum::response::Response {
    match queue.stats().await {
        Ok(stats) => Json(json!({
            "paused": queue.is_paused(),
            "jobs": stats,
            "scheduler": queue.scheduler_stats(),
        }))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn pause(Extension(queue): Extension<Arc<JobQueue>>) -> impl IntoResponse {
    queue.pause();
    Json(json!({ "paused": true }))
}

pub async fn resume(Extension(queue): Extension<Arc<JobQueue>>) -> impl IntoResponse {
    queue.resume();
    Json(json!({ "paused": false }))
}

pub async fn clear(Extension(queue): Extension<Arc<JobQueue>>) -> axum::response::Response {
    match queue.clear().await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
