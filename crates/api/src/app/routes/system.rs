use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use renderq_infra::queue::JobQueue;

pub async fn health(Extension(queue): Extension<Arc<JobQueue>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "paused": queue.is_paused(),
        "workers": queue.scheduler_config().max_concurrent,
    }))
}
