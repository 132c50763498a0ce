use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use renderq_core::BatchId;
use renderq_infra::batch::BatchRequest;
use renderq_infra::jobs::JobFilter;
use renderq_infra::priority::CallerId;
use renderq_infra::queue::{JobQueue, SubmitOptions};

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_batch))
        .route("/:id", get(get_batch))
        .route("/:id/jobs", get(list_batch_jobs))
        .route("/:id/cancel", post(cancel_batch))
}

fn parse_batch_id(id: &str) -> Result<BatchId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid batch id"))
}

pub async fn submit_batch(
    Extension(queue): Extension<Arc<JobQueue>>,
    Json(body): Json<dto::SubmitBatchRequest>,
) -> axum::response::Response {
    let explicit = match body.priority.as_ref().map(dto::PriorityField::resolve).transpose() {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // A caller's plan decides the priority of every member, as for single jobs.
    let priority = match body.caller.as_deref() {
        Some(caller) => {
            let options = SubmitOptions {
                priority: explicit,
                caller: Some(CallerId::from(caller)),
                ..Default::default()
            };
            Some(queue.resolve_priority(&options).await)
        }
        None => explicit,
    };

    let request = BatchRequest {
        items: body.items,
        quality: body.quality,
        concurrency: body.concurrency,
        webhook_url: body.webhook_url,
        priority,
        max_attempts: body.max_attempts,
    };

    let batch_id = match queue.submit_batch(request).await {
        Ok(id) => id,
        Err(e) => return errors::queue_error_to_response(e),
    };

    match queue.batch_status(batch_id).await {
        Ok(status) => (StatusCode::CREATED, Json(status)).into_response(),
        Err(_) => (StatusCode::CREATED, Json(json!({ "batch_id": batch_id }))).into_response(),
    }
}

pub async fn get_batch(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match parse_batch_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.batch_status(batch_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_batch_jobs(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match parse_batch_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = queue.batch_status(batch_id).await {
        return errors::queue_error_to_response(e);
    }
    let filter = JobFilter {
        batch_id: Some(batch_id),
        ..Default::default()
    };
    match queue.list_jobs(&filter).await {
        Ok(jobs) => {
            let count = jobs.len();
            Json(json!({ "batch_id": batch_id, "jobs": jobs, "count": count })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cancel_batch(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match parse_batch_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.cancel_batch(batch_id).await {
        Ok(summary) => Json(json!({ "batch_id": batch_id, "summary": summary })).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
