use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use renderq_core::JobId;
use renderq_infra::queue::JobQueue;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/events", get(super::events::stream))
        .route("/:id", get(get_job).delete(delete_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub async fn submit_job(
    Extension(queue): Extension<Arc<JobQueue>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let options = match body.options() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let job_id = match queue.submit(body.kind, body.payload, options).await {
        Ok(id) => id,
        Err(e) => return errors::queue_error_to_response(e),
    };

    match queue.status(job_id).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        // Removed between submit and read (e.g. a concurrent clear).
        Err(_) => (StatusCode::CREATED, Json(json!({ "id": job_id }))).into_response(),
    }
}

pub async fn list_jobs(
    Extension(queue): Extension<Arc<JobQueue>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.to_filter() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.list_jobs(&filter).await {
        Ok(jobs) => {
            let count = jobs.len();
            Json(json!({ "jobs": jobs, "count": count })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn job_stats(Extension(queue): Extension<Arc<JobQueue>>) -> axum::response::Response {
    match queue.stats().await {
        Ok(stats) => Json(json!({
            "jobs": stats,
            "scheduler": queue.scheduler_stats(),
            "paused": queue.is_paused(),
        }))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.status(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn delete_job(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.remove(job_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let outcome = match queue.cancel(job_id).await {
        Ok(v) => v,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let mut body = json!({ "id": job_id });
    if let (Some(fields), Ok(Value::Object(extra))) = (body.as_object_mut(), serde_json::to_value(outcome)) {
        fields.extend(extra);
    }
    (StatusCode::OK, Json(body)).into_response()
}

pub async fn retry_job(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.retry(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
