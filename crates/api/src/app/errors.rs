use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use renderq_infra::batch::BatchError;
use renderq_infra::jobs::{JobStoreError, SchedulerError};
use renderq_infra::queue::QueueError;
use renderq_infra::webhooks::WebhookError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        QueueError::InvalidRequest(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::ShutDown => json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", "queue is shut down"),
        QueueError::Store(e) => store_error_to_response(e),
        QueueError::Scheduler(e) => scheduler_error_to_response(e),
        QueueError::Webhook(e) => webhook_error_to_response(e),
        QueueError::Batch(e) => batch_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job not found: {id}")),
        JobStoreError::InvalidTransition(e) => json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string()),
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

fn scheduler_error_to_response(err: SchedulerError) -> axum::response::Response {
    match err {
        SchedulerError::Store(e) => store_error_to_response(e),
        e @ SchedulerError::WaitTimeout { .. } => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", e.to_string())
        }
    }
}

pub fn webhook_error_to_response(err: WebhookError) -> axum::response::Response {
    match err {
        WebhookError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("webhook not found: {id}"))
        }
        e @ (WebhookError::InvalidUrl(_) | WebhookError::NoEvents) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        e @ (WebhookError::Encode(_) | WebhookError::Client(_)) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "webhook_error", e.to_string())
        }
    }
}

fn batch_error_to_response(err: BatchError) -> axum::response::Response {
    match err {
        BatchError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("batch not found: {id}")),
        e @ (BatchError::Empty | BatchError::InvalidWebhookUrl(_)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        BatchError::Store(e) => store_error_to_response(e),
        BatchError::Scheduler(e) => scheduler_error_to_response(e),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
