use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use renderq_core::WebhookId;
use renderq_infra::queue::JobQueue;
use renderq_infra::webhooks::{SubscriptionView, WebhookUpdate};

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_webhook).get(list_webhooks))
        .route("/deliveries", get(list_deliveries))
        .route(
            "/:id",
            get(get_webhook).patch(update_webhook).delete(delete_webhook),
        )
        .route("/:id/rotate-secret", post(rotate_secret))
}

fn parse_webhook_id(id: &str) -> Result<WebhookId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid webhook id"))
}

/// The response carries the signing secret; it is not shown again.
pub async fn register_webhook(
    Extension(queue): Extension<Arc<JobQueue>>,
    Json(body): Json<dto::RegisterWebhookRequest>,
) -> axum::response::Response {
    match queue
        .webhooks()
        .register_webhook(body.url, body.events, body.metadata)
        .await
    {
        Ok(subscription) => (StatusCode::CREATED, Json(subscription)).into_response(),
        Err(e) => errors::webhook_error_to_response(e),
    }
}

pub async fn list_webhooks(Extension(queue): Extension<Arc<JobQueue>>) -> impl IntoResponse {
    let webhooks: Vec<SubscriptionView> = queue
        .webhooks()
        .list_webhooks()
        .await
        .iter()
        .map(|s| s.view())
        .collect();
    Json(json!({ "webhooks": webhooks }))
}

pub async fn get_webhook(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let webhook_id = match parse_webhook_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.webhooks().get_webhook(webhook_id).await {
        Some(subscription) => Json(subscription.view()).into_response(),
        None => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("webhook not found: {webhook_id}"),
        ),
    }
}

pub async fn update_webhook(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
    Json(body): Json<WebhookUpdate>,
) -> axum::response::Response {
    let webhook_id = match parse_webhook_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.webhooks().update_webhook(webhook_id, body).await {
        Ok(subscription) => Json(subscription.view()).into_response(),
        Err(e) => errors::webhook_error_to_response(e),
    }
}

pub async fn delete_webhook(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let webhook_id = match parse_webhook_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.webhooks().remove_webhook(webhook_id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::webhook_error_to_response(e),
    }
}

pub async fn rotate_secret(
    Extension(queue): Extension<Arc<JobQueue>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let webhook_id = match parse_webhook_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match queue.webhooks().rotate_secret(webhook_id).await {
        Ok(subscription) => Json(json!({
            "id": subscription.id,
            "secret": subscription.secret,
        }))
        .into_response(),
        Err(e) => errors::webhook_error_to_response(e),
    }
}

pub async fn list_deliveries(
    Extension(queue): Extension<Arc<JobQueue>>,
    Query(query): Query<dto::DeliveriesQuery>,
) -> axum::response::Response {
    let filter = match query.to_filter() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let deliveries = queue.webhooks().deliveries(&filter);
    let count = deliveries.len();
    Json(json!({ "deliveries": deliveries, "count": count })).into_response()
}
