use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use renderq_core::JobId;
use renderq_infra::queue::JobQueue;

use crate::app::{dto, errors};

/// Server-sent job lifecycle events, optionally for a single job.
///
/// Lossy: a client that falls behind skips events rather than slowing workers.
pub async fn stream(
    Extension(queue): Extension<Arc<JobQueue>>,
    Query(query): Query<dto::EventsQuery>,
) -> axum::response::Response {
    let job_filter: Option<JobId> = match query.job_id.as_deref().map(str::parse).transpose() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    let stream = BroadcastStream::new(queue.subscribe()).filter_map(move |msg| match msg {
        Ok(event) if job_filter.is_none_or(|id| event.job_id() == id) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok::<_, Infallible>(SseEvent::default().event(event.name()).data(data)))
        }
        _ => None,
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
