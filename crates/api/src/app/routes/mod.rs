use axum::Router;

pub mod batches;
pub mod events;
pub mod jobs;
pub mod queue;
pub mod system;
pub mod webhooks;

/// Router for every queue endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/queue", queue::router())
        .nest("/webhooks", webhooks::router())
        .nest("/batches", batches::router())
}
