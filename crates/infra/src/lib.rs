//! Infrastructure layer: job store, worker pool, webhook delivery, batches.

pub mod batch;
pub mod jobs;
pub mod priority;
pub mod queue;
pub mod webhooks;
