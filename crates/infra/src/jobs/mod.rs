//! Background render jobs with priority ordering, retry and backoff.
//!
//! ## Components
//!
//! - `Job`: state record with payload, attempts, progress and attempt history
//! - `JobStore`: persistence for jobs (in-memory, or Postgres behind the `postgres` feature)
//! - `Scheduler`: worker pool that runs handlers with timeout and retry logic
//! - `JobHandler` / `HandlerRegistry`: the work itself, one handler per `JobKind`
//! - `JobEvents`: lifecycle push channel

pub mod events;
pub mod handler;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;

pub use events::{JobEvent, JobEvents};
pub use handler::{
    handler_fn, CancelFlag, HandlerError, HandlerRegistry, JobContext, JobHandler,
    ProgressReporter, UnknownJobType,
};
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use scheduler::{
    JobObserver, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerStats,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    AttemptRecord, CancelOutcome, FailureKind, Job, JobFailure, JobFilter, JobKind, JobStats,
    JobStatus, JobStatusView, NewJob, Progress, RetryPolicy,
};
