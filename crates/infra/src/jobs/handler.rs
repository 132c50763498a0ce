//! Handler contract: what the scheduler calls to do the actual work of a job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use renderq_core::JobId;

use super::events::{JobEvent, JobEvents};
use super::store::JobStore;
use super::types::{Job, JobKind, Progress};

/// Cooperative cancellation flag shared between the scheduler and a running handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Error returned by a handler.
///
/// Transient errors are retried under the scheduler's backoff policy; permanent
/// errors fail the job on the spot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
    context: Value,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            context: Value::Null,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            context: Value::Null,
        }
    }

    /// The handler observed its cancellation flag and stopped.
    pub fn cancelled() -> Self {
        Self::permanent("cancelled")
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &Value {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// A payload that does not deserialize will not deserialize on the next attempt either.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("invalid payload: {err}"))
    }
}

/// Writes handler progress to the store and the event channel.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    events: JobEvents,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, store: Arc<dyn JobStore>, events: JobEvents) -> Self {
        Self {
            job_id,
            store,
            events,
        }
    }

    /// Record progress. Failures are logged; progress reporting never fails a job.
    pub async fn report(&self, progress: Progress) {
        match self.store.update_progress(self.job_id, progress.clone()).await {
            Ok(()) => self.events.publish(JobEvent::Progress {
                job_id: self.job_id,
                progress,
            }),
            Err(e) => warn!(job_id = %self.job_id, error = %e, "progress update rejected"),
        }
    }
}

impl core::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Everything a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: JobKind,
    attempt: u32,
    payload: Value,
    metadata: Value,
    progress: ProgressReporter,
    cancel: CancelFlag,
}

impl JobContext {
    pub fn new(job: &Job, progress: ProgressReporter, cancel: CancelFlag) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            attempt: job.attempts,
            payload: job.payload.clone(),
            metadata: job.metadata.clone(),
            progress,
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into the handler's input type.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub async fn report_progress(&self, progress: Progress) {
        self.progress.report(progress).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Convenience for handlers: bail out with `?` once cancellation was requested.
    pub fn ensure_not_cancelled(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Business logic for one job kind.
///
/// Handlers must observe [`JobContext::is_cancelled`] and stop promptly; the scheduler
/// aborts the handler task on timeout but cannot interrupt blocking code.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        (self.0)(ctx).await
    }
}

/// No handler is registered for the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no handler registered for job kind: {0}")]
pub struct UnknownJobType(pub JobKind);

/// Job kind → handler table, filled before the worker pool starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a kind.
    pub fn register<H>(&mut self, kind: JobKind, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register the same handler for several kinds.
    pub fn register_shared(&mut self, kinds: &[JobKind], handler: Arc<dyn JobHandler>) -> &mut Self {
        for kind in kinds {
            self.handlers.insert(*kind, handler.clone());
        }
        self
    }

    pub fn resolve(&self, kind: JobKind) -> Result<Arc<dyn JobHandler>, UnknownJobType> {
        self.handlers.get(&kind).cloned().ok_or(UnknownJobType(kind))
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NewJob;

    #[tokio::test]
    async fn resolves_registered_kinds_only() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobKind::Single,
            handler_fn(|_ctx| async { Ok::<_, HandlerError>(serde_json::json!({"ok": true})) }),
        );

        assert!(registry.resolve(JobKind::Single).is_ok());
        assert_eq!(
            registry.resolve(JobKind::Templated).err(),
            Some(UnknownJobType(JobKind::Templated))
        );
        assert_eq!(registry.kinds(), vec![JobKind::Single]);
    }

    #[tokio::test]
    async fn context_exposes_payload_and_cancellation() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .enqueue(NewJob::new(JobKind::Single, serde_json::json!({"frames": 3})))
            .await
            .unwrap();
        let job = store.dequeue_next().await.unwrap().unwrap();

        let flag = CancelFlag::new();
        let ctx = JobContext::new(
            &job,
            ProgressReporter::new(job.id, store.clone(), JobEvents::new(8)),
            flag.clone(),
        );

        #[derive(serde::Deserialize)]
        struct Input {
            frames: u32,
        }
        assert_eq!(ctx.parse_payload::<Input>().unwrap().frames, 3);
        assert_eq!(ctx.attempt(), 1);

        ctx.report_progress(Progress::new(1, 3)).await;
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress.current, 1);

        assert!(ctx.ensure_not_cancelled().is_ok());
        flag.cancel();
        let err = ctx.ensure_not_cancelled().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn bad_payload_is_permanent() {
        let err: HandlerError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(!err.is_retryable());
        assert!(err.message().starts_with("invalid payload"));
    }
}
