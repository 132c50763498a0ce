//! `JobQueue`: the single owner of the store, worker pool, webhooks and batches.
//!
//! Built once with [`JobQueueBuilder::start`], shut down once with
//! [`JobQueue::shutdown`]. Everything the HTTP surface exposes goes through here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use renderq_core::{BatchId, JobId, Priority};

use crate::batch::{BatchCancelSummary, BatchCoordinator, BatchError, BatchRequest, BatchStatus};
use crate::jobs::{
    CancelOutcome, HandlerRegistry, InMemoryJobStore, Job, JobEvent, JobEvents, JobFilter,
    JobHandler, JobKind, JobStats, JobStatusView, JobStore, JobStoreError, NewJob, Scheduler,
    SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerStats,
};
use crate::priority::{CallerId, PlanLookup, PriorityAssessment, PriorityPolicy};
use crate::webhooks::{validate_url, WebhookConfig, WebhookError, WebhookNotifier, WebhookService};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("queue is shut down")]
    ShutDown,
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Explicit class. With a `caller`, it can only lower the plan's priority.
    pub priority: Option<Priority>,
    /// Resolved through the priority policy when set
    pub caller: Option<CallerId>,
    pub max_attempts: Option<u32>,
    /// Per-job callback for the terminal event
    pub webhook_url: Option<String>,
    pub metadata: Value,
}

impl SubmitOptions {
    pub fn for_caller(caller: impl Into<CallerId>) -> Self {
        Self {
            caller: Some(caller.into()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Builder for [`JobQueue`].
pub struct JobQueueBuilder {
    store: Option<Arc<dyn JobStore>>,
    registry: HandlerRegistry,
    scheduler: SchedulerConfig,
    webhooks: WebhookConfig,
    plan_lookup: Option<Arc<dyn PlanLookup>>,
    event_capacity: usize,
}

impl Default for JobQueueBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: HandlerRegistry::new(),
            scheduler: SchedulerConfig::default(),
            webhooks: WebhookConfig::default(),
            plan_lookup: None,
            event_capacity: 1024,
        }
    }
}

impl JobQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults to [`InMemoryJobStore`].
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn with_webhook_config(mut self, config: WebhookConfig) -> Self {
        self.webhooks = config;
        self
    }

    pub fn with_plan_lookup(mut self, lookup: Arc<dyn PlanLookup>) -> Self {
        self.plan_lookup = Some(lookup);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn register<H>(mut self, kind: JobKind, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.registry.register(kind, handler);
        self
    }

    pub fn register_shared(mut self, kinds: &[JobKind], handler: Arc<dyn JobHandler>) -> Self {
        self.registry.register_shared(kinds, handler);
        self
    }

    /// Wire everything together and start the workers. Requires a tokio runtime.
    pub fn start(self) -> Result<JobQueue, QueueError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let events = JobEvents::new(self.event_capacity);
        let webhooks = Arc::new(WebhookService::new(self.webhooks)?);
        let batches = Arc::new(BatchCoordinator::new(store.clone(), webhooks.clone()));
        let notifier = WebhookNotifier::new(webhooks.clone());
        let forwarder = notifier.spawn_lifecycle_forwarder(&events);
        let default_max_attempts = self.scheduler.retry.max_attempts.max(1);

        let scheduler = Scheduler::new(store.clone(), self.registry, self.scheduler)
            .with_events(events.clone())
            .with_observer(Arc::new(notifier))
            .with_observer(batches.clone())
            .spawn();

        Ok(JobQueue {
            store,
            scheduler,
            webhooks,
            batches,
            policy: self.plan_lookup.map(PriorityPolicy::new),
            events,
            default_max_attempts,
            forwarder: Mutex::new(Some(forwarder)),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// The job queue.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    scheduler: SchedulerHandle,
    webhooks: Arc<WebhookService>,
    batches: Arc<BatchCoordinator>,
    policy: Option<PriorityPolicy>,
    events: JobEvents,
    default_max_attempts: u32,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::new()
    }

    fn ensure_running(&self) -> Result<(), QueueError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(QueueError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Priority for a submission: the caller's plan, optionally lowered by an
    /// explicit class; an explicit class alone is taken as is.
    pub async fn resolve_priority(&self, options: &SubmitOptions) -> Priority {
        let from_plan = match (&options.caller, &self.policy) {
            (Some(caller), Some(policy)) => Some(policy.priority_for(caller).await),
            // Callers without a plan directory get the lowest class.
            (Some(_), None) => Some(Priority::LOW),
            (None, _) => None,
        };
        match (from_plan, options.priority) {
            (Some(plan), Some(explicit)) => plan.max(explicit),
            (Some(plan), None) => plan,
            (None, Some(explicit)) => explicit,
            (None, None) => Priority::NORMAL,
        }
    }

    pub async fn assess_caller(&self, caller: &CallerId) -> Option<PriorityAssessment> {
        match &self.policy {
            Some(policy) => Some(policy.assess(caller).await),
            None => None,
        }
    }

    pub async fn submit(&self, kind: JobKind, payload: Value, options: SubmitOptions) -> Result<JobId, QueueError> {
        self.ensure_running()?;
        if let Some(url) = &options.webhook_url {
            validate_url(url)?;
        }
        if options.max_attempts == Some(0) {
            return Err(QueueError::InvalidRequest("max_attempts must be at least 1".into()));
        }

        let priority = self.resolve_priority(&options).await;
        let mut job = NewJob::new(kind, payload)
            .with_priority(priority)
            .with_max_attempts(options.max_attempts.unwrap_or(self.default_max_attempts))
            .with_metadata(options.metadata);
        if let Some(url) = options.webhook_url {
            job = job.with_webhook_url(url);
        }

        let job_id = self.store.enqueue(job).await?;
        self.events.publish(JobEvent::Enqueued {
            job_id,
            kind,
            priority,
        });
        self.scheduler.notify();

        debug!(job_id = %job_id, kind = %kind, priority = %priority, "job submitted");
        Ok(job_id)
    }

    pub async fn job(&self, id: JobId) -> Result<Job, QueueError> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView, QueueError> {
        Ok(self.job(id).await?.status_view())
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobStatusView>, QueueError> {
        Ok(self
            .store
            .list(filter)
            .await?
            .iter()
            .map(Job::status_view)
            .collect())
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, QueueError> {
        match self.scheduler.cancel(id).await {
            Err(SchedulerError::Store(JobStoreError::NotFound(_))) => Err(QueueError::NotFound(id)),
            other => Ok(other?),
        }
    }

    /// Delete a job. Processing jobs must be cancelled first.
    pub async fn remove(&self, id: JobId) -> Result<Job, QueueError> {
        match self.store.remove(id).await {
            Err(JobStoreError::NotFound(_)) => Err(QueueError::NotFound(id)),
            other => Ok(other?),
        }
    }

    /// Put a failed or cancelled job back in line.
    pub async fn retry(&self, id: JobId) -> Result<JobStatusView, QueueError> {
        self.ensure_running()?;
        let job = match self.store.retry(id).await {
            Err(JobStoreError::NotFound(_)) => return Err(QueueError::NotFound(id)),
            other => other?,
        };
        self.scheduler.notify();
        info!(job_id = %id, "job re-queued");
        Ok(job.status_view())
    }

    /// Drop every job. Running handlers are asked to stop; their results are discarded.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let signalled = self.scheduler.cancel_running();
        let removed = self.store.clear().await?;
        let batches = self.batches.clear();
        info!(removed, signalled, batches, "queue cleared");
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<JobStats, QueueError> {
        Ok(self.scheduler.wait_for_completion(timeout).await?)
    }

    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchId, QueueError> {
        self.ensure_running()?;
        let batch_id = self.batches.submit_batch(request).await?;
        self.scheduler.notify();
        Ok(batch_id)
    }

    pub async fn batch_status(&self, batch_id: BatchId) -> Result<BatchStatus, QueueError> {
        Ok(self.batches.get_batch_status(batch_id).await?)
    }

    pub async fn cancel_batch(&self, batch_id: BatchId) -> Result<BatchCancelSummary, QueueError> {
        Ok(self.batches.cancel_batch(batch_id, &self.scheduler).await?)
    }

    pub fn webhooks(&self) -> &Arc<WebhookService> {
        &self.webhooks
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        self.scheduler.config()
    }

    /// Stop the workers after their current job. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown().await;
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            forwarder.abort();
        }
        info!("job queue shut down");
    }
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("scheduler", &self.scheduler.config().name)
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}
