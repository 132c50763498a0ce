//! Batch coordination.
//!
//! A batch is one logical request fanned out into N `BatchMember` jobs. The
//! coordinator keeps only membership; all counts are derived from the member jobs
//! on every read. Members are independent: a failed member never cancels siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use renderq_core::{BatchId, JobId, Priority};

use crate::jobs::{
    CancelOutcome, Job, JobKind, JobObserver, JobStatus, JobStore, JobStoreError, NewJob,
    SchedulerError, SchedulerHandle,
};
use crate::webhooks::{validate_url, EventType, WebhookPayload, WebhookService};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch not found: {0}")]
    NotFound(BatchId),
    #[error("a batch needs at least one item")]
    Empty,
    #[error("invalid batch webhook url: {0}")]
    InvalidWebhookUrl(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// One batch submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    /// One job payload per item, in order
    pub items: Vec<Value>,
    pub quality: Option<String>,
    /// Recorded with the batch; the worker pool size bounds actual concurrency
    pub concurrency: Option<u32>,
    pub webhook_url: Option<String>,
    pub priority: Option<Priority>,
    pub max_attempts: Option<u32>,
}

impl BatchRequest {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Rollup state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// No member has started
    Pending,
    Processing,
    /// Every member completed
    Completed,
    /// At least one member failed permanently
    PartiallyFailed,
    /// Every member is terminal, some cancelled, none failed
    Cancelled,
}

/// Derived batch status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub total: usize,
    pub pending: usize,
    /// Processing, plus delayed members waiting on a retry
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Share of members in a terminal state
    pub percentage: u8,
    pub state: BatchState,
    /// Every member is terminal
    pub finished: bool,
    pub quality: Option<String>,
    pub concurrency: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl BatchStatus {
    fn derive(record: &BatchRecord, statuses: impl IntoIterator<Item = Option<JobStatus>>) -> Self {
        let mut status = BatchStatus {
            batch_id: record.batch_id,
            total: record.members.len(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            percentage: 0,
            state: BatchState::Pending,
            finished: false,
            quality: record.quality.clone(),
            concurrency: record.concurrency,
            created_at: record.created_at,
        };

        for member in statuses {
            match member {
                Some(JobStatus::Pending) => status.pending += 1,
                Some(JobStatus::Processing | JobStatus::Delayed) => status.processing += 1,
                Some(JobStatus::Completed) => status.completed += 1,
                Some(JobStatus::Failed) => status.failed += 1,
                // A removed member can no longer run.
                Some(JobStatus::Cancelled) | None => status.cancelled += 1,
            }
        }

        let terminal = status.completed + status.failed + status.cancelled;
        status.finished = terminal == status.total;
        status.percentage = if status.total == 0 {
            100
        } else {
            (terminal * 100 / status.total) as u8
        };
        status.state = if status.failed > 0 {
            BatchState::PartiallyFailed
        } else if status.completed == status.total {
            BatchState::Completed
        } else if status.finished {
            BatchState::Cancelled
        } else if status.pending == status.total {
            BatchState::Pending
        } else {
            BatchState::Processing
        };
        status
    }
}

/// Outcome of cancelling a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCancelSummary {
    pub cancelled: usize,
    pub requested: usize,
    pub already_finished: usize,
}

#[derive(Debug, Clone)]
struct BatchRecord {
    batch_id: BatchId,
    members: Vec<JobId>,
    quality: Option<String>,
    concurrency: Option<u32>,
    webhook_url: Option<String>,
    created_at: DateTime<Utc>,
    /// All members enqueued; completion can be evaluated
    sealed: bool,
    completion_sent: bool,
}

/// Expands batch requests into jobs and fires `BATCH_COMPLETE` once per batch.
pub struct BatchCoordinator {
    store: Arc<dyn JobStore>,
    webhooks: Arc<WebhookService>,
    batches: Mutex<HashMap<BatchId, BatchRecord>>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<dyn JobStore>, webhooks: Arc<WebhookService>) -> Self {
        Self {
            store,
            webhooks,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<BatchId, BatchRecord>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue every item as a `BatchMember` job.
    ///
    /// If an enqueue fails midway, members already enqueued are cancelled and the
    /// error is returned.
    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchId, BatchError> {
        if request.items.is_empty() {
            return Err(BatchError::Empty);
        }
        if let Some(url) = &request.webhook_url {
            validate_url(url).map_err(|e| BatchError::InvalidWebhookUrl(e.to_string()))?;
        }

        let batch_id = BatchId::new();
        let total = request.items.len();
        // Registered before enqueueing so early member completions find the batch.
        self.batches().insert(
            batch_id,
            BatchRecord {
                batch_id,
                members: Vec::with_capacity(total),
                quality: request.quality.clone(),
                concurrency: request.concurrency,
                webhook_url: request.webhook_url.clone(),
                created_at: Utc::now(),
                sealed: false,
                completion_sent: false,
            },
        );

        let priority = request.priority.unwrap_or_default();
        for (index, item) in request.items.into_iter().enumerate() {
            let mut job = NewJob::new(JobKind::BatchMember, item)
                .with_priority(priority)
                .in_batch(batch_id)
                .with_metadata(json!({
                    "batchIndex": index,
                    "batchSize": total,
                    "quality": request.quality,
                }));
            if let Some(max_attempts) = request.max_attempts {
                job = job.with_max_attempts(max_attempts);
            }

            match self.store.enqueue(job).await {
                Ok(job_id) => {
                    if let Some(record) = self.batches().get_mut(&batch_id) {
                        record.members.push(job_id);
                    }
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, index, error = %e, "batch enqueue failed, rolling back");
                    self.abandon(batch_id).await;
                    return Err(e.into());
                }
            }
        }

        if let Some(record) = self.batches().get_mut(&batch_id) {
            record.sealed = true;
        }
        info!(batch_id = %batch_id, total, priority = %priority, "batch submitted");

        // Members may all have finished while the rest were being enqueued.
        self.check_completion(batch_id).await;
        Ok(batch_id)
    }

    async fn abandon(&self, batch_id: BatchId) {
        let Some(record) = self.batches().remove(&batch_id) else {
            return;
        };
        for id in record.members {
            if let Err(e) = self.store.cancel(id).await {
                warn!(batch_id = %batch_id, job_id = %id, error = %e, "could not cancel batch member");
            }
        }
    }

    pub fn member_ids(&self, batch_id: BatchId) -> Result<Vec<JobId>, BatchError> {
        self.batches()
            .get(&batch_id)
            .map(|r| r.members.clone())
            .ok_or(BatchError::NotFound(batch_id))
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches().keys().copied().collect()
    }

    /// Forget every batch. Used when the underlying jobs are wiped.
    pub fn clear(&self) -> usize {
        let mut batches = self.batches();
        let dropped = batches.len();
        batches.clear();
        dropped
    }

    pub async fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchStatus, BatchError> {
        let record = self
            .batches()
            .get(&batch_id)
            .cloned()
            .ok_or(BatchError::NotFound(batch_id))?;

        let mut statuses = Vec::with_capacity(record.members.len());
        for id in &record.members {
            statuses.push(self.store.get(*id).await?.map(|job| job.status));
        }
        Ok(BatchStatus::derive(&record, statuses))
    }

    /// Cancel every non-terminal member through the worker pool.
    pub async fn cancel_batch(
        &self,
        batch_id: BatchId,
        scheduler: &SchedulerHandle,
    ) -> Result<BatchCancelSummary, BatchError> {
        let mut summary = BatchCancelSummary::default();
        for id in self.member_ids(batch_id)? {
            match scheduler.cancel(id).await {
                Ok(CancelOutcome::Cancelled) => summary.cancelled += 1,
                Ok(CancelOutcome::Requested) => summary.requested += 1,
                Ok(CancelOutcome::AlreadyFinished { .. }) => summary.already_finished += 1,
                // Removed members count as finished.
                Err(SchedulerError::Store(JobStoreError::NotFound(_))) => summary.already_finished += 1,
                Err(e) => return Err(e.into()),
            }
        }
        info!(batch_id = %batch_id, ?summary, "batch cancelled");
        Ok(summary)
    }

    /// Send `BATCH_COMPLETE` if every member is terminal and it was not sent yet.
    async fn check_completion(&self, batch_id: BatchId) {
        let sealed = self.batches().get(&batch_id).is_some_and(|r| r.sealed);
        if !sealed {
            return;
        }

        let status = match self.get_batch_status(batch_id).await {
            Ok(status) if status.finished => status,
            Ok(_) => return,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "could not evaluate batch completion");
                return;
            }
        };

        let (webhook_url, members) = {
            let mut batches = self.batches();
            let Some(record) = batches.get_mut(&batch_id) else {
                return;
            };
            if record.completion_sent {
                return;
            }
            record.completion_sent = true;
            (record.webhook_url.clone(), record.members.clone())
        };

        info!(
            batch_id = %batch_id,
            state = ?status.state,
            completed = status.completed,
            failed = status.failed,
            cancelled = status.cancelled,
            "batch finished"
        );

        let payload = WebhookPayload::new(
            EventType::BatchComplete,
            None,
            json!({
                "batchId": batch_id,
                "state": status.state,
                "total": status.total,
                "completed": status.completed,
                "failed": status.failed,
                "cancelled": status.cancelled,
                "jobIds": members,
            }),
        );

        if let Some(url) = webhook_url {
            match self.webhooks.send_to_url(&url, payload.clone()).await {
                Ok(delivery) => debug!(batch_id = %batch_id, success = delivery.success, "batch callback sent"),
                Err(e) => warn!(batch_id = %batch_id, error = %e, "batch callback rejected"),
            }
        }
        self.webhooks.trigger(payload).await;
    }
}

#[async_trait]
impl JobObserver for BatchCoordinator {
    async fn on_terminal(&self, job: &Job) {
        if let Some(batch_id) = job.batch_id {
            self.check_completion(batch_id).await;
        }
    }
}

impl core::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("batches", &self.batches().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::{
        handler_fn, HandlerError, HandlerRegistry, InMemoryJobStore, RetryPolicy, Scheduler,
        SchedulerConfig,
    };
    use crate::webhooks::delivery::test_support::{fast_config, spawn_receiver, ReceiverState};

    struct Harness {
        coordinator: Arc<BatchCoordinator>,
        scheduler: SchedulerHandle,
        store: Arc<InMemoryJobStore>,
    }

    /// Members whose payload has `"fail": true` fail permanently; others succeed.
    fn harness() -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let webhooks = Arc::new(WebhookService::new(fast_config()).unwrap());
        let coordinator = Arc::new(BatchCoordinator::new(store.clone(), webhooks));

        let mut registry = HandlerRegistry::new();
        registry.register(
            JobKind::BatchMember,
            handler_fn(|ctx| async move {
                if ctx.payload()["fail"] == true {
                    Err(HandlerError::permanent("bad template"))
                } else {
                    Ok(json!({ "index": ctx.metadata()["batchIndex"] }))
                }
            }),
        );

        let config = SchedulerConfig::default()
            .with_max_concurrent(2)
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(RetryPolicy::exponential(3, Duration::from_millis(5), 2.0));
        let scheduler = Scheduler::new(store.clone(), registry, config)
            .with_observer(coordinator.clone())
            .spawn();

        Harness {
            coordinator,
            scheduler,
            store,
        }
    }

    async fn wait_for_callbacks(receiver: &ReceiverState, count: usize) {
        for _ in 0..400 {
            if receiver.received().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Give a duplicate the chance to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn completed_batch_fires_one_callback() {
        let (url, receiver) = spawn_receiver(&[]).await;
        let h = harness();

        let batch_id = h
            .coordinator
            .submit_batch(
                BatchRequest::new(vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
                    .with_webhook_url(url),
            )
            .await
            .unwrap();
        h.scheduler.notify();
        h.scheduler.wait_for_completion(Duration::from_secs(10)).await.unwrap();
        wait_for_callbacks(&receiver, 1).await;

        let status = h.coordinator.get_batch_status(batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::Completed);
        assert_eq!(status.completed, 3);
        assert_eq!(status.percentage, 100);
        assert!(status.finished);

        let received = receiver.received();
        assert_eq!(received.len(), 1);
        let body = received[0].json();
        assert_eq!(body["event"], "BATCH_COMPLETE");
        assert_eq!(body["data"]["batchId"], batch_id.to_string());
        assert_eq!(body["data"]["jobIds"].as_array().unwrap().len(), 3);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failed_member_does_not_cancel_siblings() {
        let (url, receiver) = spawn_receiver(&[]).await;
        let h = harness();

        let batch_id = h
            .coordinator
            .submit_batch(
                BatchRequest::new(vec![json!({}), json!({"fail": true}), json!({})])
                    .with_webhook_url(url),
            )
            .await
            .unwrap();
        h.scheduler.wait_for_completion(Duration::from_secs(10)).await.unwrap();
        wait_for_callbacks(&receiver, 1).await;

        let status = h.coordinator.get_batch_status(batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::PartiallyFailed);
        assert_eq!((status.completed, status.failed, status.cancelled), (2, 1, 0));
        assert_eq!(receiver.received().len(), 1);
        assert_eq!(receiver.received()[0].json()["data"]["state"], "partially_failed");
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn members_carry_batch_metadata_and_start_pending() {
        let h = harness();
        h.scheduler.pause();

        let batch_id = h
            .coordinator
            .submit_batch(BatchRequest::new(vec![json!({}), json!({})]).with_priority(Priority::HIGH))
            .await
            .unwrap();

        let status = h.coordinator.get_batch_status(batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::Pending);
        assert_eq!(status.pending, 2);
        assert_eq!(status.percentage, 0);

        let members = h.coordinator.member_ids(batch_id).unwrap();
        let second = h.store.get(members[1]).await.unwrap().unwrap();
        assert_eq!(second.kind, JobKind::BatchMember);
        assert_eq!(second.batch_id, Some(batch_id));
        assert_eq!(second.priority, Priority::HIGH);
        assert_eq!(second.metadata["batchIndex"], 1);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_a_batch_cancels_pending_members() {
        let (url, receiver) = spawn_receiver(&[]).await;
        let h = harness();
        h.scheduler.pause();

        let batch_id = h
            .coordinator
            .submit_batch(BatchRequest::new(vec![json!({}), json!({}), json!({})]).with_webhook_url(url))
            .await
            .unwrap();

        let summary = h.coordinator.cancel_batch(batch_id, &h.scheduler).await.unwrap();
        assert_eq!(summary.cancelled, 3);
        wait_for_callbacks(&receiver, 1).await;

        let status = h.coordinator.get_batch_status(batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::Cancelled);
        assert_eq!(receiver.received().len(), 1);
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_empty_and_unknown_batches() {
        let h = harness();
        assert!(matches!(
            h.coordinator.submit_batch(BatchRequest::new(vec![])).await,
            Err(BatchError::Empty)
        ));
        assert!(matches!(
            h.coordinator.get_batch_status(BatchId::new()).await,
            Err(BatchError::NotFound(_))
        ));
        h.scheduler.shutdown().await;
    }
}
