//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use renderq_core::JobId;

use super::types::{
    CancelOutcome, InvalidTransition, Job, JobFailure, JobFilter, JobStats, JobStatus, NewJob,
    Progress,
};

/// Job store abstraction.
///
/// The store is the single source of truth for job state. Every state change goes
/// through one of these operations, and each operation is atomic with respect to
/// the others.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a new pending job.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Claim the next ready job and mark it processing in one step.
    ///
    /// Ready jobs are pending jobs and delayed jobs whose wake time has passed.
    /// Lowest priority value wins; ties go to the earliest enqueued job.
    /// Concurrent callers never receive the same job.
    async fn dequeue_next(&self) -> Result<Option<Job>, JobStoreError>;

    async fn mark_completed(&self, id: JobId, result: Value) -> Result<Job, JobStoreError>;

    async fn mark_failed(&self, id: JobId, failure: JobFailure) -> Result<Job, JobStoreError>;

    /// Record a failed attempt and park the job as delayed until `run_at`.
    async fn schedule_retry(
        &self,
        id: JobId,
        failure: JobFailure,
        run_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    async fn mark_cancelled(&self, id: JobId) -> Result<Job, JobStoreError>;

    async fn update_progress(&self, id: JobId, progress: Progress) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs matching the filter, in enqueue order.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Delete a job that is not currently processing.
    async fn remove(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Cancel a pending/delayed job, or flag a processing one.
    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError>;

    /// Move a failed or cancelled job back to pending.
    async fn retry(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Drop every job regardless of state. Returns how many were removed.
    async fn clear(&self) -> Result<usize, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
}

impl Inner {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, JobStoreError> {
        self.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))
    }

    /// Apply a transition and hand back the updated job.
    fn update<F>(&mut self, id: JobId, apply: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), InvalidTransition>,
    {
        let job = self.job_mut(id)?;
        apply(job)?;
        Ok(job.clone())
    }
}

/// In-memory job store.
///
/// An arena of jobs keyed by id behind a single mutex, so dequeue-and-mark is one
/// critical section. Jobs do not survive the process.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a job half-written: every
        // transition validates before mutating.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let mut inner = self.lock();
        inner.next_sequence += 1;
        let job = Job::from_new(job, inner.next_sequence, Utc::now());
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn dequeue_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.lock();
        let now = Utc::now();

        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.priority, j.sequence))
            .map(|j| j.id);

        match next {
            Some(id) => inner.update(id, |job| job.mark_processing(now)).map(Some),
            None => Ok(None),
        }
    }

    async fn mark_completed(&self, id: JobId, result: Value) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        self.lock().update(id, |job| job.mark_completed(result, now))
    }

    async fn mark_failed(&self, id: JobId, failure: JobFailure) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        self.lock().update(id, |job| job.mark_failed(failure, now))
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        failure: JobFailure,
        run_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        self.lock()
            .update(id, |job| job.schedule_retry(failure, run_at, now))
    }

    async fn mark_cancelled(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        self.lock().update(id, |job| job.mark_cancelled(now))
    }

    async fn update_progress(&self, id: JobId, progress: Progress) -> Result<(), JobStoreError> {
        let mut inner = self.lock();
        let job = inner.job_mut(id)?;
        if job.status != JobStatus::Processing {
            return Err(InvalidTransition {
                job_id: id,
                from: job.status,
                to: JobStatus::Processing,
            }
            .into());
        }
        job.progress = progress;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock();
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.sequence);
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn remove(&self, id: JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let status = inner.job_mut(id)?.status;
        if status == JobStatus::Processing {
            return Err(InvalidTransition {
                job_id: id,
                from: status,
                to: JobStatus::Cancelled,
            }
            .into());
        }
        inner.jobs.remove(&id).ok_or(JobStoreError::NotFound(id))
    }

    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError> {
        let mut inner = self.lock();
        let job = inner.job_mut(id)?;
        let now = Utc::now();

        match job.status {
            JobStatus::Pending | JobStatus::Delayed => {
                job.mark_cancelled(now)?;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Processing => {
                job.cancel_requested = true;
                job.updated_at = now;
                Ok(CancelOutcome::Requested)
            }
            status => Ok(CancelOutcome::AlreadyFinished { status }),
        }
    }

    async fn retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        self.lock().update(id, |job| job.reset_for_retry(now))
    }

    async fn clear(&self) -> Result<usize, JobStoreError> {
        let mut inner = self.lock();
        let removed = inner.jobs.len();
        inner.jobs.clear();
        Ok(removed)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.lock();
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use renderq_core::Priority;

    use super::*;
    use crate::jobs::types::{FailureKind, JobKind};

    fn job(priority: u8) -> NewJob {
        NewJob::new(JobKind::Single, serde_json::json!({})).with_priority(Priority::new(priority))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job(5)).await.unwrap();

        let claimed = store.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        // No more jobs
        assert!(store.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_order_is_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for p in [10, 0, 5, 0, 10] {
            ids.push(store.enqueue(job(p)).await.unwrap());
        }

        let mut order = Vec::new();
        while let Some(job) = store.dequeue_next().await.unwrap() {
            order.push(job.id);
        }

        assert_eq!(order, vec![ids[1], ids[3], ids[2], ids[0], ids[4]]);
    }

    #[tokio::test]
    async fn delayed_job_waits_for_wake_time() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(5)).await.unwrap();
        store.dequeue_next().await.unwrap().unwrap();

        let failure = JobFailure::new(FailureKind::Handler, "transient");
        let later = Utc::now() + chrono::Duration::hours(1);
        let parked = store.schedule_retry(id, failure.clone(), later).await.unwrap();
        assert_eq!(parked.status, JobStatus::Delayed);
        assert!(store.dequeue_next().await.unwrap().is_none());

        // Re-park with a wake time in the past; a real worker would see it after backoff.
        {
            let mut inner = store.lock();
            inner.jobs.get_mut(&id).unwrap().run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        let again = store.dequeue_next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
        assert_eq!(again.history.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_dequeue_never_hands_out_a_job_twice() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..500u32 {
            store.enqueue(job((i % 11) as u8)).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.dequeue_next().await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} dequeued twice");
            }
        }
        assert_eq!(total, 500);
    }

    #[tokio::test]
    async fn cancel_pending_and_processing() {
        let store = InMemoryJobStore::new();
        let running = store.enqueue(job(0)).await.unwrap();
        let waiting = store.enqueue(job(5)).await.unwrap();
        store.dequeue_next().await.unwrap();

        assert_eq!(store.cancel(waiting).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(store.cancel(running).await.unwrap(), CancelOutcome::Requested);
        assert!(store.get(running).await.unwrap().unwrap().cancel_requested);

        // The cancelled job is out of dequeue consideration.
        assert!(store.dequeue_next().await.unwrap().is_none());

        let done = store.mark_cancelled(running).await.unwrap();
        assert_eq!(
            store.cancel(done.id).await.unwrap(),
            CancelOutcome::AlreadyFinished {
                status: JobStatus::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn failed_job_only_returns_through_explicit_retry() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(5)).await.unwrap();
        store.dequeue_next().await.unwrap();
        store
            .mark_failed(id, JobFailure::new(FailureKind::Handler, "bad input"))
            .await
            .unwrap();

        assert!(store.dequeue_next().await.unwrap().is_none());

        let retried = store.retry(id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(store.dequeue_next().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn processing_jobs_cannot_be_removed() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(5)).await.unwrap();
        store.dequeue_next().await.unwrap();

        assert!(matches!(
            store.remove(id).await,
            Err(JobStoreError::InvalidTransition(_))
        ));

        store.mark_completed(id, Value::Null).await.unwrap();
        assert_eq!(store.remove(id).await.unwrap().id, id);
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_only_while_processing() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job(5)).await.unwrap();
        assert!(store.update_progress(id, Progress::new(1, 2)).await.is_err());

        store.dequeue_next().await.unwrap();
        store
            .update_progress(id, Progress::new(1, 2).with_item("scene-1"))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.progress.percentage, 50);
        assert_eq!(job.progress.current_item.as_deref(), Some("scene-1"));
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for _ in 0..5 {
            store.enqueue(job(5)).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.waiting, 5);
        assert_eq!(stats.total, 5);

        store.dequeue_next().await.unwrap();
        store.dequeue_next().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.outstanding(), 5);

        assert_eq!(store.clear().await.unwrap(), 5);
        assert_eq!(store.stats().await.unwrap(), JobStats::default());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_limit() {
        let store = InMemoryJobStore::new();
        for _ in 0..4 {
            store.enqueue(job(5)).await.unwrap();
        }
        store.dequeue_next().await.unwrap();

        let pending = store
            .list(&JobFilter::with_status(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let limited = store
            .list(&JobFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
