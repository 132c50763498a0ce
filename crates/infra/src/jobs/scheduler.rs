//! Worker pool with timeouts, retry and backoff.
//!
//! A fixed number of tokio workers share one [`JobStore`]. Only store operations
//! are serialized; handlers run in their own tasks so a slow render never holds
//! up other workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use renderq_core::JobId;

use super::events::{JobEvent, JobEvents};
use super::handler::{CancelFlag, HandlerRegistry, JobContext, ProgressReporter};
use super::store::{JobStore, JobStoreError};
use super::types::{CancelOutcome, FailureKind, Job, JobFailure, JobStats, RetryPolicy};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// Number of workers, i.e. maximum concurrently running jobs
    pub max_concurrent: usize,
    /// Per-attempt handler timeout
    pub job_timeout: Duration,
    /// How long an idle worker sleeps before polling again
    pub poll_interval: Duration,
    /// Backoff between attempts; `max_attempts` is the default for new jobs
    pub retry: RetryPolicy,
    /// How long shutdown waits for in-flight observers (terminal webhooks)
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "render-queue".to_string(),
            max_concurrent: 4,
            job_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(120),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Receives every terminal transition (completed, failed, cancelled).
///
/// Observers run in their own tasks after the store write; whatever they do cannot
/// change the job's outcome.
#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn on_terminal(&self, job: &Job);
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("{} jobs still outstanding after {waited:?}", stats.outstanding())]
    WaitTimeout { waited: Duration, stats: JobStats },
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
    pub paused: bool,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

enum AttemptOutcome {
    Succeeded(Value),
    Failed { failure: JobFailure, retryable: bool },
}

impl AttemptOutcome {
    fn is_timeout(&self) -> bool {
        matches!(self, AttemptOutcome::Failed { failure, .. } if failure.kind == FailureKind::Timeout)
    }
}

struct Shared {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    events: JobEvents,
    observers: Vec<Arc<dyn JobObserver>>,
    paused: AtomicBool,
    wake: Notify,
    running: Mutex<HashMap<JobId, CancelFlag>>,
    observer_tasks: Mutex<JoinSet<()>>,
    counters: Counters,
}

/// Background worker pool.
///
/// Build with [`Scheduler::new`], register observers, then [`Scheduler::spawn`].
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    events: JobEvents,
    observers: Vec<Arc<dyn JobObserver>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, config: SchedulerConfig) -> Self {
        Self {
            store,
            registry,
            config,
            events: JobEvents::default(),
            observers: Vec::new(),
        }
    }

    /// Publish lifecycle events on an existing channel.
    pub fn with_events(mut self, events: JobEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Start the workers. Must be called from within a tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let worker_count = self.config.max_concurrent.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            store: self.store,
            registry: self.registry,
            config: self.config,
            events: self.events,
            observers: self.observers,
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            running: Mutex::new(HashMap::new()),
            observer_tasks: Mutex::new(JoinSet::new()),
            counters: Counters::default(),
        });

        let workers = (0..worker_count)
            .map(|worker_id| {
                let shared = shared.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { shared.worker_loop(worker_id, shutdown).await })
            })
            .collect();

        info!(
            scheduler = %shared.config.name,
            workers = worker_count,
            job_timeout_ms = shared.config.job_timeout.as_millis() as u64,
            handlers = ?shared.registry.kinds(),
            "scheduler started"
        );

        SchedulerHandle {
            shared,
            shutdown: shutdown_tx,
            workers: Mutex::new(workers),
        }
    }
}

/// Handle to control a running pool.
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Stop handing out new jobs. Running jobs finish normally.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        info!(scheduler = %self.shared.config.name, "scheduler paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake.notify_waiters();
        info!(scheduler = %self.shared.config.name, "scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Wake an idle worker, e.g. right after an enqueue.
    pub fn notify(&self) {
        self.shared.wake.notify_one();
    }

    /// Cancel a job. Pending and delayed jobs are cancelled outright; a processing
    /// job gets its cooperative flag raised and is finalized when its handler returns.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, SchedulerError> {
        let outcome = self.shared.store.cancel(id).await?;
        match outcome {
            CancelOutcome::Cancelled => {
                self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.shared.events.publish(JobEvent::Cancelled { job_id: id });
                if let Some(job) = self.shared.store.get(id).await? {
                    self.shared.notify_observers(job);
                }
            }
            CancelOutcome::Requested => {
                if let Some(flag) = self.shared.running().get(&id) {
                    flag.cancel();
                }
            }
            CancelOutcome::AlreadyFinished { .. } => {}
        }
        debug!(scheduler = %self.shared.config.name, job_id = %id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Raise the cancellation flag of every running handler.
    pub fn cancel_running(&self) -> usize {
        let running = self.shared.running();
        for flag in running.values() {
            flag.cancel();
        }
        running.len()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.shared.running().keys().copied().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            jobs_processed: c.processed.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_retried: c.retried.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            jobs_cancelled: c.cancelled.load(Ordering::Relaxed),
            current_running: self.shared.running().len(),
            paused: self.is_paused(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Block until the store has no pending, processing or delayed jobs.
    ///
    /// Polls every `poll_interval`; gives up after `timeout`.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<JobStats, SchedulerError> {
        let started = tokio::time::Instant::now();
        loop {
            let stats = self.shared.store.stats().await?;
            if stats.outstanding() == 0 {
                return Ok(stats);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(SchedulerError::WaitTimeout { waited, stats });
            }
            tokio::time::sleep(self.shared.config.poll_interval.min(timeout - waited)).await;
        }
    }

    /// Graceful shutdown: workers finish their current job and exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.shared.wake.notify_waiters();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(scheduler = %self.shared.config.name, error = %e, "worker task ended abnormally");
            }
        }

        // Terminal notifications from the workers are all in this set now.
        let mut observers = std::mem::take(
            &mut *self
                .shared
                .observer_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let pending = observers.len();
        let drained = tokio::time::timeout(self.shared.config.shutdown_grace, async {
            while let Some(result) = observers.join_next().await {
                if let Err(e) = result {
                    error!(scheduler = %self.shared.config.name, error = %e, "observer task ended abnormally");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                scheduler = %self.shared.config.name,
                abandoned = observers.len(),
                "observers still running after shutdown grace period"
            );
            observers.abort_all();
        } else if pending > 0 {
            debug!(scheduler = %self.shared.config.name, pending, "observers drained");
        }
        info!(scheduler = %self.shared.config.name, "scheduler stopped");
    }
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, HashMap<JobId, CancelFlag>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(scheduler = %self.config.name, worker_id, "worker started");

        loop {
            // A dropped sender means the handle is gone; stop as on shutdown.
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            if self.paused.load(Ordering::Acquire) {
                self.idle(&mut shutdown).await;
                continue;
            }

            match self.store.dequeue_next().await {
                Ok(Some(job)) => {
                    debug!(
                        scheduler = %self.config.name,
                        worker_id,
                        job_id = %job.id,
                        kind = %job.kind,
                        priority = %job.priority,
                        attempt = job.attempts,
                        "claimed job"
                    );
                    self.run_job(job).await;
                }
                Ok(None) => self.idle(&mut shutdown).await,
                Err(e) => {
                    error!(scheduler = %self.config.name, worker_id, error = %e, "failed to claim job");
                    self.idle(&mut shutdown).await;
                }
            }
        }

        debug!(scheduler = %self.config.name, worker_id, "worker stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn run_job(&self, job: Job) {
        let flag = CancelFlag::new();
        self.running().insert(job.id, flag.clone());

        // Cancellation may have landed between dequeue and registering the flag.
        if let Ok(Some(current)) = self.store.get(job.id).await {
            if current.cancel_requested {
                flag.cancel();
            }
        }

        self.events.publish(JobEvent::Started {
            job_id: job.id,
            attempt: job.attempts,
        });

        let outcome = self.execute(&job, &flag).await;
        self.running().remove(&job.id);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        self.finish(job, outcome, &flag).await;
    }

    async fn execute(&self, job: &Job, flag: &CancelFlag) -> AttemptOutcome {
        let handler = match self.registry.resolve(job.kind) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "no handler for job");
                return AttemptOutcome::Failed {
                    failure: JobFailure::new(FailureKind::UnknownJobType, e.to_string()),
                    retryable: false,
                };
            }
        };

        let ctx = JobContext::new(
            job,
            ProgressReporter::new(job.id, self.store.clone(), self.events.clone()),
            flag.clone(),
        );
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });

        match tokio::time::timeout(self.config.job_timeout, &mut task).await {
            Ok(Ok(Ok(value))) => AttemptOutcome::Succeeded(value),
            Ok(Ok(Err(err))) => AttemptOutcome::Failed {
                failure: JobFailure::new(FailureKind::Handler, err.message())
                    .with_context(err.context().clone()),
                retryable: err.is_retryable(),
            },
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    "handler panicked"
                } else {
                    "handler task aborted"
                };
                AttemptOutcome::Failed {
                    failure: JobFailure::new(FailureKind::Panicked, message),
                    retryable: true,
                }
            }
            Err(_elapsed) => {
                flag.cancel();
                task.abort();
                AttemptOutcome::Failed {
                    failure: JobFailure::new(
                        FailureKind::Timeout,
                        format!("attempt exceeded {:?}", self.config.job_timeout),
                    )
                    .with_context(serde_json::json!({
                        "timeout_ms": self.config.job_timeout.as_millis() as u64,
                    })),
                    retryable: true,
                }
            }
        }
    }

    async fn finish(&self, job: Job, outcome: AttemptOutcome, flag: &CancelFlag) {
        let job_id = job.id;
        let cancelled = flag.is_cancelled() && !outcome.is_timeout();

        let terminal = if cancelled {
            self.store.mark_cancelled(job_id).await.map(|job| {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.events.publish(JobEvent::Cancelled { job_id });
                info!(job_id = %job_id, "job cancelled while processing");
                Some(job)
            })
        } else {
            match outcome {
                AttemptOutcome::Succeeded(result) => {
                    self.store.mark_completed(job_id, result).await.map(|job| {
                        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                        self.events.publish(JobEvent::Completed { job_id });
                        debug!(job_id = %job_id, attempts = job.attempts, "job completed");
                        Some(job)
                    })
                }
                AttemptOutcome::Failed { failure, retryable }
                    if retryable && job.attempts < job.max_attempts =>
                {
                    let delay = self.config.retry.delay_for_attempt(job.attempts);
                    let run_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(
                        job_id = %job_id,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "job attempt failed, retrying"
                    );
                    self.store
                        .schedule_retry(job_id, failure.clone(), run_at)
                        .await
                        .map(|_| {
                            self.counters.retried.fetch_add(1, Ordering::Relaxed);
                            self.events.publish(JobEvent::Retrying {
                                job_id,
                                attempt: job.attempts,
                                run_at,
                                error: failure,
                            });
                            None
                        })
                }
                AttemptOutcome::Failed { failure, .. } => {
                    error!(
                        job_id = %job_id,
                        attempts = job.attempts,
                        error = %failure,
                        "job failed permanently"
                    );
                    self.store
                        .mark_failed(job_id, failure.clone())
                        .await
                        .map(|job| {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            self.events.publish(JobEvent::Failed {
                                job_id,
                                error: failure,
                            });
                            Some(job)
                        })
                }
            }
        };

        match terminal {
            Ok(Some(job)) => self.notify_observers(job),
            Ok(None) => {}
            // The job was removed or cleared while its handler ran.
            Err(e) => warn!(job_id = %job_id, error = %e, "could not record job outcome"),
        }
    }

    fn notify_observers(&self, job: Job) {
        if self.observers.is_empty() {
            return;
        }
        let mut tasks = self.observer_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set only holds in-flight notifications.
        while tasks.try_join_next().is_some() {}
        for observer in &self.observers {
            let observer = observer.clone();
            let job = job.clone();
            tasks.spawn(async move { observer.on_terminal(&job).await });
        }
    }
}
