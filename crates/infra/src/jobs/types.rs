//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use renderq_core::{BatchId, DomainError, JobId, Priority};

/// Job kind, used to route a job to its registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A single standalone render.
    Single,
    /// A render built from a stored template.
    Templated,
    /// One member of a batch submission.
    BatchMember,
    /// One member of a campaign fan-out.
    CampaignMember,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Single,
        JobKind::Templated,
        JobKind::BatchMember,
        JobKind::CampaignMember,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Single => "single",
            JobKind::Templated => "templated",
            JobKind::BatchMember => "batch_member",
            JobKind::CampaignMember => "campaign_member",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job kind: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Owned by exactly one worker
    Processing,
    /// Waiting for its retry wake time
    Delayed,
    /// Completed successfully
    Completed,
    /// Attempts exhausted or permanent error
    Failed,
    /// Cancelled by user/system
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Delayed,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Delayed => "delayed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first run included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Factor applied per additional retry
    pub backoff_multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            ..Default::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed):
    /// `base_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.max(0.0).powi(exp);
        let max_ms = self.max_delay.as_millis() as f64;

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempts` have run.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Handler-reported progress of a running job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    /// 0..=100, derived from `current / total`
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

impl Progress {
    pub fn new(current: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            ((current.min(total) as u128 * 100) / total as u128) as u8
        };
        Self {
            current,
            total,
            percentage,
            current_item: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error.
    Handler,
    /// The attempt exceeded the job timeout.
    Timeout,
    /// The handler task panicked or was aborted.
    Panicked,
    /// No handler is registered for the job kind.
    UnknownJobType,
}

/// Structured failure record stored on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<JobFailure>,
    pub duration_ms: u64,
}

/// Attempted state change that the job's state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Everything needed to enqueue a job. The store assigns id, sequence and timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: Value,
    pub priority: Priority,
    pub max_attempts: u32,
    pub webhook_url: Option<String>,
    pub batch_id: Option<BatchId>,
    pub metadata: Value,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            priority: Priority::NORMAL,
            max_attempts: RetryPolicy::default().max_attempts,
            webhook_url: None,
            batch_id: None,
            metadata: Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A queued render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Monotonic enqueue order, breaks ties within a priority class
    pub sequence: u64,
    pub kind: JobKind,
    pub payload: Value,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub progress: Progress,
    pub webhook_url: Option<String>,
    pub batch_id: Option<BatchId>,
    pub metadata: Value,
    /// Set when cancellation was requested while the job was processing
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the latest attempt
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wake time of a delayed job
    pub run_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
}

impl Job {
    /// Materialize a new pending job.
    pub fn from_new(new: NewJob, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            sequence,
            kind: new.kind,
            payload: new.payload,
            priority: new.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.max(1),
            result: None,
            error: None,
            progress: Progress::default(),
            webhook_url: new.webhook_url,
            batch_id: new.batch_id,
            metadata: new.metadata,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            run_at: None,
            history: Vec::new(),
        }
    }

    /// Whether a worker may pick the job up at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Delayed => self.run_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Wall-clock time of the latest attempt, if it has both started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    fn transition(&self, to: JobStatus, allowed: &[JobStatus]) -> Result<(), InvalidTransition> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            })
        }
    }

    /// Take processing ownership for a new attempt.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Processing, &[JobStatus::Pending, JobStatus::Delayed])?;
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.completed_at = None;
        self.run_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Completed, &[JobStatus::Processing])?;
        self.push_attempt(None, now);
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt and park the job until `run_at`.
    pub fn schedule_retry(
        &mut self,
        failure: JobFailure,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Delayed, &[JobStatus::Processing])?;
        self.push_attempt(Some(failure), now);
        self.status = JobStatus::Delayed;
        self.run_at = Some(run_at);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt and stop retrying.
    pub fn mark_failed(&mut self, failure: JobFailure, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed, &[JobStatus::Processing])?;
        self.push_attempt(Some(failure.clone()), now);
        self.status = JobStatus::Failed;
        self.error = Some(failure);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(
            JobStatus::Cancelled,
            &[JobStatus::Pending, JobStatus::Delayed, JobStatus::Processing],
        )?;
        self.status = JobStatus::Cancelled;
        self.run_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Explicit retry of a failed or cancelled job: back to pending with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Pending, &[JobStatus::Failed, JobStatus::Cancelled])?;
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.result = None;
        self.error = None;
        self.progress = Progress::default();
        self.cancel_requested = false;
        self.started_at = None;
        self.completed_at = None;
        self.run_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn push_attempt(&mut self, error: Option<JobFailure>, now: DateTime<Utc>) {
        let started_at = self.started_at.unwrap_or(now);
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Snapshot returned by the status API.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            kind: self.kind,
            status: self.status,
            priority: self.priority,
            progress: self.progress.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            batch_id: self.batch_id,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            run_at: self.run_at,
            duration_ms: self.duration().map(|d| d.num_milliseconds()),
        }
    }
}

/// Status API view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: Priority,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_at: Option<DateTime<Utc>>,
    /// `None` when either timestamp is missing
    pub duration_ms: Option<i64>,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub batch_id: Option<BatchId>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn for_batch(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.kind.is_none_or(|k| job.kind == k)
            && self.batch_id.is_none_or(|b| job.batch_id == Some(b))
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Pending jobs
    pub waiting: usize,
    /// Processing jobs
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.waiting += 1,
            JobStatus::Processing => self.active += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    /// Jobs that still need a worker.
    pub fn outstanding(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CancelOutcome {
    /// Pending or delayed job, removed from dequeue consideration.
    Cancelled,
    /// Processing job; its handler was asked to stop.
    Requested,
    /// Nothing to do.
    AlreadyFinished { status: JobStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        Job::from_new(NewJob::new(JobKind::Single, serde_json::json!({"k": "v"})), 1, Utc::now())
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn progress_percentage_is_clamped() {
        assert_eq!(Progress::new(1, 4).percentage, 25);
        assert_eq!(Progress::new(9, 4).percentage, 100);
        assert_eq!(Progress::new(3, 0).percentage, 0);
    }

    #[test]
    fn job_lifecycle() {
        let mut job = pending_job();
        let now = Utc::now();

        job.mark_processing(now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        job.mark_completed(serde_json::json!({"url": "out.mp4"}), now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_then_retry_then_permanent_failure() {
        let mut job = pending_job();
        let now = Utc::now();

        job.mark_processing(now).unwrap();
        let failure = JobFailure::new(FailureKind::Handler, "boom");
        job.schedule_retry(failure.clone(), now + chrono::Duration::seconds(2), now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(3)));

        job.mark_processing(now + chrono::Duration::seconds(3)).unwrap();
        job.mark_failed(failure.clone(), now + chrono::Duration::seconds(4))
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error, Some(failure));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn terminal_states_reject_forward_moves() {
        let mut job = pending_job();
        let now = Utc::now();
        job.mark_processing(now).unwrap();
        job.mark_completed(Value::Null, now).unwrap();

        let err = job.mark_processing(now).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert!(job.mark_cancelled(now).is_err());
        assert!(job.reset_for_retry(now).is_err());
    }

    #[test]
    fn explicit_retry_resets_attempts() {
        let mut job = pending_job();
        let now = Utc::now();
        job.mark_processing(now).unwrap();
        job.mark_failed(JobFailure::new(FailureKind::Timeout, "slow"), now)
            .unwrap();

        job.reset_for_retry(now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());
        assert_eq!(job.history.len(), 1);
    }

    #[test]
    fn duration_unknown_without_both_timestamps() {
        let mut job = pending_job();
        assert!(job.duration().is_none());

        let start = Utc::now();
        job.mark_processing(start).unwrap();
        assert!(job.duration().is_none());

        job.mark_completed(Value::Null, start + chrono::Duration::milliseconds(1500))
            .unwrap();
        assert_eq!(job.duration(), Some(chrono::Duration::milliseconds(1500)));
        assert_eq!(job.status_view().duration_ms, Some(1500));
    }

    #[test]
    fn kinds_and_statuses_parse_from_their_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("video".parse::<JobKind>().is_err());
    }
}
