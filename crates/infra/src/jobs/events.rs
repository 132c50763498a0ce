//! Job lifecycle events (push channel).
//!
//! Lossy broadcast: slow subscribers lag and skip, publishers never block. Callers
//! that need a guaranteed view poll the store instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use renderq_core::{JobId, Priority};

use super::types::{JobFailure, JobKind, Progress};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        kind: JobKind,
        priority: Priority,
    },
    Started {
        job_id: JobId,
        attempt: u32,
    },
    Progress {
        job_id: JobId,
        progress: Progress,
    },
    Retrying {
        job_id: JobId,
        attempt: u32,
        run_at: DateTime<Utc>,
        error: JobFailure,
    },
    Completed {
        job_id: JobId,
    },
    Failed {
        job_id: JobId,
        error: JobFailure,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Completed { job_id }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }

    /// Short name, used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Enqueued { .. } => "enqueued",
            JobEvent::Started { .. } => "started",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Retrying { .. } => "retrying",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Broadcast channel of [`JobEvent`]s.
#[derive(Debug, Clone)]
pub struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let events = JobEvents::new(4);
        let mut rx = events.subscribe();
        let job_id = JobId::new();

        events.publish(JobEvent::Completed { job_id });

        let got = rx.recv().await.unwrap();
        assert_eq!(got.job_id(), job_id);
        assert_eq!(got.name(), "completed");
    }

    #[test]
    fn serializes_with_type_tag() {
        let job_id = JobId::new();
        let json = serde_json::to_value(JobEvent::Started { job_id, attempt: 2 }).unwrap();
        assert_eq!(json["type"], "started");
        assert_eq!(json["attempt"], 2);
    }
}
