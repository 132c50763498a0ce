//! Bridges job lifecycle to webhook deliveries.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::jobs::{Job, JobEvent, JobEvents, JobObserver, JobStatus};

use super::delivery::WebhookService;
use super::types::{EventType, WebhookPayload};

/// Sends `RENDER_COMPLETE` / `RENDER_FAILED` / `RENDER_CANCELLED` for every terminal
/// job, to matching subscriptions and to the job's own callback URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    service: Arc<WebhookService>,
}

impl WebhookNotifier {
    pub fn new(service: Arc<WebhookService>) -> Self {
        Self { service }
    }

    pub fn event_for(status: JobStatus) -> Option<EventType> {
        match status {
            JobStatus::Completed => Some(EventType::RenderComplete),
            JobStatus::Failed => Some(EventType::RenderFailed),
            JobStatus::Cancelled => Some(EventType::RenderCancelled),
            _ => None,
        }
    }

    fn job_data(job: &Job) -> Value {
        json!({
            "status": job.status,
            "kind": job.kind,
            "attempts": job.attempts,
            "maxAttempts": job.max_attempts,
            "result": job.result,
            "error": job.error,
            "durationMs": job.duration().map(|d| d.num_milliseconds()),
            "batchId": job.batch_id,
        })
    }

    /// Forward `RENDER_STARTED` and `RENDER_PROGRESS` from the lifecycle channel.
    ///
    /// These ride the lossy broadcast channel, so a lagging forwarder skips some;
    /// terminal events never do (they come through [`JobObserver`]).
    pub fn spawn_lifecycle_forwarder(&self, events: &JobEvents) -> JoinHandle<()> {
        let service = self.service.clone();
        let mut rx = events.subscribe();

        tokio::spawn(async move {
            loop {
                let (event, job_id, data) = match rx.recv().await {
                    Ok(JobEvent::Started { job_id, attempt }) => {
                        (EventType::RenderStarted, job_id, json!({ "attempt": attempt }))
                    }
                    Ok(JobEvent::Progress { job_id, progress }) => (
                        EventType::RenderProgress,
                        job_id,
                        json!({ "progress": progress }),
                    ),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "webhook forwarder lagged behind job events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let service = service.clone();
                tokio::spawn(async move {
                    service.trigger_webhooks(event, Some(job_id), data).await;
                });
            }
            debug!("webhook forwarder stopped");
        })
    }
}

#[async_trait]
impl JobObserver for WebhookNotifier {
    async fn on_terminal(&self, job: &Job) {
        let Some(event) = Self::event_for(job.status) else {
            return;
        };
        let payload = WebhookPayload::new(event, Some(job.id), Self::job_data(job))
            .with_metadata(job.metadata.clone());

        if let Some(url) = &job.webhook_url {
            match self.service.send_to_url(url, payload.clone()).await {
                Ok(delivery) if !delivery.success => {
                    warn!(job_id = %job.id, url = %url, "job callback was not delivered");
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, url = %url, error = %e, "job callback rejected"),
            }
        }

        let deliveries = self.service.trigger(payload).await;
        debug!(
            job_id = %job.id,
            event = %event,
            subscribers = deliveries.len(),
            delivered = deliveries.iter().filter(|d| d.success).count(),
            "job webhooks sent"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::jobs::{
        handler_fn, HandlerError, HandlerRegistry, InMemoryJobStore, JobKind, JobStore, NewJob,
        RetryPolicy, Scheduler, SchedulerConfig,
    };
    use crate::webhooks::delivery::test_support::{fast_config, spawn_receiver};
    use crate::webhooks::types::DeliveryFilter;

    #[tokio::test]
    async fn failed_job_notifies_exactly_once() {
        let (url, receiver) = spawn_receiver(&[]).await;
        let service = Arc::new(WebhookService::new(fast_config()).unwrap());
        service
            .register_webhook(url, BTreeSet::from([EventType::RenderFailed]), Value::Null)
            .await
            .unwrap();

        let store = Arc::new(InMemoryJobStore::new());
        let id = store
            .enqueue(NewJob::new(JobKind::Single, Value::Null))
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register(
            JobKind::Single,
            handler_fn(|_ctx| async { Err::<Value, _>(HandlerError::transient("ffmpeg exited 1")) }),
        );

        let config = SchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(RetryPolicy::exponential(3, Duration::from_millis(5), 2.0));
        let handle = Scheduler::new(store.clone(), registry, config)
            .with_observer(Arc::new(WebhookNotifier::new(service.clone())))
            .spawn();
        handle.wait_for_completion(Duration::from_secs(10)).await.unwrap();

        for _ in 0..200 {
            if !receiver.received().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let received = receiver.received();
        assert_eq!(received.len(), 1);
        let body = received[0].json();
        assert_eq!(body["event"], "RENDER_FAILED");
        assert_eq!(body["jobId"], id.to_string());
        assert_eq!(body["data"]["attempts"], 3);
        assert_eq!(body["data"]["error"]["message"], "ffmpeg exited 1");
    }

    #[tokio::test]
    async fn per_job_callback_and_progress_forwarding() {
        let (job_url, job_receiver) = spawn_receiver(&[]).await;
        let (sub_url, sub_receiver) = spawn_receiver(&[]).await;
        let service = Arc::new(WebhookService::new(fast_config()).unwrap());
        service
            .register_webhook(
                sub_url,
                BTreeSet::from([EventType::RenderStarted, EventType::RenderProgress]),
                Value::Null,
            )
            .await
            .unwrap();

        let store = Arc::new(InMemoryJobStore::new());
        store
            .enqueue(
                NewJob::new(JobKind::Single, Value::Null)
                    .with_webhook_url(job_url)
                    .with_metadata(json!({"project": "launch"})),
            )
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register(
            JobKind::Single,
            handler_fn(|ctx| async move {
                ctx.report_progress(crate::jobs::Progress::new(1, 2)).await;
                Ok::<_, HandlerError>(json!({"url": "s3://out.mp4"}))
            }),
        );

        let events = JobEvents::new(64);
        let notifier = WebhookNotifier::new(service.clone());
        let forwarder = notifier.spawn_lifecycle_forwarder(&events);
        let handle = Scheduler::new(
            store,
            registry,
            SchedulerConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .with_events(events)
        .with_observer(Arc::new(notifier))
        .spawn();
        handle.wait_for_completion(Duration::from_secs(10)).await.unwrap();

        for _ in 0..200 {
            if job_receiver.received().len() == 1 && sub_receiver.received().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;
        forwarder.abort();

        let callback = job_receiver.received()[0].json();
        assert_eq!(callback["event"], "RENDER_COMPLETE");
        assert_eq!(callback["data"]["result"]["url"], "s3://out.mp4");
        assert_eq!(callback["metadata"]["project"], "launch");

        let mut forwarded: Vec<_> = sub_receiver
            .received()
            .iter()
            .map(|r| r.json()["event"].as_str().unwrap().to_string())
            .collect();
        forwarded.sort();
        assert_eq!(forwarded, vec!["RENDER_PROGRESS", "RENDER_STARTED"]);

        let log = service.deliveries(&DeliveryFilter {
            event: Some(EventType::RenderComplete),
            ..Default::default()
        });
        assert_eq!(log.len(), 1);
        assert!(log[0].webhook_id.is_none());
    }
}
