//! Subscription registry and signed delivery.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use renderq_core::{JobId, WebhookId};

use super::log::DeliveryLog;
use super::signing::{self, generate_secret};
use super::types::{
    Delivery, DeliveryFilter, DeliveryRecord, EventType, Subscription, WebhookConfig,
    WebhookPayload, WebhookUpdate,
};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-ID";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook not found: {0}")]
    NotFound(WebhookId),
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),
    #[error("a webhook must subscribe to at least one event")]
    NoEvents,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("http client error: {0}")]
    Client(String),
}

/// Accept absolute http(s) URLs only.
pub fn validate_url(url: &str) -> Result<(), WebhookError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| WebhookError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(WebhookError::InvalidUrl(format!("unsupported scheme: {other}"))),
    }
}

/// Where one payload goes and how it is signed.
#[derive(Debug, Clone)]
struct Target {
    webhook_id: Option<WebhookId>,
    url: String,
    secret: String,
}

impl From<&Subscription> for Target {
    fn from(sub: &Subscription) -> Self {
        Self {
            webhook_id: Some(sub.id),
            url: sub.url.clone(),
            secret: sub.secret.clone(),
        }
    }
}

/// HTTP side of delivery. Cheap to clone into fan-out tasks.
#[derive(Debug, Clone)]
struct Deliverer {
    client: reqwest::Client,
    config: Arc<WebhookConfig>,
    log: Arc<DeliveryLog>,
}

impl Deliverer {
    /// POST with retries. Every attempt lands in the log; the return value is the
    /// final outcome. Never errors: failures are data.
    async fn deliver(&self, target: Target, payload: WebhookPayload, body: Arc<Vec<u8>>) -> Delivery {
        let signature = signing::sign(&body, &target.secret);
        let max_attempts = self.config.max_attempts.max(1);
        let mut outcome = Delivery {
            webhook_id: target.webhook_id,
            url: target.url.clone(),
            event: payload.event,
            success: false,
            attempts: 0,
            status_code: None,
            error: None,
        };

        for attempt in 1..=max_attempts {
            let mut request = self
                .client
                .post(&target.url)
                .timeout(self.config.timeout)
                .header(CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .header(EVENT_HEADER, payload.event.as_str());
            if let Some(id) = target.webhook_id {
                request = request.header(WEBHOOK_ID_HEADER, id.to_string());
            }

            let started = Instant::now();
            let (status_code, error) = match request.body(body.as_ref().clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    let error = (!status.is_success()).then(|| format!("endpoint returned {status}"));
                    (Some(status.as_u16()), error)
                }
                Err(e) if e.is_timeout() => (None, Some(format!("timed out after {:?}", self.config.timeout))),
                Err(e) => (None, Some(e.to_string())),
            };
            let response_time_ms = started.elapsed().as_millis() as u64;
            let success = error.is_none();

            self.log.append(DeliveryRecord {
                webhook_id: target.webhook_id,
                url: target.url.clone(),
                event: payload.event,
                payload: payload.clone(),
                attempt_number: attempt,
                max_attempts,
                status_code,
                success,
                error: error.clone(),
                response_time_ms,
                timestamp: Utc::now(),
            });

            outcome.attempts = attempt;
            outcome.status_code = status_code;
            outcome.success = success;
            outcome.error = error;

            if success {
                debug!(
                    url = %target.url,
                    event = %payload.event,
                    attempt,
                    response_time_ms,
                    "webhook delivered"
                );
                return outcome;
            }

            warn!(
                url = %target.url,
                event = %payload.event,
                attempt,
                max_attempts,
                status = ?status_code,
                error = ?outcome.error,
                "webhook delivery attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.delay_after_attempt(attempt)).await;
            }
        }

        error!(
            url = %target.url,
            event = %payload.event,
            attempts = outcome.attempts,
            "webhook delivery gave up"
        );
        outcome
    }
}

/// Webhook registry plus delivery.
pub struct WebhookService {
    subscriptions: RwLock<HashMap<WebhookId, Subscription>>,
    deliverer: Deliverer,
}

impl WebhookService {
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        let log = Arc::new(DeliveryLog::new(config.log_capacity));
        Ok(Self {
            subscriptions: RwLock::new(HashMap::new()),
            deliverer: Deliverer {
                client,
                config: Arc::new(config),
                log,
            },
        })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.deliverer.config
    }

    pub async fn register_webhook(
        &self,
        url: impl Into<String>,
        events: BTreeSet<EventType>,
        metadata: Value,
    ) -> Result<Subscription, WebhookError> {
        let url = url.into();
        validate_url(&url)?;
        if events.is_empty() {
            return Err(WebhookError::NoEvents);
        }

        let subscription = Subscription::new(url, events, metadata);
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());

        info!(
            webhook_id = %subscription.id,
            url = %subscription.url,
            events = ?subscription.events,
            "webhook registered"
        );
        Ok(subscription)
    }

    pub async fn update_webhook(&self, id: WebhookId, update: WebhookUpdate) -> Result<Subscription, WebhookError> {
        if let Some(url) = &update.url {
            validate_url(url)?;
        }
        if update.events.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(WebhookError::NoEvents);
        }

        let mut subscriptions = self.subscriptions.write().await;
        let sub = subscriptions.get_mut(&id).ok_or(WebhookError::NotFound(id))?;
        if let Some(url) = update.url {
            sub.url = url;
        }
        if let Some(events) = update.events {
            sub.events = events;
        }
        if let Some(enabled) = update.enabled {
            sub.enabled = enabled;
        }
        if let Some(metadata) = update.metadata {
            sub.metadata = metadata;
        }
        sub.updated_at = Utc::now();

        debug!(webhook_id = %id, "webhook updated");
        Ok(sub.clone())
    }

    /// Replace the secret. Only future deliveries use the new one.
    pub async fn rotate_secret(&self, id: WebhookId) -> Result<Subscription, WebhookError> {
        let mut subscriptions = self.subscriptions.write().await;
        let sub = subscriptions.get_mut(&id).ok_or(WebhookError::NotFound(id))?;
        sub.secret = generate_secret();
        sub.updated_at = Utc::now();
        info!(webhook_id = %id, "webhook secret rotated");
        Ok(sub.clone())
    }

    pub async fn remove_webhook(&self, id: WebhookId) -> Result<Subscription, WebhookError> {
        let removed = self
            .subscriptions
            .write()
            .await
            .remove(&id)
            .ok_or(WebhookError::NotFound(id))?;
        info!(webhook_id = %id, "webhook removed");
        Ok(removed)
    }

    pub async fn get_webhook(&self, id: WebhookId) -> Option<Subscription> {
        self.subscriptions.read().await.get(&id).cloned()
    }

    /// All subscriptions, oldest first.
    pub async fn list_webhooks(&self) -> Vec<Subscription> {
        let mut subs: Vec<_> = self.subscriptions.read().await.values().cloned().collect();
        subs.sort_by_key(|s| (s.created_at, *s.id.as_uuid()));
        subs
    }

    /// Fan out to every enabled subscription listening for `event`; returns once all settle.
    pub async fn trigger_webhooks(&self, event: EventType, job_id: Option<JobId>, data: Value) -> Vec<Delivery> {
        self.trigger(WebhookPayload::new(event, job_id, data)).await
    }

    /// Fan out a prepared payload.
    pub async fn trigger(&self, payload: WebhookPayload) -> Vec<Delivery> {
        let targets: Vec<Target> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.wants(payload.event))
            .map(Target::from)
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => Arc::new(body),
            Err(e) => {
                error!(event = %payload.event, error = %e, "failed to encode webhook payload");
                return Vec::new();
            }
        };

        let mut set = JoinSet::new();
        for target in targets {
            let deliverer = self.deliverer.clone();
            let payload = payload.clone();
            let body = body.clone();
            set.spawn(async move { deliverer.deliver(target, payload, body).await });
        }

        let mut deliveries = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => error!(event = %payload.event, error = %e, "webhook delivery task failed"),
            }
        }
        deliveries
    }

    /// Deliver to one subscription regardless of its event filter.
    pub async fn send_webhook(&self, subscription: &Subscription, payload: WebhookPayload) -> Result<Delivery, WebhookError> {
        let body = Arc::new(serde_json::to_vec(&payload)?);
        Ok(self.deliverer.deliver(Target::from(subscription), payload, body).await)
    }

    /// Deliver to an ad-hoc callback URL (per-job or batch), signed with the default secret.
    pub async fn send_to_url(&self, url: &str, payload: WebhookPayload) -> Result<Delivery, WebhookError> {
        validate_url(url)?;
        let body = Arc::new(serde_json::to_vec(&payload)?);
        let target = Target {
            webhook_id: None,
            url: url.to_string(),
            secret: self.deliverer.config.default_secret.clone(),
        };
        Ok(self.deliverer.deliver(target, payload, body).await)
    }

    /// Delivery log, newest first.
    pub fn deliveries(&self, filter: &DeliveryFilter) -> Vec<DeliveryRecord> {
        self.deliverer.log.list(filter)
    }

    pub fn verify_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        signing::verify_signature(payload, signature, secret)
    }
}

impl core::fmt::Debug for WebhookService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebhookService")
            .field("config", &self.deliverer.config.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;

    /// A request as seen by the receiver.
    #[derive(Debug, Clone)]
    pub struct Received {
        pub headers: HeaderMap,
        pub body: Bytes,
    }

    impl Received {
        pub fn header(&self, name: &str) -> Option<String> {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    #[derive(Default)]
    pub struct ReceiverState {
        pub scripted: Mutex<VecDeque<u16>>,
        pub received: Mutex<Vec<Received>>,
    }

    impl ReceiverState {
        pub fn received(&self) -> Vec<Received> {
            self.received.lock().unwrap().clone()
        }
    }

    async fn receive(
        State(state): State<std::sync::Arc<ReceiverState>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        state.received.lock().unwrap().push(Received { headers, body });
        let code = state.scripted.lock().unwrap().pop_front().unwrap_or(200);
        StatusCode::from_u16(code).unwrap()
    }

    /// Local endpoint answering with `responses` in order, then 200.
    pub async fn spawn_receiver(responses: &[u16]) -> (String, std::sync::Arc<ReceiverState>) {
        let state = std::sync::Arc::new(ReceiverState {
            scripted: Mutex::new(responses.iter().copied().collect()),
            received: Mutex::default(),
        });
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), state)
    }

    use crate::webhooks::types::WebhookConfig;

    /// Short timeouts and retry delays.
    pub fn fast_config() -> WebhookConfig {
        WebhookConfig {
            timeout: std::time::Duration::from_secs(2),
            retry_delay: std::time::Duration::from_millis(10),
            ..WebhookConfig::default()
        }
    }

    /// URL of a port nothing listens on.
    pub async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/hook")
    }
}
