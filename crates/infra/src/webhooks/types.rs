//! Webhook domain types.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use renderq_core::{DomainError, JobId, WebhookId};

use super::signing::generate_secret;

/// Event a subscription can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RenderStarted,
    RenderProgress,
    RenderComplete,
    RenderFailed,
    RenderCancelled,
    BatchComplete,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::RenderStarted,
        EventType::RenderProgress,
        EventType::RenderComplete,
        EventType::RenderFailed,
        EventType::RenderCancelled,
        EventType::BatchComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RenderStarted => "RENDER_STARTED",
            EventType::RenderProgress => "RENDER_PROGRESS",
            EventType::RenderComplete => "RENDER_COMPLETE",
            EventType::RenderFailed => "RENDER_FAILED",
            EventType::RenderCancelled => "RENDER_CANCELLED",
            EventType::BatchComplete => "BATCH_COMPLETE",
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown webhook event: {s}")))
    }
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: WebhookId,
    pub url: String,
    pub events: BTreeSet<EventType>,
    /// Hex-encoded HMAC-SHA256 key
    pub secret: String,
    pub enabled: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub(crate) fn new(url: String, events: BTreeSet<EventType>, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookId::new(),
            url,
            events,
            secret: generate_secret(),
            enabled: true,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn wants(&self, event: EventType) -> bool {
        self.enabled && self.events.contains(&event)
    }

    /// Listing view without the secret.
    pub fn view(&self) -> SubscriptionView {
        SubscriptionView {
            id: self.id,
            url: self.url.clone(),
            events: self.events.clone(),
            enabled: self.enabled,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub id: WebhookId,
    pub url: String,
    pub events: BTreeSet<EventType>,
    pub enabled: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a subscription. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub events: Option<BTreeSet<EventType>>,
    pub enabled: Option<bool>,
    pub metadata: Option<Value>,
}

/// Body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: EventType,
    pub timestamp: DateTime<Utc>,
    /// Absent for batch-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WebhookPayload {
    pub fn new(event: EventType, job_id: Option<JobId>, data: Value) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            job_id,
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = (!metadata.is_null()).then_some(metadata);
        self
    }
}

/// One delivery attempt, as kept in the delivery log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Absent for ad-hoc per-job and batch URLs
    pub webhook_id: Option<WebhookId>,
    pub url: String,
    pub event: EventType,
    pub payload: WebhookPayload,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub status_code: Option<u16>,
    pub success: bool,
    pub error: Option<String>,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Final outcome of delivering one payload to one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub webhook_id: Option<WebhookId>,
    pub url: String,
    pub event: EventType,
    pub success: bool,
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Filter for reading the delivery log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryFilter {
    pub webhook_id: Option<WebhookId>,
    pub event: Option<EventType>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

impl DeliveryFilter {
    pub fn matches(&self, record: &DeliveryRecord) -> bool {
        self.webhook_id.is_none_or(|id| record.webhook_id == Some(id))
            && self.event.is_none_or(|e| record.event == e)
            && self.success.is_none_or(|s| record.success == s)
    }
}

/// Delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    /// Per-request timeout
    pub timeout: Duration,
    /// Wait after the first failed attempt
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    /// Cap on the wait between attempts
    pub max_delay: Duration,
    /// Delivery log retention; oldest records are evicted first
    pub log_capacity: usize,
    /// Signs per-job and batch callbacks, which have no subscription secret
    pub default_secret: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            log_capacity: 1000,
            default_secret: generate_secret(),
        }
    }
}

impl WebhookConfig {
    /// Wait before attempt `attempt + 1`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(0.0).powi(exp);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_on_the_wire() {
        let json = serde_json::to_value(EventType::RenderComplete).unwrap();
        assert_eq!(json, "RENDER_COMPLETE");
        assert_eq!("batch_complete".parse::<EventType>().unwrap(), EventType::BatchComplete);
        assert!("RENDER_EXPLODED".parse::<EventType>().is_err());
    }

    #[test]
    fn payload_is_camel_case() {
        let job_id = JobId::new();
        let payload = WebhookPayload::new(
            EventType::RenderFailed,
            Some(job_id),
            serde_json::json!({"error": "boom"}),
        )
        .with_metadata(Value::Null);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "RENDER_FAILED");
        assert_eq!(json["jobId"], job_id.to_string());
        assert!(json.get("metadata").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn delivery_backoff() {
        let config = WebhookConfig::default();
        assert_eq!(config.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_after_attempt(66), config.max_delay);
        assert_eq!(config.delay_after_attempt(u32::MAX), config.max_delay);
    }

    #[test]
    fn delivery_backoff_tolerates_bad_multipliers() {
        let negative = WebhookConfig {
            backoff_multiplier: -2.0,
            ..WebhookConfig::default()
        };
        assert_eq!(negative.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(negative.delay_after_attempt(2), Duration::ZERO);

        let nan = WebhookConfig {
            backoff_multiplier: f64::NAN,
            ..WebhookConfig::default()
        };
        assert!(nan.delay_after_attempt(3) <= nan.max_delay);
    }

    #[test]
    fn disabled_subscription_wants_nothing() {
        let mut sub = Subscription::new(
            "https://example.com/hook".into(),
            BTreeSet::from([EventType::RenderComplete]),
            Value::Null,
        );
        assert!(sub.wants(EventType::RenderComplete));
        assert!(!sub.wants(EventType::RenderFailed));
        sub.enabled = false;
        assert!(!sub.wants(EventType::RenderComplete));
        assert_eq!(sub.secret.len(), 64);
    }
}
