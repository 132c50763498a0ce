use std::collections::BTreeSet;

use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use renderq_core::{BatchId, Priority, WebhookId};
use renderq_infra::jobs::{JobFilter, JobKind, JobStatus};
use renderq_infra::priority::CallerId;
use renderq_infra::queue::SubmitOptions;
use renderq_infra::webhooks::{DeliveryFilter, EventType};

use crate::app::errors;

/// Largest page a list endpoint returns.
pub const MAX_LIST_LIMIT: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

/// Priority as a class name (`"high"`) or a raw value (`1`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriorityField {
    Value(u8),
    Name(String),
}

impl PriorityField {
    pub fn resolve(&self) -> Result<Priority, axum::response::Response> {
        match self {
            PriorityField::Value(v) => Ok(Priority::new(*v)),
            PriorityField::Name(name) => name.parse().map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_priority",
                    "priority must be a number or one of: urgent, high, normal, low",
                )
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default = "default_kind")]
    pub kind: JobKind,
    #[serde(default)]
    pub payload: Value,
    pub priority: Option<PriorityField>,
    pub caller: Option<String>,
    pub max_attempts: Option<u32>,
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

fn default_kind() -> JobKind {
    JobKind::Single
}

impl SubmitJobRequest {
    pub fn options(&self) -> Result<SubmitOptions, axum::response::Response> {
        Ok(SubmitOptions {
            priority: self.priority.as_ref().map(PriorityField::resolve).transpose()?,
            caller: self.caller.as_deref().map(CallerId::from),
            max_attempts: self.max_attempts,
            webhook_url: self.webhook_url.clone(),
            metadata: self.metadata.clone(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub batch_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn to_filter(&self) -> Result<JobFilter, axum::response::Response> {
        let status = match self.status.as_deref() {
            Some(s) => Some(s.parse::<JobStatus>().map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string())
            })?),
            None => None,
        };
        let kind = match self.kind.as_deref() {
            Some(s) => Some(s.parse::<JobKind>().map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_kind", e.to_string())
            })?),
            None => None,
        };
        let batch_id = match self.batch_id.as_deref() {
            Some(s) => Some(s.parse::<BatchId>().map_err(|_| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid batch id")
            })?),
            None => None,
        };
        Ok(JobFilter {
            status,
            kind,
            batch_id,
            limit: Some(self.limit.unwrap_or(100).min(MAX_LIST_LIMIT)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookRequest {
    pub url: String,
    pub events: BTreeSet<EventType>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveriesQuery {
    pub webhook_id: Option<String>,
    pub event: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

impl DeliveriesQuery {
    pub fn to_filter(&self) -> Result<DeliveryFilter, axum::response::Response> {
        let webhook_id = match self.webhook_id.as_deref() {
            Some(s) => Some(s.parse::<WebhookId>().map_err(|_| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid webhook id")
            })?),
            None => None,
        };
        let event = match self.event.as_deref() {
            Some(s) => Some(s.parse::<EventType>().map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_event", e.to_string())
            })?),
            None => None,
        };
        Ok(DeliveryFilter {
            webhook_id,
            event,
            success: self.success,
            limit: Some(self.limit.unwrap_or(100).min(MAX_LIST_LIMIT)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitBatchRequest {
    pub items: Vec<Value>,
    pub quality: Option<String>,
    pub concurrency: Option<u32>,
    pub webhook_url: Option<String>,
    pub priority: Option<PriorityField>,
    pub caller: Option<String>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub job_id: Option<String>,
}
