//! Job handlers the server binary registers.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use renderq_infra::jobs::{HandlerError, JobContext, JobHandler, Progress};

/// POSTs each job to an external render service and stores its JSON reply as
/// the job result.
///
/// `5xx` and network errors are transient (the job is retried); `4xx` is
/// permanent.
#[derive(Debug, Clone)]
pub struct HttpForwardHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpForwardHandler {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl JobHandler for HttpForwardHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        ctx.ensure_not_cancelled()?;

        let body = json!({
            "jobId": ctx.job_id(),
            "kind": ctx.kind(),
            "attempt": ctx.attempt(),
            "payload": ctx.payload(),
            "metadata": ctx.metadata(),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| HandlerError::transient(format!("render service unreachable: {e}")))?;

        let status = response.status();
        debug!(job_id = %ctx.job_id(), status = status.as_u16(), "render service replied");

        if status.is_server_error() {
            return Err(HandlerError::transient(format!("render service returned {status}"))
                .with_context(json!({ "statusCode": status.as_u16() })));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(HandlerError::permanent(format!("render service rejected job: {status}"))
                .with_context(json!({ "statusCode": status.as_u16(), "body": detail })));
        }

        let text = response
            .text()
            .await
            .map_err(|e| HandlerError::transient(format!("failed to read render reply: {e}")))?;
        ctx.report_progress(Progress::new(1, 1)).await;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| HandlerError::permanent(format!("render reply is not JSON: {e}")))
    }
}

/// Development stand-in when no render endpoint is configured: completes every
/// job immediately, echoing its payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        ctx.ensure_not_cancelled()?;
        ctx.report_progress(Progress::new(1, 1)).await;
        Ok(json!({ "echo": ctx.payload(), "attempt": ctx.attempt() }))
    }
}
