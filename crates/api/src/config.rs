//! Process configuration from `RENDERQ_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `RENDERQ_BIND_ADDR` | `0.0.0.0:8080` |
//! | `RENDERQ_LOG_FORMAT` | `json` (`json` or `pretty`) |
//! | `RENDERQ_WORKERS` | `4` |
//! | `RENDERQ_JOB_TIMEOUT_SECS` | `600` |
//! | `RENDERQ_POLL_INTERVAL_MS` | `250` |
//! | `RENDERQ_MAX_ATTEMPTS` | `3` |
//! | `RENDERQ_RETRY_BASE_DELAY_MS` | `2000` |
//! | `RENDERQ_RETRY_MULTIPLIER` | `2.0` |
//! | `RENDERQ_RETRY_MAX_DELAY_SECS` | `300` |
//! | `RENDERQ_SHUTDOWN_GRACE_SECS` | `120` |
//! | `RENDERQ_WEBHOOK_TIMEOUT_SECS` | `30` |
//! | `RENDERQ_WEBHOOK_MAX_ATTEMPTS` | `3` |
//! | `RENDERQ_WEBHOOK_RETRY_DELAY_MS` | `1000` |
//! | `RENDERQ_WEBHOOK_MAX_DELAY_SECS` | `60` |
//! | `RENDERQ_DELIVERY_LOG_CAPACITY` | `1000` |
//! | `RENDERQ_WEBHOOK_SECRET` | random per process |
//! | `RENDERQ_RENDER_ENDPOINT` | unset: jobs are echoed back (development) |
//! | `RENDERQ_PLANS` | unset; `caller=tier[:status],...` |
//! | `DATABASE_URL` | unset (feature `postgres`) |
//! | `USE_PERSISTENT_STORES` | `false` (feature `postgres`) |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use renderq_infra::jobs::{RetryPolicy, SchedulerConfig};
use renderq_infra::priority::{CallerId, CallerPlan, PlanStatus, PlanTier};
use renderq_infra::webhooks::WebhookConfig;
use renderq_observability::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    pub scheduler: SchedulerConfig,
    pub webhooks: WebhookConfig,
    /// Render service the HTTP forwarding handler POSTs jobs to
    pub render_endpoint: Option<String>,
    /// Static caller plans for the in-process plan directory
    pub plans: Vec<(CallerId, CallerPlan)>,
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "RENDERQ_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: Duration::from_millis(parse_or(&get, "RENDERQ_RETRY_BASE_DELAY_MS", 2000)?),
            backoff_multiplier: parse_or(&get, "RENDERQ_RETRY_MULTIPLIER", retry_defaults.backoff_multiplier)?,
            max_delay: Duration::from_secs(parse_or(&get, "RENDERQ_RETRY_MAX_DELAY_SECS", 300)?),
        };
        if retry.max_attempts == 0 {
            return Err(invalid("RENDERQ_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let workers: usize = parse_or(&get, "RENDERQ_WORKERS", 4)?;
        if workers == 0 {
            return Err(invalid("RENDERQ_WORKERS", "0", "must be at least 1"));
        }

        let scheduler = SchedulerConfig::default()
            .with_max_concurrent(workers)
            .with_job_timeout(Duration::from_secs(parse_or(&get, "RENDERQ_JOB_TIMEOUT_SECS", 600)?))
            .with_poll_interval(Duration::from_millis(parse_or(&get, "RENDERQ_POLL_INTERVAL_MS", 250)?))
            .with_retry(retry)
            .with_shutdown_grace(Duration::from_secs(parse_or(&get, "RENDERQ_SHUTDOWN_GRACE_SECS", 120)?));

        let webhook_defaults = WebhookConfig::default();
        let webhooks = WebhookConfig {
            max_attempts: parse_or(&get, "RENDERQ_WEBHOOK_MAX_ATTEMPTS", webhook_defaults.max_attempts)?,
            timeout: Duration::from_secs(parse_or(&get, "RENDERQ_WEBHOOK_TIMEOUT_SECS", 30)?),
            retry_delay: Duration::from_millis(parse_or(&get, "RENDERQ_WEBHOOK_RETRY_DELAY_MS", 1000)?),
            max_delay: Duration::from_secs(parse_or(&get, "RENDERQ_WEBHOOK_MAX_DELAY_SECS", 60)?),
            log_capacity: parse_or(&get, "RENDERQ_DELIVERY_LOG_CAPACITY", webhook_defaults.log_capacity)?,
            default_secret: get("RENDERQ_WEBHOOK_SECRET").unwrap_or(webhook_defaults.default_secret),
            ..webhook_defaults
        };

        let render_endpoint = get("RENDERQ_RENDER_ENDPOINT");
        if let Some(url) = &render_endpoint {
            renderq_infra::webhooks::validate_url(url)
                .map_err(|e| invalid("RENDERQ_RENDER_ENDPOINT", url, e.to_string()))?;
        }

        let plans = match get("RENDERQ_PLANS") {
            Some(raw) => parse_plans(&raw)?,
            None => Vec::new(),
        };

        let use_persistent_stores = parse_or(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            bind_addr: parse_or(&get, "RENDERQ_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            log_format: parse_or(&get, "RENDERQ_LOG_FORMAT", LogFormat::Json)?,
            scheduler,
            webhooks,
            render_endpoint,
            plans,
            database_url,
            use_persistent_stores,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&'static str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
        None => Ok(default),
    }
}

/// `acme=business,solo=pro:trialing,old=starter:inactive`
fn parse_plans(raw: &str) -> Result<Vec<(CallerId, CallerPlan)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (caller, plan) = entry
                .split_once('=')
                .ok_or_else(|| invalid("RENDERQ_PLANS", entry, "expected caller=tier"))?;
            let (tier, status) = plan.split_once(':').unwrap_or((plan, "active"));
            let tier: PlanTier = tier
                .parse()
                .map_err(|e: renderq_core::DomainError| invalid("RENDERQ_PLANS", entry, e.to_string()))?;
            let status = match status.trim() {
                "active" => PlanStatus::Active,
                "trialing" => PlanStatus::Trialing,
                "inactive" => PlanStatus::Inactive,
                other => return Err(invalid("RENDERQ_PLANS", entry, format!("unknown status {other}"))),
            };
            Ok((CallerId::new(caller.trim()), CallerPlan { tier, status }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.scheduler.max_concurrent, 4);
        assert_eq!(cfg.scheduler.job_timeout, Duration::from_secs(600));
        assert_eq!(cfg.scheduler.retry.max_attempts, 3);
        assert_eq!(cfg.scheduler.retry.base_delay, Duration::from_secs(2));
        assert_eq!(cfg.scheduler.shutdown_grace, Duration::from_secs(120));
        assert_eq!(cfg.webhooks.max_delay, Duration::from_secs(60));
        assert_eq!(cfg.webhooks.timeout, Duration::from_secs(30));
        assert_eq!(cfg.webhooks.log_capacity, 1000);
        assert_eq!(cfg.webhooks.default_secret.len(), 64);
        assert!(cfg.render_endpoint.is_none());
        assert!(!cfg.use_persistent_stores);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("RENDERQ_BIND_ADDR", "127.0.0.1:9000"),
            ("RENDERQ_WORKERS", "8"),
            ("RENDERQ_RETRY_MULTIPLIER", "3.0"),
            ("RENDERQ_WEBHOOK_SECRET", "s3cret"),
            ("RENDERQ_LOG_FORMAT", "pretty"),
            ("RENDERQ_RENDER_ENDPOINT", "http://renderer:7000/render"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(cfg.scheduler.max_concurrent, 8);
        assert_eq!(cfg.scheduler.retry.backoff_multiplier, 3.0);
        assert_eq!(cfg.webhooks.default_secret, "s3cret");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.render_endpoint.as_deref(), Some("http://renderer:7000/render"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = config(&[("RENDERQ_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "RENDERQ_WORKERS", .. }));

        assert!(config(&[("RENDERQ_WORKERS", "0")]).is_err());
        assert!(config(&[("RENDERQ_RENDER_ENDPOINT", "renderer")]).is_err());
        assert!(matches!(
            config(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        ));
    }

    #[test]
    fn plans() {
        let cfg = config(&[("RENDERQ_PLANS", "acme=business, solo=pro:trialing,old=starter:inactive")]).unwrap();
        assert_eq!(
            cfg.plans,
            vec![
                (CallerId::new("acme"), CallerPlan::active(PlanTier::Business)),
                (CallerId::new("solo"), CallerPlan::trialing(PlanTier::Pro)),
                (CallerId::new("old"), CallerPlan::inactive(PlanTier::Starter)),
            ]
        );
        assert!(config(&[("RENDERQ_PLANS", "acme")]).is_err());
        assert!(config(&[("RENDERQ_PLANS", "acme=gold")]).is_err());
    }
}
