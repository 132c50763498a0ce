//! Caller plan → queue priority.
//!
//! The plan itself lives in an external billing system reached through
//! [`PlanLookup`]. Lookups degrade to the lowest class on any error; they never
//! fail or hold up an enqueue.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use renderq_core::{DomainError, Priority};

/// Opaque caller identity (user or organization id as issued upstream).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CallerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Trial,
    Starter,
    Pro,
    Business,
    Enterprise,
    Premium,
}

impl PlanTier {
    pub const ALL: [PlanTier; 7] = [
        PlanTier::Free,
        PlanTier::Trial,
        PlanTier::Starter,
        PlanTier::Pro,
        PlanTier::Business,
        PlanTier::Enterprise,
        PlanTier::Premium,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Trial => "trial",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Business => "business",
            PlanTier::Enterprise => "enterprise",
            PlanTier::Premium => "premium",
        }
    }

    pub fn priority(self) -> Priority {
        match self {
            PlanTier::Free => Priority::LOW,
            PlanTier::Trial => Priority::NORMAL,
            PlanTier::Starter | PlanTier::Pro => Priority::HIGH,
            PlanTier::Business | PlanTier::Enterprise | PlanTier::Premium => Priority::URGENT,
        }
    }

    /// Relative processing allowance, 1–5. Independent of queue priority.
    pub fn throughput_multiplier(self) -> u8 {
        match self {
            PlanTier::Free | PlanTier::Trial => 1,
            PlanTier::Starter => 2,
            PlanTier::Pro => 3,
            PlanTier::Business => 4,
            PlanTier::Enterprise | PlanTier::Premium => 5,
        }
    }
}

impl core::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PlanTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" | "none" => Ok(PlanTier::Free),
            "trial" => Ok(PlanTier::Trial),
            "starter" => Ok(PlanTier::Starter),
            "pro" => Ok(PlanTier::Pro),
            "business" => Ok(PlanTier::Business),
            "enterprise" => Ok(PlanTier::Enterprise),
            "premium" => Ok(PlanTier::Premium),
            other => Err(DomainError::validation(format!("unknown plan tier: {other}"))),
        }
    }
}

/// Billing state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Trialing,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerPlan {
    pub tier: PlanTier,
    pub status: PlanStatus,
}

impl CallerPlan {
    pub fn active(tier: PlanTier) -> Self {
        Self {
            tier,
            status: PlanStatus::Active,
        }
    }

    pub fn trialing(tier: PlanTier) -> Self {
        Self {
            tier,
            status: PlanStatus::Trialing,
        }
    }

    pub fn inactive(tier: PlanTier) -> Self {
        Self {
            tier,
            status: PlanStatus::Inactive,
        }
    }

    /// Tier that actually applies: a lapsed plan counts as free, a trial as trial.
    pub fn effective_tier(&self) -> PlanTier {
        match self.status {
            PlanStatus::Active => self.tier,
            PlanStatus::Trialing => PlanTier::Trial,
            PlanStatus::Inactive => PlanTier::Free,
        }
    }
}

/// Effective tier for an optional plan; no plan is the free tier.
pub fn effective_tier(plan: Option<&CallerPlan>) -> PlanTier {
    plan.map_or(PlanTier::Free, CallerPlan::effective_tier)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanLookupError {
    #[error("plan lookup unavailable: {0}")]
    Unavailable(String),
    #[error("plan lookup timed out after {0:?}")]
    TimedOut(Duration),
}

/// Source of caller plans (billing system, account service, ...).
#[async_trait]
pub trait PlanLookup: Send + Sync {
    /// `Ok(None)` means the caller has no plan.
    async fn plan_for(&self, caller: &CallerId) -> Result<Option<CallerPlan>, PlanLookupError>;
}

/// Priority and throughput decided for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriorityAssessment {
    pub tier: PlanTier,
    pub priority: Priority,
    pub throughput_multiplier: u8,
}

impl From<PlanTier> for PriorityAssessment {
    fn from(tier: PlanTier) -> Self {
        Self {
            tier,
            priority: tier.priority(),
            throughput_multiplier: tier.throughput_multiplier(),
        }
    }
}

/// Maps callers to queue priority via their plan.
#[derive(Clone)]
pub struct PriorityPolicy {
    lookup: Arc<dyn PlanLookup>,
    lookup_timeout: Duration,
}

impl PriorityPolicy {
    pub fn new(lookup: Arc<dyn PlanLookup>) -> Self {
        Self {
            lookup,
            lookup_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Effective tier; any lookup failure yields [`PlanTier::Free`].
    pub async fn classify(&self, caller: &CallerId) -> PlanTier {
        let lookup = tokio::time::timeout(self.lookup_timeout, self.lookup.plan_for(caller))
            .await
            .unwrap_or(Err(PlanLookupError::TimedOut(self.lookup_timeout)));

        match lookup {
            Ok(plan) => {
                let tier = effective_tier(plan.as_ref());
                debug!(caller = %caller, tier = %tier, "resolved caller plan");
                tier
            }
            Err(e) => {
                warn!(caller = %caller, error = %e, "plan lookup failed, using lowest priority");
                PlanTier::Free
            }
        }
    }

    pub async fn assess(&self, caller: &CallerId) -> PriorityAssessment {
        self.classify(caller).await.into()
    }

    pub async fn priority_for(&self, caller: &CallerId) -> Priority {
        self.classify(caller).await.priority()
    }

    pub async fn throughput_multiplier(&self, caller: &CallerId) -> u8 {
        self.classify(caller).await.throughput_multiplier()
    }
}

impl core::fmt::Debug for PriorityPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PriorityPolicy")
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

/// In-memory plan table for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryPlanDirectory {
    plans: RwLock<HashMap<CallerId, CallerPlan>>,
}

impl InMemoryPlanDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plan(&self, caller: impl Into<CallerId>, plan: CallerPlan) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(caller.into(), plan);
    }

    pub fn remove_plan(&self, caller: &CallerId) -> Option<CallerPlan> {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(caller)
    }
}

#[async_trait]
impl PlanLookup for InMemoryPlanDirectory {
    async fn plan_for(&self, caller: &CallerId) -> Result<Option<CallerPlan>, PlanLookupError> {
        Ok(self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(caller)
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenLookup;

    #[async_trait]
    impl PlanLookup for BrokenLookup {
        async fn plan_for(&self, _caller: &CallerId) -> Result<Option<CallerPlan>, PlanLookupError> {
            Err(PlanLookupError::Unavailable("billing db down".into()))
        }
    }

    struct HangingLookup;

    #[async_trait]
    impl PlanLookup for HangingLookup {
        async fn plan_for(&self, _caller: &CallerId) -> Result<Option<CallerPlan>, PlanLookupError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(CallerPlan::active(PlanTier::Enterprise)))
        }
    }

    #[test]
    fn tier_table() {
        let table: Vec<_> = PlanTier::ALL
            .iter()
            .map(|t| (t.as_str(), t.priority(), t.throughput_multiplier()))
            .collect();
        assert_eq!(
            table,
            vec![
                ("free", Priority::LOW, 1),
                ("trial", Priority::NORMAL, 1),
                ("starter", Priority::HIGH, 2),
                ("pro", Priority::HIGH, 3),
                ("business", Priority::URGENT, 4),
                ("enterprise", Priority::URGENT, 5),
                ("premium", Priority::URGENT, 5),
            ]
        );
    }

    #[test]
    fn lapsed_and_missing_plans_are_free() {
        assert_eq!(effective_tier(None), PlanTier::Free);
        assert_eq!(
            effective_tier(Some(&CallerPlan::inactive(PlanTier::Enterprise))),
            PlanTier::Free
        );
        assert_eq!(
            effective_tier(Some(&CallerPlan::trialing(PlanTier::Pro))),
            PlanTier::Trial
        );
    }

    #[test]
    fn parses_tier_names() {
        assert_eq!("Business".parse::<PlanTier>().unwrap(), PlanTier::Business);
        assert_eq!("none".parse::<PlanTier>().unwrap(), PlanTier::Free);
        assert!("platinum".parse::<PlanTier>().is_err());
    }

    #[tokio::test]
    async fn policy_uses_directory() {
        let directory = Arc::new(InMemoryPlanDirectory::new());
        directory.set_plan("acme", CallerPlan::active(PlanTier::Business));
        let policy = PriorityPolicy::new(directory.clone());

        let acme = CallerId::from("acme");
        assert_eq!(policy.priority_for(&acme).await, Priority::URGENT);
        assert_eq!(policy.throughput_multiplier(&acme).await, 4);
        assert_eq!(policy.priority_for(&"nobody".into()).await, Priority::LOW);

        directory.remove_plan(&acme);
        assert_eq!(policy.assess(&acme).await, PriorityAssessment::from(PlanTier::Free));
    }

    #[tokio::test]
    async fn lookup_failure_degrades_to_low() {
        let policy = PriorityPolicy::new(Arc::new(BrokenLookup));
        let caller = CallerId::from("acme");
        assert_eq!(policy.priority_for(&caller).await, Priority::LOW);
        assert_eq!(policy.throughput_multiplier(&caller).await, 1);
    }

    #[tokio::test]
    async fn slow_lookup_times_out_to_low() {
        let policy = PriorityPolicy::new(Arc::new(HangingLookup))
            .with_lookup_timeout(Duration::from_millis(20));
        assert_eq!(policy.priority_for(&"acme".into()).await, Priority::LOW);
    }
}
