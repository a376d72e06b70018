use chrono::{DateTime, Duration, Utc};

use super::StrategicPlan;

/// Why a lookup did or did not return a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Nothing cached yet.
    Empty,
    /// Cached plan is valid.
    Hit,
    /// Forecast signature differs from the cached plan's.
    SignatureChanged,
    /// Cached plan is older than the TTL.
    Expired,
}

impl CacheStatus {
    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Hit => "hit",
            Self::SignatureChanged => "signature_changed",
            Self::Expired => "expired",
        }
    }
}

/// Single-entry plan cache owned by the control loop.
#[derive(Debug, Clone)]
pub struct PlanCache {
    ttl: Duration,
    entry: Option<StrategicPlan>,
}

impl PlanCache {
    /// Cache with a time-to-live.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// Time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Checks the cached plan against a signature at `now`.
    #[must_use]
    pub fn status(&self, signature: &str, now: DateTime<Utc>) -> CacheStatus {
        match &self.entry {
            None => CacheStatus::Empty,
            Some(plan) if plan.signature != signature => CacheStatus::SignatureChanged,
            Some(plan) if now - plan.created_at >= self.ttl => CacheStatus::Expired,
            Some(_) => CacheStatus::Hit,
        }
    }

    /// Cached plan if still valid.
    #[must_use]
    pub fn get(&self, signature: &str, now: DateTime<Utc>) -> Option<&StrategicPlan> {
        match self.status(signature, now) {
            CacheStatus::Hit => self.entry.as_ref(),
            _ => None,
        }
    }

    /// Replaces the cached plan.
    pub fn store(&mut self, plan: StrategicPlan) {
        self.entry = Some(plan);
    }

    /// Drops the cached plan.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Cached plan regardless of validity.
    #[must_use]
    pub const fn current(&self) -> Option<&StrategicPlan> {
        self.entry.as_ref()
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(Duration::minutes(60))
    }
}
