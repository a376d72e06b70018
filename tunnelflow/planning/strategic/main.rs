/// Plan cache.
pub mod cache;
/// Bucket classification.
pub mod classify;

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use shared_event_bus::topics;
use shared_logging::LogLevel;
use tunnelflow_scheduling::domain::{ForecastSeries, WeightMultipliers};
use tunnelflow_scheduling::telemetry::ControlTelemetry;
use uuid::Uuid;

use crate::quality::Confidence;

pub use cache::{CacheStatus, PlanCache};
pub use classify::{classify_buckets, Bucket, BucketClass};

/// Surge buckets from which the plan turns conservative.
const CONSERVATIVE_SURGE_BUCKETS: usize = 3;

/// Overall stance of a strategic plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Forecasts are unreliable or surges dominate: protect the band.
    Conservative,
    /// A surge is coming: make room in the tunnel.
    BuildBuffer,
    /// Cheap now, expensive later: pump down while it is cheap.
    AggressivePumpDown,
    /// Expensive now: pump only what safety needs.
    MinimalPump,
    /// Nothing notable.
    Balanced,
}

impl PlanType {
    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::BuildBuffer => "build_buffer",
            Self::AggressivePumpDown => "aggressive_pump_down",
            Self::MinimalPump => "minimal_pump",
            Self::Balanced => "balanced",
        }
    }

    /// Multipliers applied to every period of the plan.
    #[must_use]
    pub const fn base_multipliers(self) -> WeightMultipliers {
        match self {
            Self::Conservative => WeightMultipliers::new(2.0, 0.5, 0.6),
            Self::BuildBuffer => WeightMultipliers::new(1.5, 0.7, 0.8),
            Self::AggressivePumpDown => WeightMultipliers {
                cost: 0.8,
                smoothness: 0.8,
                safety: 1.2,
                energy: 1.0,
                fairness: 1.0,
            },
            Self::MinimalPump => WeightMultipliers::new(0.9, 1.4, 1.1),
            Self::Balanced => WeightMultipliers::identity(),
        }
    }
}

/// One row of the per-period multiplier table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPeriod {
    /// Bucket this row was derived from.
    pub bucket: Bucket,
    /// Plan base multipliers combined with the bucket factor.
    pub multipliers: WeightMultipliers,
}

/// Coarse 24h guidance for the tactical solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategicPlan {
    /// Plan identifier.
    pub id: Uuid,
    /// Stance.
    pub plan_type: PlanType,
    /// Per-period multiplier table, in time order.
    pub periods: Vec<PlanPeriod>,
    /// Deterministic explanation of the stance.
    pub reasoning: String,
    /// Signature of the forecast the plan was built from.
    pub signature: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl StrategicPlan {
    /// Multipliers in effect at `now`; the nearest period outside the table.
    #[must_use]
    pub fn multipliers_at(&self, now: DateTime<Utc>) -> WeightMultipliers {
        let period = self
            .periods
            .iter()
            .find(|period| period.bucket.start <= now && now < period.bucket.end)
            .or_else(|| {
                if self.periods.first().is_some_and(|p| now < p.bucket.start) {
                    self.periods.first()
                } else {
                    self.periods.last()
                }
            });
        period.map_or_else(
            || self.plan_type.base_multipliers(),
            |period| period.multipliers,
        )
    }

    /// Number of surge-risk periods.
    #[must_use]
    pub fn surge_periods(&self) -> usize {
        self.periods
            .iter()
            .filter(|period| period.bucket.class == BucketClass::SurgeRisk)
            .count()
    }
}

/// Builds strategic plans from the 24h forecast.
#[derive(Debug, Clone)]
pub struct StrategicPlanner {
    period_hours: f64,
    telemetry: Option<ControlTelemetry>,
}

impl Default for StrategicPlanner {
    fn default() -> Self {
        Self::new(2.0)
    }
}

impl StrategicPlanner {
    /// Planner with a bucket length in hours.
    #[must_use]
    pub fn new(period_hours: f64) -> Self {
        Self {
            period_hours: if period_hours > 0.0 { period_hours } else { 2.0 },
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Bucket length in hours.
    #[must_use]
    pub const fn period_hours(&self) -> f64 {
        self.period_hours
    }

    /// Signature of the inputs a plan depends on.
    ///
    /// Built from quantised bucket means, classes and the confidence label, so
    /// a forecast that merely rolls forward by one step usually keeps its signature.
    #[must_use]
    pub fn signature(
        &self,
        forecast: &ForecastSeries,
        observed_inflow: Option<f64>,
        confidence: Confidence,
    ) -> String {
        let buckets = classify_buckets(forecast, self.period_hours, observed_inflow);
        let mut canonical = format!("{}|{}|", confidence.label(), forecast.step_minutes);
        for bucket in &buckets {
            let _ = write!(
                canonical,
                "{}:{}:{};",
                (bucket.mean_inflow * 4.0).round() as i64,
                (bucket.mean_price * 100.0).round() as i64,
                bucket.class.label()
            );
        }
        let digest = Sha256::digest(canonical.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Builds a plan. Never depends on any narrative service.
    #[must_use]
    pub fn plan(
        &self,
        forecast: &ForecastSeries,
        observed_inflow: Option<f64>,
        confidence: Confidence,
        now: DateTime<Utc>,
    ) -> StrategicPlan {
        let buckets = classify_buckets(forecast, self.period_hours, observed_inflow);
        let surges = buckets
            .iter()
            .filter(|bucket| bucket.class == BucketClass::SurgeRisk)
            .count();
        let first = buckets.first().map(|bucket| bucket.class);
        let expensive_later = buckets
            .iter()
            .skip(1)
            .any(|bucket| bucket.class == BucketClass::Expensive);

        let (plan_type, why) = if confidence == Confidence::Poor {
            (PlanType::Conservative, "forecast confidence is poor".to_owned())
        } else if surges >= CONSERVATIVE_SURGE_BUCKETS {
            (
                PlanType::Conservative,
                format!("{surges} periods carry surge risk"),
            )
        } else if surges > 0 {
            (
                PlanType::BuildBuffer,
                format!("{surges} surge-risk period(s) ahead; making room in the tunnel"),
            )
        } else if first == Some(BucketClass::Cheap) && expensive_later {
            (
                PlanType::AggressivePumpDown,
                "power is cheap now and expensive later; pumping down early".to_owned(),
            )
        } else if first == Some(BucketClass::Expensive) {
            (
                PlanType::MinimalPump,
                "power is expensive now; pumping only what safety needs".to_owned(),
            )
        } else {
            (PlanType::Balanced, "no surge or price extremes ahead".to_owned())
        };

        let base = plan_type.base_multipliers();
        let periods: Vec<PlanPeriod> = buckets
            .into_iter()
            .map(|bucket| PlanPeriod {
                multipliers: base.combine(&bucket.class.factor()),
                bucket,
            })
            .collect();
        let classes: Vec<&str> = periods.iter().map(|p| p.bucket.class.label()).collect();
        let reasoning = format!(
            "{}: {why} (confidence {}, periods [{}])",
            plan_type.label(),
            confidence.label(),
            classes.join(", ")
        );

        let plan = StrategicPlan {
            id: Uuid::new_v4(),
            plan_type,
            periods,
            reasoning,
            signature: self.signature(forecast, observed_inflow, confidence),
            created_at: now,
        };
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(
                LogLevel::Info,
                "planning.strategic.built",
                json!({
                    "plan_type": plan_type.label(),
                    "periods": plan.periods.len(),
                    "surges": surges,
                    "confidence": confidence.label(),
                }),
            );
            let _ = telemetry.event(
                topics::PLAN_REFRESHED,
                json!({ "plan_id": plan.id, "plan_type": plan_type.label() }),
            );
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tunnelflow_scheduling::domain::HorizonKind;

    use super::*;

    fn forecast(now: DateTime<Utc>, inflow: Vec<f64>, price: Vec<f64>) -> ForecastSeries {
        ForecastSeries::new(HorizonKind::Strategic, now, 15, inflow, price)
    }

    #[test]
    fn poor_confidence_is_conservative() {
        let now = Utc::now();
        let plan = StrategicPlanner::default().plan(
            &forecast(now, vec![1.0; 96], vec![0.08; 96]),
            None,
            Confidence::Poor,
            now,
        );
        assert_eq!(plan.plan_type, PlanType::Conservative);
        let m = plan.multipliers_at(now);
        assert!((m.safety - 2.0).abs() < 1e-12);
        assert!((m.cost - 0.5).abs() < 1e-12);
        assert_eq!(plan.periods.len(), 12);
    }

    #[test]
    fn single_surge_builds_buffer_and_boosts_that_period() {
        let now = Utc::now();
        let mut inflow = vec![1.0; 96];
        for value in &mut inflow[40..48] {
            *value = 4.0;
        }
        let plan = StrategicPlanner::default().plan(
            &forecast(now, inflow, vec![0.08; 96]),
            None,
            Confidence::Good,
            now,
        );
        assert_eq!(plan.plan_type, PlanType::BuildBuffer);
        assert_eq!(plan.surge_periods(), 1);
        let surge = plan.multipliers_at(now + Duration::hours(10) + Duration::minutes(30));
        assert!((surge.safety - 1.5 * 1.8).abs() < 1e-9);
        assert!((surge.cost - 0.7 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn cheap_now_expensive_later_pumps_down() {
        let now = Utc::now();
        let mut price = vec![0.08; 96];
        price[..8].iter_mut().for_each(|p| *p = 0.03);
        price[48..56].iter_mut().for_each(|p| *p = 0.20);
        let plan = StrategicPlanner::default().plan(
            &forecast(now, vec![1.0; 96], price),
            None,
            Confidence::Good,
            now,
        );
        assert_eq!(plan.plan_type, PlanType::AggressivePumpDown);
        assert!(plan.reasoning.starts_with("aggressive_pump_down"));
        let first = plan.multipliers_at(now);
        assert!((first.cost - 0.8 * 0.6).abs() < 1e-9);
    }

    #[test]
    fn expensive_now_is_minimal_pump() {
        let now = Utc::now();
        let mut price = vec![0.08; 96];
        price[..8].iter_mut().for_each(|p| *p = 0.20);
        let plan = StrategicPlanner::default().plan(
            &forecast(now, vec![1.0; 96], price),
            None,
            Confidence::Fair,
            now,
        );
        assert_eq!(plan.plan_type, PlanType::MinimalPump);
    }

    #[test]
    fn signature_is_stable_for_identical_inputs() {
        let now = Utc::now();
        let planner = StrategicPlanner::default();
        let series = forecast(now, vec![1.0; 96], vec![0.08; 96]);
        let a = planner.signature(&series, None, Confidence::Good);
        let b = planner.signature(&series, None, Confidence::Good);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, planner.signature(&series, None, Confidence::Poor));
    }
}
