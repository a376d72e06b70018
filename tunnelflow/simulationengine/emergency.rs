use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{ConstraintOverlay, WeightMultipliers};

use crate::divergence::{DivergenceKind, DivergenceRecord, Severity};

const SURGE_MIN_RAISE_M: f64 = 0.3;
const FALLING_MIN_RAISE_M: f64 = 0.3;

/// Overrides for the next solve, derived from this cycle's divergences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyResponse {
    /// Worst severity seen, `None` when nothing triggered.
    pub severity: Option<Severity>,
    /// Triggers that contributed.
    pub triggers: Vec<DivergenceKind>,
    /// Band tightening.
    pub overlay: ConstraintOverlay,
    /// Weight multipliers for the worst severity.
    pub multipliers: WeightMultipliers,
    floor: WeightMultipliers,
}

impl EmergencyResponse {
    /// Response that changes nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            severity: None,
            triggers: Vec::new(),
            overlay: ConstraintOverlay::default(),
            multipliers: WeightMultipliers::identity(),
            floor: EmergencyAdjuster::PROTECTIVE_FLOOR,
        }
    }

    /// True when no divergence triggered.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.severity.is_none()
    }

    /// Final multipliers for the cycle.
    ///
    /// The strategic table is combined with the emergency multipliers; from
    /// high severity on the result is held at or beyond the protective floor,
    /// whatever the strategic plan asked for.
    #[must_use]
    pub fn bound(&self, strategic: &WeightMultipliers) -> WeightMultipliers {
        let combined = strategic.combine(&self.multipliers);
        match self.severity {
            Some(severity) if severity >= Severity::High => {
                combined.at_least_as_protective_as(&self.floor)
            }
            _ => combined,
        }
    }
}

/// Maps divergences to constraint overlays and weight multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAdjuster {
    /// Bound applied to the final multipliers at high and critical severity.
    pub floor: WeightMultipliers,
}

impl Default for EmergencyAdjuster {
    fn default() -> Self {
        Self {
            floor: Self::PROTECTIVE_FLOOR,
        }
    }
}

impl EmergencyAdjuster {
    /// Safety at least doubled, cost at most 0.3×, energy at most 0.5×.
    pub const PROTECTIVE_FLOOR: WeightMultipliers = WeightMultipliers::new(2.0, 0.3, 0.5);

    /// Combines all records into one response. Overlays keep the strongest tightening.
    #[must_use]
    pub fn respond(&self, records: &[DivergenceRecord]) -> EmergencyResponse {
        let Some(severity) = records.iter().map(|record| record.severity).max() else {
            return EmergencyResponse::none();
        };
        let overlay = records
            .iter()
            .map(overlay_for)
            .fold(ConstraintOverlay::default(), ConstraintOverlay::merge);
        EmergencyResponse {
            severity: Some(severity),
            triggers: records.iter().map(|record| record.kind).collect(),
            overlay,
            multipliers: multipliers_for(severity),
            floor: self.floor,
        }
    }
}

fn overlay_for(record: &DivergenceRecord) -> ConstraintOverlay {
    match record.kind {
        DivergenceKind::InflowSurge => ConstraintOverlay {
            l1_max_reduction: match record.severity {
                Severity::Low | Severity::Medium => 1.0,
                Severity::High => 1.25,
                Severity::Critical => 1.5,
            },
            l1_min_raise: SURGE_MIN_RAISE_M,
        },
        DivergenceKind::LevelRising => ConstraintOverlay {
            l1_max_reduction: match record.severity {
                Severity::Low => 0.25,
                Severity::Medium => 0.5,
                Severity::High => 0.75,
                Severity::Critical => 1.0,
            },
            l1_min_raise: 0.0,
        },
        DivergenceKind::LevelFalling => ConstraintOverlay {
            l1_max_reduction: 0.0,
            l1_min_raise: FALLING_MIN_RAISE_M,
        },
        DivergenceKind::PriceSpike => ConstraintOverlay::default(),
    }
}

const fn multipliers_for(severity: Severity) -> WeightMultipliers {
    match severity {
        Severity::High | Severity::Critical => WeightMultipliers::new(2.0, 0.3, 0.5),
        Severity::Medium => WeightMultipliers::new(1.5, 0.6, 0.7),
        Severity::Low => WeightMultipliers::identity(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tunnelflow_scheduling::domain::{CurrentState, SystemConstraints, WeightVector};

    use super::*;
    use crate::divergence::{DivergenceMonitor, Prediction};

    fn constraints() -> SystemConstraints {
        SystemConstraints {
            tunnel_volume_m3_per_m: 5_000.0,
            l1_min: 0.5,
            l1_max: 8.0,
            min_pumps_on: 1,
            min_on_steps: 2,
            min_off_steps: 2,
            flush_target_level: 1.0,
            target_specific_energy_kwh_m3: 0.04,
            legacy_soft_tolerance_m: None,
        }
    }

    fn record(kind: DivergenceKind, severity: Severity) -> DivergenceRecord {
        DivergenceRecord {
            kind,
            severity,
            magnitude: 0.0,
            predicted: 0.0,
            observed: 0.0,
        }
    }

    #[test]
    fn surge_of_doubled_inflow_tightens_next_cycle_band() {
        let prediction = Prediction {
            made_at: Utc::now(),
            level_m: Some(4.0),
            inflow_m3s: 2.0,
            price_eur_kwh: 0.08,
        };
        let observed = CurrentState {
            timestamp: Utc::now(),
            level_m: 4.1,
            inflow_m3s: 4.0,
            outflow_m3s: 2.0,
            price_eur_kwh: 0.08,
            pumps: Vec::new(),
        };
        let records = DivergenceMonitor::default().check(&prediction, &observed);
        let response = EmergencyAdjuster::default().respond(&records);
        assert_eq!(response.triggers, vec![DivergenceKind::InflowSurge]);
        assert!(response.severity >= Some(Severity::High));

        let base = constraints();
        let next = base.with_overlay(&response.overlay);
        let reduction = base.l1_max - next.l1_max;
        assert!((1.0..=1.5).contains(&reduction));
        assert!((next.l1_min - 0.8).abs() < 1e-12);
        assert!((base.l1_max - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn critical_response_bounds_weights_regardless_of_strategy() {
        let response =
            EmergencyAdjuster::default().respond(&[record(DivergenceKind::PriceSpike, Severity::Critical)]);
        let cost_heavy_strategy = WeightMultipliers::new(0.9, 1.4, 1.1);
        let base = WeightVector::default();
        let weights = base.scaled(&response.bound(&cost_heavy_strategy));
        assert!(weights.safety_margin >= 2.0 * base.safety_margin - 1e-12);
        assert!(weights.energy_cost <= 0.3 * base.energy_cost + 1e-12);
        assert!(response.overlay.is_empty());
    }

    #[test]
    fn overlays_merge_and_low_severity_keeps_weights() {
        let response = EmergencyAdjuster::default().respond(&[
            record(DivergenceKind::LevelRising, Severity::Low),
            record(DivergenceKind::LevelFalling, Severity::Low),
        ]);
        assert_eq!(response.severity, Some(Severity::Low));
        assert!((response.overlay.l1_max_reduction - 0.25).abs() < 1e-12);
        assert!((response.overlay.l1_min_raise - 0.3).abs() < 1e-12);
        assert_eq!(
            response.bound(&WeightMultipliers::identity()),
            WeightMultipliers::identity()
        );
        assert!(EmergencyAdjuster::default().respond(&[]).is_quiet());
    }

    #[test]
    fn medium_severity_scales_without_floor() {
        let response =
            EmergencyAdjuster::default().respond(&[record(DivergenceKind::LevelRising, Severity::Medium)]);
        let bounded = response.bound(&WeightMultipliers::identity());
        assert!((bounded.safety - 1.5).abs() < 1e-12);
        assert!((bounded.cost - 0.6).abs() < 1e-12);
    }
}
