use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{SolveMode, SystemConstraints};
use uuid::Uuid;

use crate::simulator::CycleRecord;

const VIOLATION_TOLERANCE_M: f64 = 1e-6;

/// Accumulated cost, energy and band excursions of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    /// Energy cost (EUR).
    pub cost_eur: f64,
    /// Energy (kWh).
    pub energy_kwh: f64,
    /// Intervals observed outside the level band.
    pub violation_count: usize,
    /// Largest excursion (m).
    pub max_violation_m: f64,
}

impl RunTotals {
    /// Adds one interval at `level_m`, checked against the base band.
    pub fn add_interval(
        &mut self,
        energy_kwh: f64,
        cost_eur: f64,
        level_m: f64,
        constraints: &SystemConstraints,
    ) {
        self.energy_kwh += energy_kwh;
        self.cost_eur += cost_eur;
        let excursion = (constraints.l1_min - level_m)
            .max(level_m - constraints.l1_max)
            .max(0.0);
        if excursion > VIOLATION_TOLERANCE_M {
            self.violation_count += 1;
            self.max_violation_m = self.max_violation_m.max(excursion);
        }
    }
}

/// Outcome of a rolling run compared with the naive baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSummary {
    /// Run identifier.
    pub id: Uuid,
    /// First cycle time.
    pub start: DateTime<Utc>,
    /// End of the run horizon.
    pub end: DateTime<Utc>,
    /// Cycles executed.
    pub cycles: usize,
    /// Optimized run.
    pub optimized: RunTotals,
    /// Naive baseline over the same observations.
    pub baseline: RunTotals,
    /// Baseline cost minus optimized cost (EUR).
    pub cost_savings_eur: f64,
    /// Cost savings relative to the baseline (%).
    pub cost_savings_pct: f64,
    /// Baseline energy minus optimized energy (kWh).
    pub energy_savings_kwh: f64,
    /// Cycles per solve tier.
    pub mode_counts: IndexMap<String, usize>,
    /// Cycles with at least one divergence.
    pub divergence_events: usize,
    /// Strategic plans built (not reused).
    pub plan_refreshes: usize,
    /// Times the level reached the flush target.
    pub flush_events: usize,
    /// Cumulative run-hours per pump at the end.
    pub final_run_hours: IndexMap<String, f64>,
    /// Per-cycle records.
    pub records: Vec<CycleRecord>,
}

impl SimulationSummary {
    /// Builds the summary from the cycle records and both run totals.
    #[must_use]
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        optimized: RunTotals,
        baseline: RunTotals,
        final_run_hours: IndexMap<String, f64>,
        records: Vec<CycleRecord>,
    ) -> Self {
        let mut mode_counts: IndexMap<String, usize> =
            [SolveMode::Full, SolveMode::Simplified, SolveMode::RuleBased]
                .iter()
                .map(|mode| (mode.label().to_owned(), 0))
                .collect();
        for record in &records {
            *mode_counts.entry(record.mode.label().to_owned()).or_default() += 1;
        }
        let cost_savings_eur = baseline.cost_eur - optimized.cost_eur;
        Self {
            id: Uuid::new_v4(),
            start,
            end,
            cycles: records.len(),
            optimized,
            baseline,
            cost_savings_eur,
            cost_savings_pct: if baseline.cost_eur > 0.0 {
                100.0 * cost_savings_eur / baseline.cost_eur
            } else {
                0.0
            },
            energy_savings_kwh: baseline.energy_kwh - optimized.energy_kwh,
            mode_counts,
            divergence_events: records.iter().filter(|r| !r.divergences.is_empty()).count(),
            plan_refreshes: records.iter().filter(|r| r.plan_refreshed).count(),
            flush_events: records.iter().filter(|r| r.flush_reached).count(),
            final_run_hours,
            records,
        }
    }

    /// Cycles not served by the full tier.
    #[must_use]
    pub fn degraded_cycles(&self) -> usize {
        self.cycles - self.mode_counts.get(SolveMode::Full.label()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn totals_track_excursions_on_both_sides() {
        let mut totals = RunTotals::default();
        totals.add_interval(10.0, 1.0, 4.0, &constraints());
        totals.add_interval(10.0, 1.0, 0.2, &constraints());
        totals.add_interval(10.0, 1.0, 8.4, &constraints());
        assert_eq!(totals.violation_count, 2);
        assert!((totals.max_violation_m - 0.4).abs() < 1e-9);
        assert!((totals.cost_eur - 3.0).abs() < 1e-12);
    }

    #[test]
    fn summary_reports_savings_against_baseline() {
        let now = Utc::now();
        let optimized = RunTotals {
            cost_eur: 80.0,
            energy_kwh: 900.0,
            ..RunTotals::default()
        };
        let baseline = RunTotals {
            cost_eur: 100.0,
            energy_kwh: 1_000.0,
            ..RunTotals::default()
        };
        let run_hours = indexmap::indexmap! {
            "P1".to_owned() => 12.0,
            "P2".to_owned() => 3.5,
        };
        let summary = SimulationSummary::new(now, now, optimized, baseline, run_hours, Vec::new());
        assert!((summary.cost_savings_pct - 20.0).abs() < 1e-9);
        assert_eq!(summary.final_run_hours.get_index(0).map(|(id, _)| id.as_str()), Some("P1"));
        assert!((summary.energy_savings_kwh - 100.0).abs() < 1e-9);
        assert_eq!(summary.mode_counts.len(), 3);
        assert_eq!(summary.degraded_cycles(), 0);
    }
}
