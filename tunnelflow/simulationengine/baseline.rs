use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{PumpSpec, SystemConstraints};

use crate::compare::RunTotals;

/// Observed inflow and price for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineSample {
    /// Observed inflow (m³/s).
    pub inflow_m3s: f64,
    /// Observed price (EUR/kWh).
    pub price_eur_kwh: f64,
}

/// Price-blind fixed-speed controller used as the reference run.
///
/// Below mid-band it runs the minimum pump count; above mid-band it runs
/// enough full-speed pumps to beat the inflow.
#[derive(Debug, Clone)]
pub struct NaiveBaseline {
    pumps: Vec<PumpSpec>,
    constraints: SystemConstraints,
}

impl NaiveBaseline {
    /// Baseline for a station.
    #[must_use]
    pub fn new(pumps: Vec<PumpSpec>, constraints: SystemConstraints) -> Self {
        Self { pumps, constraints }
    }

    /// Replays the observed samples from `initial_level_m`.
    #[must_use]
    pub fn evaluate(
        &self,
        initial_level_m: f64,
        samples: &[BaselineSample],
        interval_hours: f64,
    ) -> RunTotals {
        let volume = self.constraints.tunnel_volume_m3_per_m.max(f64::EPSILON);
        let dt_s = interval_hours * 3_600.0;
        let mut level = initial_level_m;
        let mut totals = RunTotals::default();

        for sample in samples {
            let running = self.pumps_for(level, sample.inflow_m3s);
            let outflow: f64 = running.iter().map(|spec| spec.max_flow_m3s).sum();
            let power: f64 = running
                .iter()
                .map(|spec| spec.power_at(spec.max_frequency_hz, level))
                .sum();
            let energy = power * interval_hours;
            totals.add_interval(energy, energy * sample.price_eur_kwh, level, &self.constraints);
            level = ((sample.inflow_m3s - outflow) * dt_s / volume + level).max(0.0);
        }
        totals
    }

    fn pumps_for(&self, level: f64, inflow: f64) -> &[PumpSpec] {
        let floor = self.constraints.min_pumps_on.min(self.pumps.len());
        if level < self.constraints.mid_band() {
            return &self.pumps[..floor];
        }
        let mut count = 0;
        let mut capacity = 0.0;
        while count < self.pumps.len() && capacity <= inflow {
            capacity += self.pumps[count].max_flow_m3s;
            count += 1;
        }
        &self.pumps[..count.max(floor)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pumps() -> Vec<PumpSpec> {
        ["P1", "P2", "P3"]
            .iter()
            .map(|id| PumpSpec {
                id: (*id).into(),
                max_flow_m3s: 2.0,
                max_power_kw: 400.0,
                min_frequency_hz: 30.0,
                max_frequency_hz: 50.0,
                level_power_slope: 0.0,
            })
            .collect()
    }

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
    fn low_level_runs_minimum_pumps_at_full_speed() {
        let baseline = NaiveBaseline::new(pumps(), constraints());
        let samples = [BaselineSample {
            inflow_m3s: 1.0,
            price_eur_kwh: 0.1,
        }];
        let totals = baseline.evaluate(2.0, &samples, 0.25);
        assert!((totals.energy_kwh - 100.0).abs() < 1e-9);
        assert!((totals.cost_eur - 10.0).abs() < 1e-9);
        assert_eq!(totals.violation_count, 0);
    }

    #[test]
    fn high_level_beats_inflow() {
        let baseline = NaiveBaseline::new(pumps(), constraints());
        assert_eq!(baseline.pumps_for(6.0, 3.0).len(), 2);
        assert_eq!(baseline.pumps_for(6.0, 4.0).len(), 3);
        assert_eq!(baseline.pumps_for(6.0, 10.0).len(), 3);
        let totals = baseline.evaluate(
            8.5,
            &[BaselineSample {
                inflow_m3s: 3.0,
                price_eur_kwh: 0.05,
            }],
            0.25,
        );
        assert_eq!(totals.violation_count, 1);
        assert!((totals.max_violation_m - 0.5).abs() < 1e-9);
    }
}
