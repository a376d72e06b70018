use crate::domain::{
    CurrentState, FlushContext, ForecastSeries, OptimizationResult, PumpSchedule, PumpSpec,
    SolveMode, SystemConstraints,
};

use super::decode::{assemble_result, HorizonFrame};

/// Fraction of the level error corrected per step.
const CORRECTION_GAIN: f64 = 0.5;
const FALLBACK_STEP_MINUTES: u32 = 15;

#[derive(Debug, Clone, Copy)]
struct PumpTrack {
    on: bool,
    steps_in_state: usize,
    run_hours: f64,
}

/// Deterministic last-resort tier. Never fails.
///
/// Each step aims the projected level at mid-band (or the flush target inside
/// a flush window), proportionally to the deviation, and runs the fewest
/// pumps that deliver the resulting outflow.
#[derive(Debug, Clone)]
pub struct RuleBasedScheduler {
    pumps: Vec<PumpSpec>,
}

impl RuleBasedScheduler {
    /// Scheduler for a station.
    #[must_use]
    pub fn new(pumps: Vec<PumpSpec>) -> Self {
        Self { pumps }
    }

    /// Produces a schedule over the forecast, or one step from the state when the forecast is empty.
    #[must_use]
    pub fn schedule(
        &self,
        state: &CurrentState,
        forecast: &ForecastSeries,
        constraints: &SystemConstraints,
        flush: Option<&FlushContext>,
    ) -> OptimizationResult {
        let frame = Self::frame(state, forecast, constraints);
        let steps = frame.steps();
        let dt_s = frame.step_seconds();
        let volume = constraints.tunnel_volume_m3_per_m.max(f64::EPSILON);
        let flush_active = flush.is_some_and(|ctx| ctx.ramp() > 0.0);

        let mut tracks: Vec<PumpTrack> = self
            .pumps
            .iter()
            .map(|spec| {
                let observed = state.pump(&spec.id);
                PumpTrack {
                    on: observed.is_some_and(|pump| pump.is_on),
                    steps_in_state: observed
                        .and_then(|pump| pump.steps_in_state)
                        .map_or(usize::MAX, |steps| steps as usize),
                    run_hours: observed.map_or(0.0, |pump| pump.run_hours),
                }
            })
            .collect();
        let mut schedule: Vec<PumpSchedule> = self
            .pumps
            .iter()
            .map(|spec| PumpSchedule {
                pump_id: spec.id.clone(),
                on: Vec::with_capacity(steps),
                frequency_hz: Vec::with_capacity(steps),
                flow_m3s: Vec::with_capacity(steps),
                power_kw: Vec::new(),
            })
            .collect();

        let mut level = sanitize(frame.initial_level, constraints.mid_band());
        for t in 0..steps {
            let inflow = frame.inflow[t];
            let in_window = flush_active
                && flush.is_some_and(|ctx| ctx.is_window(inflow, frame.price[t]));
            let target = if in_window {
                constraints.flush_target_level.max(constraints.l1_min)
            } else {
                constraints.mid_band()
            };
            // Outflow that keeps the level inside the band after this step.
            let must_pump = (level - constraints.l1_max).mul_add(volume / dt_s, inflow).max(0.0);
            let may_pump = (level - constraints.l1_min).mul_add(volume / dt_s, inflow).max(0.0);
            let desired = ((level - target) * volume / dt_s)
                .mul_add(CORRECTION_GAIN, inflow)
                .min(may_pump)
                .max(must_pump);

            let chosen = self.choose_pumps(&tracks, desired, constraints);
            let mut step_outflow = 0.0;
            let share = desired / chosen.len().max(1) as f64;
            for (idx, spec) in self.pumps.iter().enumerate() {
                let running = chosen.contains(&idx);
                let (freq, flow) = if running {
                    let flow = running_flow(spec, share);
                    (flow / spec.flow_per_hz(), flow)
                } else {
                    (0.0, 0.0)
                };
                schedule[idx].on.push(running);
                schedule[idx].frequency_hz.push(freq);
                schedule[idx].flow_m3s.push(flow);
                step_outflow += flow;

                let track = &mut tracks[idx];
                if track.on == running {
                    track.steps_in_state = track.steps_in_state.saturating_add(1);
                } else {
                    track.on = running;
                    track.steps_in_state = 1;
                }
            }
            level = frame.advance(level, inflow, step_outflow);
        }

        let mut result = assemble_result(SolveMode::RuleBased, &frame, &self.pumps, schedule, None);
        if forecast.is_empty() {
            result
                .notes
                .push("empty forecast: single step from observed inflow and price".into());
        }
        result
    }

    fn frame(
        state: &CurrentState,
        forecast: &ForecastSeries,
        constraints: &SystemConstraints,
    ) -> HorizonFrame {
        let fallback_inflow = sanitize(state.inflow_m3s, 0.0).max(0.0);
        let fallback_price = sanitize(state.price_eur_kwh, 0.0);
        let steps = forecast.len();
        let (inflow, price) = if steps == 0 {
            (vec![fallback_inflow], vec![fallback_price])
        } else {
            (
                forecast.inflow_m3s[..steps]
                    .iter()
                    .map(|q| sanitize(*q, fallback_inflow).max(0.0))
                    .collect(),
                forecast.price_eur_kwh[..steps]
                    .iter()
                    .map(|p| sanitize(*p, fallback_price))
                    .collect(),
            )
        };
        let step_minutes = if forecast.step_minutes == 0 {
            FALLBACK_STEP_MINUTES
        } else {
            forecast.step_minutes
        };
        HorizonFrame {
            step_minutes,
            initial_level: sanitize(state.level_m, constraints.mid_band()),
            inflow,
            price,
            constraints: constraints.clone(),
        }
    }

    /// Indices of the pumps to run this step.
    ///
    /// Preference: pumps locked on, running pumps, idle pumps by fewest
    /// run-hours, and pumps locked off only when nothing else is left.
    fn choose_pumps(
        &self,
        tracks: &[PumpTrack],
        desired: f64,
        constraints: &SystemConstraints,
    ) -> Vec<usize> {
        let locked = |track: &PumpTrack| {
            let required = if track.on {
                constraints.min_on_steps
            } else {
                constraints.min_off_steps
            };
            track.steps_in_state < required
        };
        let mut order: Vec<usize> = (0..self.pumps.len()).collect();
        order.sort_by(|a, b| {
            let rank = |idx: usize| {
                let track = &tracks[idx];
                match (track.on, locked(track)) {
                    (true, true) => 0,
                    (true, false) => 1,
                    (false, false) => 2,
                    (false, true) => 3,
                }
            };
            rank(*a)
                .cmp(&rank(*b))
                .then(tracks[*a].run_hours.total_cmp(&tracks[*b].run_hours))
                .then(a.cmp(b))
        });

        let locked_on = tracks.iter().filter(|track| track.on && locked(track)).count();
        let mut count = constraints.min_pumps_on.max(locked_on).min(order.len());
        let capacity = |n: usize| -> f64 {
            order[..n]
                .iter()
                .map(|idx| self.pumps[*idx].max_flow_m3s)
                .sum()
        };
        while count < order.len() && capacity(count) < desired {
            count += 1;
        }
        // Fewer pumps when the chosen set cannot run slowly enough.
        let unlocked_floor = constraints.min_pumps_on.max(locked_on);
        while count > unlocked_floor.max(1) {
            let min_total: f64 = order[..count]
                .iter()
                .map(|idx| self.pumps[*idx].min_flow_m3s())
                .sum();
            if min_total <= desired || capacity(count - 1) < desired {
                break;
            }
            count -= 1;
        }
        if desired <= 0.0 && unlocked_floor == 0 {
            count = 0;
        }
        order.truncate(count);
        order
    }
}

/// Flow of a running pump, kept within its operating range. A malformed range
/// collapses to the nameplate flow instead of panicking.
fn running_flow(spec: &PumpSpec, share: f64) -> f64 {
    let high = sanitize(spec.max_flow_m3s, 0.0).max(0.0);
    let low = sanitize(spec.min_flow_m3s(), high).min(high);
    sanitize(share, low).clamp(low, high)
}

fn sanitize(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::{HorizonKind, PumpStatus};

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

    fn state(level: f64, inflow: f64) -> CurrentState {
        let mut pumps = vec![
            PumpStatus::running("P1", 40.0),
            PumpStatus::off("P2"),
            PumpStatus::off("P3"),
        ];
        pumps[1].run_hours = 500.0;
        pumps[2].run_hours = 100.0;
        CurrentState {
            timestamp: Utc::now(),
            level_m: level,
            inflow_m3s: inflow,
            outflow_m3s: 1.6,
            price_eur_kwh: 0.08,
            pumps,
        }
    }

    #[test]
    fn high_level_runs_near_full_capacity() {
        let forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 4, 3.0, 0.05);
        let result =
            RuleBasedScheduler::new(pumps()).schedule(&state(7.9, 3.0), &forecast, &constraints(), None);
        assert!(result.success);
        assert_eq!(result.mode, SolveMode::RuleBased);
        assert!(result.first_step_outflow() >= 0.8 * 6.0);
        assert_eq!(result.violation_count, 0);
        for pump in &result.schedule {
            for (on, freq) in pump.on.iter().zip(&pump.frequency_hz) {
                assert_eq!(*on, *freq > 0.0);
            }
        }
    }

    #[test]
    fn idle_pump_with_fewer_hours_starts_first() {
        let forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 2, 3.0, 0.05);
        let result =
            RuleBasedScheduler::new(pumps()).schedule(&state(4.25, 3.0), &forecast, &constraints(), None);
        assert!(result.schedule[0].on[0]);
        assert!(result.schedule[2].on[0], "P3 has fewer run-hours than P2");
        assert!(!result.schedule[1].on[0]);
    }

    #[test]
    fn never_fails_on_empty_or_corrupt_input() {
        let mut forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 0, 0.0, 0.0);
        let result =
            RuleBasedScheduler::new(pumps()).schedule(&state(4.0, 1.0), &forecast, &constraints(), None);
        assert!(result.success);
        assert_eq!(result.steps(), 1);
        assert!(!result.notes.is_empty());

        forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 3, f64::NAN, f64::NAN);
        let mut corrupt = state(f64::NAN, 1.0);
        corrupt.price_eur_kwh = f64::INFINITY;
        let result = RuleBasedScheduler::new(pumps()).schedule(&corrupt, &forecast, &constraints(), None);
        assert!(result.success);
        assert!(result.level_trajectory.iter().all(|level| level.is_finite()));
        assert!(result.pumps_on_at(0) >= 1);
    }

    #[test]
    fn malformed_frequency_range_does_not_panic() {
        let mut station = pumps();
        station[0].min_frequency_hz = 50.0;
        station[0].max_frequency_hz = 30.0;
        let forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 3, 2.0, 0.05);
        let result =
            RuleBasedScheduler::new(station).schedule(&state(5.0, 2.0), &forecast, &constraints(), None);
        assert!(result.success);
        assert!(result.schedule[0].flow_m3s.iter().all(|flow| flow.is_finite() && *flow <= 2.0));
    }

    #[test]
    fn carried_on_lock_is_held_before_stopping() {
        let mut limits = constraints();
        limits.min_pumps_on = 0;
        limits.min_on_steps = 3;
        let mut start = state(2.0, 0.0);
        start.pumps[0].steps_in_state = Some(1);
        let forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 4, 0.0, 0.2);
        let result = RuleBasedScheduler::new(pumps()).schedule(&start, &forecast, &limits, None);
        assert_eq!(result.schedule[0].on, vec![true, true, false, false]);
    }

    #[test]
    fn flush_window_targets_flush_level() {
        let forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 4, 0.5, 0.02);
        let flush = FlushContext {
            hours_since_flush: 21.0,
            inflow_avg_24h: 1.0,
            price_mean_24h: 0.08,
            price_std_24h: 0.04,
        };
        let scheduler = RuleBasedScheduler::new(pumps());
        let with_flush = scheduler.schedule(&state(5.0, 0.5), &forecast, &constraints(), Some(&flush));
        let without = scheduler.schedule(&state(5.0, 0.5), &forecast, &constraints(), None);
        let last = |r: &OptimizationResult| *r.level_trajectory.last().unwrap();
        assert!(last(&with_flush) < last(&without));
        assert!(last(&with_flush) < 4.9);
    }
}
