use std::collections::HashSet;

use crate::domain::{CurrentState, OptimizationResult, PumpSpec, SystemConstraints};
use crate::error::ControllerError;

use super::decode::LEVEL_TOLERANCE_M;

const FREQUENCY_TOLERANCE_HZ: f64 = 1.0e-4;

/// Checks that a pump table and a set of constraints can be modelled at all.
///
/// # Errors
///
/// [`ControllerError::Configuration`] naming the first problem found.
pub fn check_station(
    pumps: &[PumpSpec],
    constraints: &SystemConstraints,
) -> Result<(), ControllerError> {
    let fail = |msg: String| Err(ControllerError::Configuration(msg));
    if pumps.is_empty() {
        return fail("at least one pump is required".into());
    }
    let mut seen = HashSet::new();
    for pump in pumps {
        if !seen.insert(pump.id.as_str()) {
            return fail(format!("duplicate pump id {}", pump.id));
        }
        if !positive(pump.max_flow_m3s) || !positive(pump.max_power_kw) {
            return fail(format!("pump {} needs positive flow and power", pump.id));
        }
        if !positive(pump.min_frequency_hz)
            || !pump.max_frequency_hz.is_finite()
            || pump.max_frequency_hz < pump.min_frequency_hz
        {
            return fail(format!(
                "pump {} frequency range {}..{} Hz is invalid",
                pump.id, pump.min_frequency_hz, pump.max_frequency_hz
            ));
        }
        if !pump.level_power_slope.is_finite() {
            return fail(format!("pump {} level_power_slope must be finite", pump.id));
        }
    }
    if !positive(constraints.tunnel_volume_m3_per_m) {
        return fail("tunnel_volume_m3_per_m must be positive".into());
    }
    if !constraints.l1_min.is_finite()
        || !constraints.l1_max.is_finite()
        || constraints.l1_max <= constraints.l1_min
    {
        return fail(format!(
            "l1_max {} must exceed l1_min {}",
            constraints.l1_max, constraints.l1_min
        ));
    }
    if constraints.min_pumps_on > pumps.len() {
        return fail(format!(
            "min_pumps_on {} exceeds the {} configured pumps",
            constraints.min_pumps_on,
            pumps.len()
        ));
    }
    Ok(())
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Re-checks a candidate schedule against the safety invariants.
///
/// `soft_tolerance` is the legacy allowance beyond the band, `None` in hard mode.
///
/// # Errors
///
/// [`ControllerError::InvalidSolution`] naming the first breached invariant.
pub fn check_invariants(
    result: &OptimizationResult,
    state: &CurrentState,
    pumps: &[PumpSpec],
    constraints: &SystemConstraints,
    soft_tolerance: Option<f64>,
) -> Result<(), ControllerError> {
    let steps = result.steps();
    let allowance = soft_tolerance.unwrap_or(0.0) + LEVEL_TOLERANCE_M;

    for (t, level) in result.level_trajectory.iter().enumerate() {
        if !level.is_finite() {
            return Err(invalid(format!("level at step {t} is not finite")));
        }
        if *level > constraints.l1_max + allowance || *level < constraints.l1_min - allowance {
            return Err(invalid(format!(
                "level {level:.3} m at step {t} outside [{:.3}, {:.3}]",
                constraints.l1_min, constraints.l1_max
            )));
        }
    }

    for t in 0..steps {
        let running = result.pumps_on_at(t);
        if running < constraints.min_pumps_on {
            return Err(invalid(format!(
                "{running} pumps on at step {t}, {} required",
                constraints.min_pumps_on
            )));
        }
    }

    for spec in pumps {
        let Some(pump) = result.schedule.iter().find(|pump| pump.pump_id == spec.id) else {
            return Err(invalid(format!("pump {} missing from schedule", spec.id)));
        };
        for (t, (on, freq)) in pump.on.iter().zip(&pump.frequency_hz).enumerate() {
            let in_range = *freq >= spec.min_frequency_hz - FREQUENCY_TOLERANCE_HZ
                && *freq <= spec.max_frequency_hz + FREQUENCY_TOLERANCE_HZ;
            if (*on && !in_range) || (!*on && *freq != 0.0) {
                return Err(invalid(format!(
                    "pump {} at step {t}: on={on} with {freq:.2} Hz",
                    spec.id
                )));
            }
        }

        let observed = state.pump(&spec.id);
        let was_on = observed.is_some_and(|status| status.is_on);
        let in_state = observed
            .and_then(|status| status.steps_in_state)
            .map(|steps| steps as usize);
        if let Some(t) = short_run(&pump.on, was_on, in_state, constraints) {
            return Err(invalid(format!(
                "pump {} switches at step {t} before its minimum run length",
                spec.id
            )));
        }
    }
    Ok(())
}

/// First step whose switch cuts short the run before it or is followed by a
/// run shorter than the minimum. `in_state` is the length of the observed run
/// before the horizon, when known. Runs cut off by the end of the horizon are
/// ignored.
fn short_run(
    on: &[bool],
    was_on: bool,
    in_state: Option<usize>,
    constraints: &SystemConstraints,
) -> Option<usize> {
    if let Some(prior) = in_state {
        let kept = on.iter().take_while(|value| **value == was_on).count();
        let required = if was_on {
            constraints.min_on_steps
        } else {
            constraints.min_off_steps
        };
        if kept < on.len() && prior.saturating_add(kept) < required {
            return Some(kept);
        }
    }
    let mut previous = was_on;
    for (t, current) in on.iter().copied().enumerate() {
        if current != previous {
            let required = if current {
                constraints.min_on_steps
            } else {
                constraints.min_off_steps
            };
            let run = on[t..].iter().take_while(|value| **value == current).count();
            let truncated = t + run == on.len();
            if run < required && !truncated {
                return Some(t);
            }
        }
        previous = current;
    }
    None
}

fn invalid(detail: String) -> ControllerError {
    ControllerError::InvalidSolution(detail)
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
            min_on_steps: 3,
            min_off_steps: 2,
            flush_target_level: 1.0,
            target_specific_energy_kwh_m3: 0.04,
            legacy_soft_tolerance_m: None,
        }
    }

    #[test]
    fn short_runs_are_detected_but_horizon_end_is_forgiven() {
        let limits = constraints();
        assert_eq!(short_run(&[true, true, false, false], false, None, &limits), Some(0));
        assert_eq!(short_run(&[false, false, true, true], false, None, &limits), None);
        assert_eq!(short_run(&[true, true, true, false, false], false, None, &limits), None);
        assert_eq!(short_run(&[true, false, true, true, true], true, None, &limits), Some(1));
    }

    #[test]
    fn carried_run_counts_toward_the_minimum() {
        let limits = constraints();
        // On for one step before the horizon, three required.
        assert_eq!(short_run(&[true, false, false, false], true, Some(1), &limits), Some(1));
        assert_eq!(short_run(&[false, false, false], true, Some(2), &limits), Some(0));
        assert_eq!(short_run(&[true, true, false, false], true, Some(1), &limits), None);
        assert_eq!(short_run(&[true, true, true], true, Some(0), &limits), None);
        // Off for one step, two required.
        assert_eq!(short_run(&[true, true, true], false, Some(1), &limits), Some(0));
        assert_eq!(short_run(&[false, true, true, true], false, Some(1), &limits), None);
    }

    fn pump(min_hz: f64, max_hz: f64) -> PumpSpec {
        PumpSpec {
            id: "P1".into(),
            max_flow_m3s: 2.0,
            max_power_kw: 400.0,
            min_frequency_hz: min_hz,
            max_frequency_hz: max_hz,
            level_power_slope: 0.0,
        }
    }

    #[test]
    fn station_checks_reject_unmodellable_tables() {
        let limits = constraints();
        assert!(check_station(&[pump(30.0, 50.0)], &limits).is_ok());

        let err = check_station(&[pump(50.0, 30.0)], &limits).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("frequency range"));
        assert!(check_station(&[pump(30.0, f64::NAN)], &limits).is_err());
        assert!(check_station(&[], &limits).is_err());

        let mut crowded = constraints();
        crowded.min_pumps_on = 2;
        let err = check_station(&[pump(30.0, 50.0)], &crowded).unwrap_err();
        assert!(err.to_string().contains("min_pumps_on"));

        let mut inverted = constraints();
        inverted.l1_max = 0.2;
        assert!(check_station(&[pump(30.0, 50.0)], &inverted).is_err());
    }
}
