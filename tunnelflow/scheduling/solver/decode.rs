use chrono::Utc;
use uuid::Uuid;

use crate::domain::{OptimizationResult, PumpSchedule, PumpSpec, SolveMode, SystemConstraints};
use crate::model::DecisionModel;

/// Level tolerance used when counting band excursions (m).
pub const LEVEL_TOLERANCE_M: f64 = 1.0e-4;

/// Horizon data shared by every tier when turning setpoints into a result.
#[derive(Debug, Clone)]
pub struct HorizonFrame {
    /// Step length (minutes).
    pub step_minutes: u32,
    /// Level at the start of the horizon (m).
    pub initial_level: f64,
    /// Forecast inflow per step (m³/s).
    pub inflow: Vec<f64>,
    /// Forecast price per step (EUR/kWh).
    pub price: Vec<f64>,
    /// Constraints the schedule is held to.
    pub constraints: SystemConstraints,
}

impl HorizonFrame {
    /// Number of steps.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.inflow.len().min(self.price.len())
    }

    /// Step length in seconds.
    #[must_use]
    pub fn step_seconds(&self) -> f64 {
        f64::from(self.step_minutes) * 60.0
    }

    /// Step length in hours.
    #[must_use]
    pub fn step_hours(&self) -> f64 {
        f64::from(self.step_minutes) / 60.0
    }

    /// Level after one step of net inflow.
    #[must_use]
    pub fn advance(&self, level: f64, inflow: f64, outflow: f64) -> f64 {
        (inflow - outflow).mul_add(
            self.step_seconds() / self.constraints.tunnel_volume_m3_per_m,
            level,
        )
    }
}

impl From<&DecisionModel> for HorizonFrame {
    fn from(decision: &DecisionModel) -> Self {
        Self {
            step_minutes: decision.step_minutes,
            initial_level: decision.initial_level,
            inflow: decision.inflow.clone(),
            price: decision.price.clone(),
            constraints: decision.constraints.clone(),
        }
    }
}

/// Integrates the level and totals for a set of pump setpoints.
///
/// Power is re-evaluated on the cubic law at the level reached at the start
/// of each step, so every tier reports cost on the same physics.
#[must_use]
pub fn assemble_result(
    mode: SolveMode,
    frame: &HorizonFrame,
    pumps: &[PumpSpec],
    mut schedule: Vec<PumpSchedule>,
    objective_value: Option<f64>,
) -> OptimizationResult {
    let steps = frame.steps();
    let dt_h = frame.step_hours();
    let mut level = frame.initial_level;
    let mut level_trajectory = Vec::with_capacity(steps);
    let mut outflow = Vec::with_capacity(steps);
    let mut total_cost = 0.0;
    let mut total_energy_kwh = 0.0;
    let mut violation_count = 0;
    let mut max_violation_m: f64 = 0.0;

    for pump in &mut schedule {
        pump.power_kw = vec![0.0; steps];
    }

    for t in 0..steps {
        let mut step_outflow = 0.0;
        let mut step_power = 0.0;
        for (pump, spec) in schedule.iter_mut().zip(pumps) {
            let freq = pump.frequency_hz.get(t).copied().unwrap_or(0.0);
            let flow = pump.flow_m3s.get(t).copied().unwrap_or(0.0);
            let power = spec.power_at(freq, level);
            pump.power_kw[t] = power;
            step_outflow += flow;
            step_power += power;
        }
        let energy = step_power * dt_h;
        total_energy_kwh += energy;
        total_cost += energy * frame.price[t];

        level = frame.advance(level, frame.inflow[t], step_outflow);
        let excursion = (level - frame.constraints.l1_max).max(frame.constraints.l1_min - level);
        if excursion > LEVEL_TOLERANCE_M {
            violation_count += 1;
            max_violation_m = max_violation_m.max(excursion);
        }
        level_trajectory.push(level);
        outflow.push(step_outflow);
    }

    OptimizationResult {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        success: true,
        mode,
        step_minutes: frame.step_minutes,
        schedule,
        level_trajectory,
        outflow_m3s: outflow,
        total_cost,
        total_energy_kwh,
        violation_count,
        max_violation_m,
        objective_value,
        solve_millis: 0,
        notes: Vec::new(),
    }
}

/// Reads a solver assignment back into per-pump setpoints.
///
/// On/off is rounded at 0.5; an off pump has zero frequency and flow, an on
/// pump has its frequency clamped into the running range.
#[must_use]
pub fn decode_assignment(
    decision: &DecisionModel,
    values: &[f64],
    mode: SolveMode,
    objective: f64,
) -> OptimizationResult {
    let value = |var: crate::model::VarId| values.get(var.0).copied().unwrap_or(0.0);
    let band = decision.fidelity.flow_band();
    let schedule = decision
        .pumps
        .iter()
        .zip(&decision.pump_vars)
        .map(|(spec, vars)| {
            let mut on = Vec::with_capacity(decision.steps);
            let mut frequency_hz = Vec::with_capacity(decision.steps);
            let mut flow_m3s = Vec::with_capacity(decision.steps);
            for t in 0..decision.steps {
                let running = value(vars.on[t]) > 0.5;
                on.push(running);
                if running {
                    let freq = value(vars.frequency[t])
                        .clamp(spec.min_frequency_hz, spec.max_frequency_hz);
                    let nominal = spec.flow_per_hz() * freq;
                    let flow = value(vars.flow[t])
                        .clamp(nominal * (1.0 - band), nominal * (1.0 + band));
                    frequency_hz.push(freq);
                    flow_m3s.push(flow);
                } else {
                    frequency_hz.push(0.0);
                    flow_m3s.push(0.0);
                }
            }
            PumpSchedule {
                pump_id: spec.id.clone(),
                on,
                frequency_hz,
                flow_m3s,
                power_kw: Vec::new(),
            }
        })
        .collect();
    assemble_result(
        mode,
        &HorizonFrame::from(decision),
        &decision.pumps,
        schedule,
        Some(objective),
    )
}
