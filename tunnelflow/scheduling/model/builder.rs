use crate::domain::{
    CurrentState, FlushContext, ForecastSeries, PumpSpec, SystemConstraints, WeightVector,
};
use crate::error::ControllerError;

use super::linear::{LinearExpr, LinearModel, Relation, VarId};
use super::power::PowerCurve;

/// Penalty per metre of excursion in the legacy soft mode.
pub const SOFT_VIOLATION_PENALTY: f64 = 1.0e6;

/// How much of the physics the model carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFidelity {
    /// Every constraint and objective term, tight bands.
    Full,
    /// Safety-critical constraints with looser bands; cost, safety and flush terms only.
    Simplified,
}

impl ModelFidelity {
    /// Relative tolerance of the flow band around `k·freq`.
    #[must_use]
    pub const fn flow_band(self) -> f64 {
        match self {
            Self::Full => 0.10,
            Self::Simplified => 0.20,
        }
    }

    /// Relative tolerance of the power band around the piecewise-linear curve.
    #[must_use]
    pub const fn power_band(self) -> f64 {
        match self {
            Self::Full => 0.15,
            Self::Simplified => 0.25,
        }
    }

    /// Number of power-curve segments.
    #[must_use]
    pub const fn power_segments(self) -> usize {
        match self {
            Self::Full => 4,
            Self::Simplified => 2,
        }
    }

    const fn keeps_comfort_terms(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Variable handles of one pump, indexed by step.
#[derive(Debug, Clone, Default)]
pub struct PumpVars {
    /// On/off binaries.
    pub on: Vec<VarId>,
    /// Frequency (Hz).
    pub frequency: Vec<VarId>,
    /// Flow (m³/s).
    pub flow: Vec<VarId>,
    /// Power (kW).
    pub power: Vec<VarId>,
    /// Start indicators.
    pub turns_on: Vec<VarId>,
    /// Stop indicators.
    pub turns_off: Vec<VarId>,
}

/// Model plus everything needed to decode an assignment back into a schedule.
#[derive(Debug, Clone)]
pub struct DecisionModel {
    /// The optimisation problem.
    pub model: LinearModel,
    /// Fidelity the model was built with.
    pub fidelity: ModelFidelity,
    /// Pumps in model order.
    pub pumps: Vec<PumpSpec>,
    /// Per-pump variables, same order as `pumps`.
    pub pump_vars: Vec<PumpVars>,
    /// End-of-step level variables.
    pub level: Vec<VarId>,
    /// Horizon length.
    pub steps: usize,
    /// Step length (minutes).
    pub step_minutes: u32,
    /// Level at the start of the horizon.
    pub initial_level: f64,
    /// Forecast inflow per step.
    pub inflow: Vec<f64>,
    /// Forecast price per step.
    pub price: Vec<f64>,
    /// Constraints the model enforces (after overlays).
    pub constraints: SystemConstraints,
    /// Whether level bounds were relaxed by the legacy soft mode.
    pub soft_bounds: bool,
    /// Effective flush weight, zero when the term is inactive.
    pub flush_weight: f64,
    /// Steps that fall inside a flush window.
    pub flush_window_steps: Vec<usize>,
}

impl DecisionModel {
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
}

/// Turns the current state and forecasts into a [`DecisionModel`].
#[derive(Debug, Clone)]
pub struct ConstraintModelBuilder {
    pumps: Vec<PumpSpec>,
    fidelity: ModelFidelity,
    legacy_soft_mode: bool,
}

impl ConstraintModelBuilder {
    /// Builder for a station.
    #[must_use]
    pub fn new(pumps: Vec<PumpSpec>) -> Self {
        Self {
            pumps,
            fidelity: ModelFidelity::Full,
            legacy_soft_mode: false,
        }
    }

    /// Selects the fidelity.
    #[must_use]
    pub const fn fidelity(mut self, fidelity: ModelFidelity) -> Self {
        self.fidelity = fidelity;
        self
    }

    /// Opts into the deprecated soft level bounds. Requires a configured tolerance.
    #[must_use]
    pub const fn legacy_soft_mode(mut self, enabled: bool) -> Self {
        self.legacy_soft_mode = enabled;
        self
    }

    /// Builds the model for one cycle.
    ///
    /// # Errors
    ///
    /// [`ControllerError::MissingForecastData`] for an empty forecast,
    /// [`ControllerError::Configuration`] when the station or constraints cannot be modelled.
    pub fn build(
        &self,
        state: &CurrentState,
        forecast: &ForecastSeries,
        constraints: &SystemConstraints,
        weights: &WeightVector,
        flush: Option<&FlushContext>,
    ) -> Result<DecisionModel, ControllerError> {
        let steps = forecast.len();
        if steps == 0 {
            return Err(ControllerError::MissingForecastData {
                requested: 1,
                available: 0,
            });
        }
        if self.pumps.is_empty() {
            return Err(ControllerError::Configuration("station has no pumps".into()));
        }
        if constraints.tunnel_volume_m3_per_m <= 0.0 {
            return Err(ControllerError::Configuration(
                "tunnel volume must be positive".into(),
            ));
        }
        let soft_tolerance = if self.legacy_soft_mode {
            match constraints.legacy_soft_tolerance_m {
                Some(tol) if tol > 0.0 => Some(tol),
                _ => {
                    return Err(ControllerError::Configuration(
                        "legacy soft mode needs a positive legacy_soft_tolerance_m".into(),
                    ))
                }
            }
        } else {
            None
        };

        let dt_s = f64::from(forecast.step_minutes) * 60.0;
        let dt_h = forecast.step_hours();
        let inflow: Vec<f64> = forecast.inflow_m3s[..steps]
            .iter()
            .map(|q| q.max(0.0))
            .collect();
        let price = forecast.price_eur_kwh[..steps].to_vec();
        let level_gain = dt_s / constraints.tunnel_volume_m3_per_m;
        let flow_band = self.fidelity.flow_band();
        let power_band = self.fidelity.power_band();

        let mut model = LinearModel::new();
        let mut pump_vars = Vec::with_capacity(self.pumps.len());

        for spec in &self.pumps {
            let curve = PowerCurve::for_pump(spec, state.level_m, self.fidelity.power_segments());
            let k = spec.flow_per_hz();
            let mut vars = PumpVars::default();
            for t in 0..steps {
                let id = &spec.id;
                let on = model.binary(format!("on[{id}][{t}]"));
                let freq = model.continuous(format!("freq[{id}][{t}]"), 0.0, spec.max_frequency_hz);
                let flow = model.continuous(
                    format!("flow[{id}][{t}]"),
                    0.0,
                    spec.max_flow_m3s * (1.0 + flow_band),
                );
                let power = model.continuous(format!("power[{id}][{t}]"), 0.0, spec.max_power_kw);

                model.constrain(
                    "frequency_floor",
                    LinearExpr::term(freq, 1.0).plus(on, -spec.min_frequency_hz),
                    Relation::GreaterEq,
                    0.0,
                );
                model.constrain(
                    "frequency_ceiling",
                    LinearExpr::term(freq, 1.0).plus(on, -spec.max_frequency_hz),
                    Relation::LessEq,
                    0.0,
                );
                model.constrain(
                    "flow_band_low",
                    LinearExpr::term(flow, 1.0).plus(freq, -(1.0 - flow_band) * k),
                    Relation::GreaterEq,
                    0.0,
                );
                model.constrain(
                    "flow_band_high",
                    LinearExpr::term(flow, 1.0).plus(freq, -(1.0 + flow_band) * k),
                    Relation::LessEq,
                    0.0,
                );
                for line in &curve.segments {
                    model.constrain(
                        "power_band_low",
                        LinearExpr::term(power, 1.0)
                            .plus(freq, -(1.0 - power_band) * line.slope)
                            .plus(on, -(1.0 - power_band) * line.intercept),
                        Relation::GreaterEq,
                        0.0,
                    );
                }
                model.constrain(
                    "power_band_high",
                    LinearExpr::term(power, 1.0)
                        .plus(freq, -(1.0 + power_band) * curve.chord.slope)
                        .plus(on, -(1.0 + power_band) * curve.chord.intercept),
                    Relation::LessEq,
                    0.0,
                );
                model.constrain(
                    "power_rail_low",
                    LinearExpr::term(power, 1.0).plus(on, -curve.base_power_kw),
                    Relation::GreaterEq,
                    0.0,
                );
                model.constrain(
                    "power_rail_high",
                    LinearExpr::term(power, 1.0).plus(on, -curve.max_power_kw),
                    Relation::LessEq,
                    0.0,
                );

                vars.on.push(on);
                vars.frequency.push(freq);
                vars.flow.push(flow);
                vars.power.push(power);
            }
            Self::add_transitions(&mut model, &mut vars, spec, state, constraints, steps);
            pump_vars.push(vars);
        }

        // level[t] = level[t-1] + (inflow - Σflow)·dt/V
        let (level_lo, level_hi) = match soft_tolerance {
            Some(tol) => (constraints.l1_min - tol, constraints.l1_max + tol),
            None => (constraints.l1_min, constraints.l1_max),
        };
        let mut level = Vec::with_capacity(steps);
        let mut excursion = LinearExpr::new();
        for t in 0..steps {
            let lvl = model.continuous(format!("level[{t}]"), level_lo, level_hi);
            let mut balance = LinearExpr::term(lvl, 1.0);
            for vars in &pump_vars {
                balance.add_term(vars.flow[t], level_gain);
            }
            let mut rhs = inflow[t] * level_gain;
            if t == 0 {
                rhs += state.level_m;
            } else {
                balance.add_term(level[t - 1], -1.0);
            }
            model.constrain("mass_balance", balance, Relation::Equal, rhs);

            if soft_tolerance.is_some() {
                let over = model.continuous(format!("over[{t}]"), 0.0, f64::INFINITY);
                let under = model.continuous(format!("under[{t}]"), 0.0, f64::INFINITY);
                model.constrain(
                    "soft_ceiling",
                    LinearExpr::term(lvl, 1.0).plus(over, -1.0),
                    Relation::LessEq,
                    constraints.l1_max,
                );
                model.constrain(
                    "soft_floor",
                    LinearExpr::term(lvl, 1.0).plus(under, 1.0),
                    Relation::GreaterEq,
                    constraints.l1_min,
                );
                excursion.add_term(over, 1.0);
                excursion.add_term(under, 1.0);
            }
            level.push(lvl);
        }

        for t in 0..steps {
            let mut running = LinearExpr::new();
            for vars in &pump_vars {
                running.add_term(vars.on[t], 1.0);
            }
            model.constrain(
                "min_pumps_on",
                running,
                Relation::GreaterEq,
                constraints.min_pumps_on as f64,
            );
        }

        // Objective.
        let mut energy_cost = LinearExpr::new();
        for (t, price_t) in price.iter().enumerate() {
            for vars in &pump_vars {
                energy_cost.add_term(vars.power[t], price_t * dt_h);
            }
        }
        model.add_objective("energy_cost", weights.energy_cost, energy_cost);

        let mid = constraints.mid_band();
        let half_band = (constraints.l1_max - constraints.l1_min) / 2.0;
        let mut safety = LinearExpr::new();
        for (t, lvl) in level.iter().enumerate() {
            let dev = model.continuous(
                format!("mid_dev[{t}]"),
                0.0,
                half_band + soft_tolerance.unwrap_or(0.0),
            );
            model.constrain(
                "mid_dev_above",
                LinearExpr::term(dev, 1.0).plus(*lvl, -1.0),
                Relation::GreaterEq,
                -mid,
            );
            model.constrain(
                "mid_dev_below",
                LinearExpr::term(dev, 1.0).plus(*lvl, 1.0),
                Relation::GreaterEq,
                mid,
            );
            safety.add_term(dev, 1.0);
        }
        model.add_objective("safety_margin", weights.safety_margin, safety);

        if self.fidelity.keeps_comfort_terms() {
            self.add_smoothness(&mut model, &pump_vars, state, weights, steps);
            self.add_specific_energy(&mut model, &pump_vars, constraints, weights, steps, dt_s, dt_h);
            Self::add_fairness(&mut model, &self.pumps, &pump_vars, state, weights, dt_h);
        }

        let mut flush_weight = 0.0;
        let mut flush_window_steps = Vec::new();
        if let Some(ctx) = flush {
            let ramp = ctx.ramp();
            if ramp > 0.0 {
                flush_weight = weights.flush * ramp;
                let mut excess_sum = LinearExpr::new();
                for t in 0..steps {
                    if !ctx.is_window(inflow[t], price[t]) {
                        continue;
                    }
                    let excess = model.continuous(format!("flush_excess[{t}]"), 0.0, level_hi);
                    model.constrain(
                        "flush_excess",
                        LinearExpr::term(excess, 1.0).plus(level[t], -1.0),
                        Relation::GreaterEq,
                        -constraints.flush_target_level,
                    );
                    excess_sum.add_term(excess, 1.0);
                    flush_window_steps.push(t);
                }
                model.add_objective("flush", flush_weight, excess_sum);
            }
        }

        if soft_tolerance.is_some() {
            model.add_objective("level_violation", SOFT_VIOLATION_PENALTY, excursion);
        }

        Ok(DecisionModel {
            model,
            fidelity: self.fidelity,
            pumps: self.pumps.clone(),
            pump_vars,
            level,
            steps,
            step_minutes: forecast.step_minutes,
            initial_level: state.level_m,
            inflow,
            price,
            constraints: constraints.clone(),
            soft_bounds: soft_tolerance.is_some(),
            flush_weight,
            flush_window_steps,
        })
    }

    /// Start/stop indicators, minimum run lengths and locks carried over from the observed state.
    fn add_transitions(
        model: &mut LinearModel,
        vars: &mut PumpVars,
        spec: &PumpSpec,
        state: &CurrentState,
        constraints: &SystemConstraints,
        steps: usize,
    ) {
        let observed = state.pump(&spec.id);
        let was_on = observed.is_some_and(|pump| pump.is_on);
        let prev_on = if was_on { 1.0 } else { 0.0 };

        for t in 0..steps {
            let id = &spec.id;
            let start = model.binary(format!("turns_on[{id}][{t}]"));
            let stop = model.binary(format!("turns_off[{id}][{t}]"));
            // start ≥ on[t] - on[t-1], stop ≥ on[t-1] - on[t]
            let mut start_expr = LinearExpr::term(start, 1.0).plus(vars.on[t], -1.0);
            let mut stop_expr = LinearExpr::term(stop, 1.0).plus(vars.on[t], 1.0);
            let (start_rhs, stop_rhs) = if t == 0 {
                (-prev_on, prev_on)
            } else {
                start_expr.add_term(vars.on[t - 1], 1.0);
                stop_expr.add_term(vars.on[t - 1], -1.0);
                (0.0, 0.0)
            };
            model.constrain("turn_on_indicator", start_expr, Relation::GreaterEq, start_rhs);
            model.constrain("turn_off_indicator", stop_expr, Relation::GreaterEq, stop_rhs);
            vars.turns_on.push(start);
            vars.turns_off.push(stop);
        }

        for t in 0..steps {
            for k in 1..constraints.min_on_steps {
                if t + k >= steps {
                    break;
                }
                model.constrain(
                    "min_on_duration",
                    LinearExpr::term(vars.on[t + k], 1.0).plus(vars.turns_on[t], -1.0),
                    Relation::GreaterEq,
                    0.0,
                );
            }
            for k in 1..constraints.min_off_steps {
                if t + k >= steps {
                    break;
                }
                model.constrain(
                    "min_off_duration",
                    LinearExpr::term(vars.on[t + k], 1.0).plus(vars.turns_off[t], 1.0),
                    Relation::LessEq,
                    1.0,
                );
            }
        }

        if let Some(in_state) = observed.and_then(|pump| pump.steps_in_state) {
            let in_state = in_state as usize;
            let (required, pinned_value) = if was_on {
                (constraints.min_on_steps, 1.0)
            } else {
                (constraints.min_off_steps, 0.0)
            };
            let remaining = required.saturating_sub(in_state).min(steps);
            for t in 0..remaining {
                model.constrain(
                    "carried_lock",
                    LinearExpr::term(vars.on[t], 1.0),
                    Relation::Equal,
                    pinned_value,
                );
            }
        }
    }

    fn add_smoothness(
        &self,
        model: &mut LinearModel,
        pump_vars: &[PumpVars],
        state: &CurrentState,
        weights: &WeightVector,
        steps: usize,
    ) {
        let capacity: f64 = self.pumps.iter().map(|p| p.max_flow_m3s).sum::<f64>() * 1.2;
        let mut total = LinearExpr::new();
        for t in 0..steps {
            let change = model.continuous(format!("outflow_change[{t}]"), 0.0, capacity + state.outflow_m3s.abs());
            let mut diff = LinearExpr::new();
            for vars in pump_vars {
                diff.add_term(vars.flow[t], 1.0);
                if t > 0 {
                    diff.add_term(vars.flow[t - 1], -1.0);
                }
            }
            if t == 0 {
                diff.constant -= state.outflow_m3s;
            }
            // change ≥ |diff|
            let mut up = LinearExpr::term(change, 1.0);
            up.add_scaled(&diff, -1.0);
            let mut down = LinearExpr::term(change, 1.0);
            down.add_scaled(&diff, 1.0);
            let (up_rhs, down_rhs) = (-up.constant, -down.constant);
            up.constant = 0.0;
            down.constant = 0.0;
            model.constrain("outflow_change_up", up, Relation::GreaterEq, up_rhs);
            model.constrain("outflow_change_down", down, Relation::GreaterEq, down_rhs);
            total.add_term(change, 1.0);
        }
        model.add_objective("smoothness", weights.smoothness, total);
    }

    #[allow(clippy::too_many_arguments)]
    fn add_specific_energy(
        &self,
        model: &mut LinearModel,
        pump_vars: &[PumpVars],
        constraints: &SystemConstraints,
        weights: &WeightVector,
        steps: usize,
        dt_s: f64,
        dt_h: f64,
    ) {
        let target = constraints.target_specific_energy_kwh_m3;
        let bound: f64 = self
            .pumps
            .iter()
            .map(|p| p.max_power_kw.mul_add(dt_h, target * p.max_flow_m3s * 1.2 * dt_s))
            .sum();
        let mut total = LinearExpr::new();
        for t in 0..steps {
            let dev = model.continuous(format!("energy_dev[{t}]"), 0.0, bound);
            // gap = Σpower·dt_h - target·Σflow·dt_s (kWh)
            let mut gap = LinearExpr::new();
            for vars in pump_vars {
                gap.add_term(vars.power[t], dt_h);
                gap.add_term(vars.flow[t], -target * dt_s);
            }
            let mut above = LinearExpr::term(dev, 1.0);
            above.add_scaled(&gap, -1.0);
            let mut below = LinearExpr::term(dev, 1.0);
            below.add_scaled(&gap, 1.0);
            model.constrain("energy_dev_above", above, Relation::GreaterEq, 0.0);
            model.constrain("energy_dev_below", below, Relation::GreaterEq, 0.0);
            total.add_term(dev, 1.0);
        }
        model.add_objective("specific_energy", weights.specific_energy, total);
    }

    fn add_fairness(
        model: &mut LinearModel,
        pumps: &[PumpSpec],
        pump_vars: &[PumpVars],
        state: &CurrentState,
        weights: &WeightVector,
        dt_h: f64,
    ) {
        let hours: Vec<f64> = pumps
            .iter()
            .map(|spec| state.pump(&spec.id).map_or(0.0, |pump| pump.run_hours))
            .collect();
        let lowest = hours.iter().copied().fold(f64::INFINITY, f64::min);
        let highest = hours.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let span = highest - lowest;
        if !span.is_finite() || span < 0.5 {
            return;
        }
        let mut total = LinearExpr::new();
        for (vars, h) in pump_vars.iter().zip(&hours) {
            let wear = (h - lowest) / span;
            for on in &vars.on {
                total.add_term(*on, wear * dt_h);
            }
        }
        model.add_objective("fairness", weights.fairness, total);
    }
}
