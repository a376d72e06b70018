use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Narrowest level band an overlay may leave between `l1_min` and `l1_max` (m).
pub const MIN_LEVEL_BAND_M: f64 = 0.5;

/// Static description of one variable-speed pump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpSpec {
    /// Pump identifier.
    pub id: String,
    /// Flow at maximum frequency (m³/s).
    pub max_flow_m3s: f64,
    /// Electrical power at maximum frequency and reference head (kW).
    pub max_power_kw: f64,
    /// Lowest allowed running frequency (Hz).
    pub min_frequency_hz: f64,
    /// Highest allowed running frequency (Hz).
    pub max_frequency_hz: f64,
    /// Fractional power change per metre of tunnel level. Higher level means less head.
    #[serde(default)]
    pub level_power_slope: f64,
}

impl PumpSpec {
    /// Nominal flow per hertz (m³/s/Hz).
    #[must_use]
    pub fn flow_per_hz(&self) -> f64 {
        self.max_flow_m3s / self.max_frequency_hz
    }

    /// Nominal flow at minimum frequency.
    #[must_use]
    pub fn min_flow_m3s(&self) -> f64 {
        self.flow_per_hz() * self.min_frequency_hz
    }

    /// Head correction applied to the power curve at a given level.
    #[must_use]
    pub fn power_factor(&self, level_m: f64) -> f64 {
        self.level_power_slope
            .mul_add(-level_m, 1.0)
            .clamp(0.8, 1.15)
    }

    /// Cubic affinity-law power draw at `frequency_hz`.
    #[must_use]
    pub fn power_at(&self, frequency_hz: f64, level_m: f64) -> f64 {
        if frequency_hz <= 0.0 {
            return 0.0;
        }
        let ratio = frequency_hz / self.max_frequency_hz;
        self.max_power_kw * self.power_factor(level_m) * ratio.powi(3)
    }
}

/// Physical and operational limits of the tunnel and pump station.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConstraints {
    /// Storage volume per metre of tunnel level (m³/m).
    pub tunnel_volume_m3_per_m: f64,
    /// Lowest permitted level (m).
    pub l1_min: f64,
    /// Highest permitted level (m).
    pub l1_max: f64,
    /// Pumps that must run at every step.
    pub min_pumps_on: usize,
    /// Steps a pump stays on after starting.
    pub min_on_steps: usize,
    /// Steps a pump stays off after stopping.
    pub min_off_steps: usize,
    /// Level the daily flush drives towards (m).
    pub flush_target_level: f64,
    /// Specific-energy target used by the efficiency term (kWh/m³).
    #[serde(default = "default_specific_energy_target")]
    pub target_specific_energy_kwh_m3: f64,
    /// Deprecated bounded excursion allowance for the legacy soft mode (m).
    #[serde(default)]
    pub legacy_soft_tolerance_m: Option<f64>,
}

const fn default_specific_energy_target() -> f64 {
    0.04
}

impl SystemConstraints {
    /// Middle of the permitted level band.
    #[must_use]
    pub fn mid_band(&self) -> f64 {
        (self.l1_min + self.l1_max) / 2.0
    }

    /// Returns a derived copy with the overlay applied. `self` is never modified.
    #[must_use]
    pub fn with_overlay(&self, overlay: &ConstraintOverlay) -> Self {
        let mut derived = self.clone();
        let mut l1_max = self.l1_max - overlay.l1_max_reduction.max(0.0);
        let mut l1_min = self.l1_min + overlay.l1_min_raise.max(0.0);
        if l1_max - l1_min < MIN_LEVEL_BAND_M {
            l1_min = (l1_max - MIN_LEVEL_BAND_M).max(self.l1_min);
            if l1_max - l1_min < MIN_LEVEL_BAND_M {
                l1_max = l1_min + MIN_LEVEL_BAND_M;
            }
        }
        derived.l1_min = l1_min;
        derived.l1_max = l1_max;
        derived
    }
}

/// Derived tightening of the level band, produced by emergencies or poor forecasts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ConstraintOverlay {
    /// Metres removed from the top of the band.
    pub l1_max_reduction: f64,
    /// Metres added to the bottom of the band.
    pub l1_min_raise: f64,
}

impl ConstraintOverlay {
    /// Keeps the stronger tightening of both overlays.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            l1_max_reduction: self.l1_max_reduction.max(other.l1_max_reduction),
            l1_min_raise: self.l1_min_raise.max(other.l1_min_raise),
        }
    }

    /// True when the overlay changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.l1_max_reduction <= 0.0 && self.l1_min_raise <= 0.0
    }
}

/// Objective weights of the tactical model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WeightVector {
    /// Energy cost (per EUR).
    #[serde(default = "default_energy_cost")]
    pub energy_cost: f64,
    /// Outflow smoothness (per m³/s of step-to-step change).
    #[serde(default = "default_smoothness")]
    pub smoothness: f64,
    /// Distance from mid-band (per metre per step).
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Deviation from the specific-energy target (per kWh).
    #[serde(default = "default_specific_energy")]
    pub specific_energy: f64,
    /// Run-hour imbalance (per hour of on-time of worn pumps).
    #[serde(default = "default_fairness")]
    pub fairness: f64,
    /// Level above flush target inside flush windows (per metre per step, at full ramp).
    #[serde(default = "default_flush")]
    pub flush: f64,
}

const fn default_energy_cost() -> f64 {
    1.0
}
const fn default_smoothness() -> f64 {
    0.5
}
const fn default_safety_margin() -> f64 {
    10.0
}
const fn default_specific_energy() -> f64 {
    0.1
}
const fn default_fairness() -> f64 {
    2.0
}
const fn default_flush() -> f64 {
    60.0
}

impl Default for WeightVector {
    fn default() -> Self {
        Self {
            energy_cost: default_energy_cost(),
            smoothness: default_smoothness(),
            safety_margin: default_safety_margin(),
            specific_energy: default_specific_energy(),
            fairness: default_fairness(),
            flush: default_flush(),
        }
    }
}

impl WeightVector {
    /// Applies multipliers term by term. The flush weight is not scaled.
    #[must_use]
    pub fn scaled(&self, multipliers: &WeightMultipliers) -> Self {
        Self {
            energy_cost: self.energy_cost * multipliers.cost,
            smoothness: self.smoothness * multipliers.smoothness,
            safety_margin: self.safety_margin * multipliers.safety,
            specific_energy: self.specific_energy * multipliers.energy,
            fairness: self.fairness * multipliers.fairness,
            flush: self.flush,
        }
    }
}

/// Multiplicative overlay on [`WeightVector`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WeightMultipliers {
    /// Energy cost multiplier.
    pub cost: f64,
    /// Smoothness multiplier.
    pub smoothness: f64,
    /// Safety-margin multiplier.
    pub safety: f64,
    /// Specific-energy multiplier.
    pub energy: f64,
    /// Fairness multiplier.
    pub fairness: f64,
}

impl Default for WeightMultipliers {
    fn default() -> Self {
        Self::identity()
    }
}

impl WeightMultipliers {
    /// Multipliers that change nothing.
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            cost: 1.0,
            smoothness: 1.0,
            safety: 1.0,
            energy: 1.0,
            fairness: 1.0,
        }
    }

    /// Convenience constructor for the three terms overlays usually touch.
    #[must_use]
    pub const fn new(safety: f64, cost: f64, energy: f64) -> Self {
        Self {
            cost,
            smoothness: 1.0,
            safety,
            energy,
            fairness: 1.0,
        }
    }

    /// Term-wise product.
    #[must_use]
    pub fn combine(&self, other: &Self) -> Self {
        Self {
            cost: self.cost * other.cost,
            smoothness: self.smoothness * other.smoothness,
            safety: self.safety * other.safety,
            energy: self.energy * other.energy,
            fairness: self.fairness * other.fairness,
        }
    }

    /// Guarantees at least `floor.safety` and at most `floor.cost` and `floor.energy`.
    #[must_use]
    pub fn at_least_as_protective_as(&self, floor: &Self) -> Self {
        Self {
            cost: self.cost.min(floor.cost),
            smoothness: self.smoothness,
            safety: self.safety.max(floor.safety),
            energy: self.energy.min(floor.energy),
            fairness: self.fairness,
        }
    }
}

/// Observed state of a single pump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpStatus {
    /// Pump identifier.
    pub id: String,
    /// Whether the pump is running.
    pub is_on: bool,
    /// Current frequency (Hz), zero when off.
    pub frequency_hz: f64,
    /// Cumulative running hours.
    #[serde(default)]
    pub run_hours: f64,
    /// Steps spent in the current on/off state, if the telemetry knows.
    #[serde(default)]
    pub steps_in_state: Option<u32>,
}

impl PumpStatus {
    /// Stopped pump with unknown history.
    #[must_use]
    pub fn off(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_on: false,
            frequency_hz: 0.0,
            run_hours: 0.0,
            steps_in_state: None,
        }
    }

    /// Running pump with unknown history.
    #[must_use]
    pub fn running(id: impl Into<String>, frequency_hz: f64) -> Self {
        Self {
            id: id.into(),
            is_on: true,
            frequency_hz,
            run_hours: 0.0,
            steps_in_state: None,
        }
    }
}

/// Snapshot of the station at the start of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentState {
    /// Observation time.
    pub timestamp: DateTime<Utc>,
    /// Tunnel level (m).
    pub level_m: f64,
    /// Measured inflow (m³/s).
    pub inflow_m3s: f64,
    /// Measured outflow (m³/s).
    pub outflow_m3s: f64,
    /// Spot electricity price (EUR/kWh).
    pub price_eur_kwh: f64,
    /// Per-pump status.
    pub pumps: Vec<PumpStatus>,
}

impl CurrentState {
    /// Status of a pump by id.
    #[must_use]
    pub fn pump(&self, id: &str) -> Option<&PumpStatus> {
        self.pumps.iter().find(|pump| pump.id == id)
    }

    /// Copy whose pump run-hours come from the given ledger.
    #[must_use]
    pub fn with_run_hours(&self, run_hours: &IndexMap<String, f64>) -> Self {
        let mut state = self.clone();
        for pump in &mut state.pumps {
            if let Some(hours) = run_hours.get(&pump.id) {
                pump.run_hours = *hours;
            }
        }
        state
    }
}

/// Which horizon a forecast was requested for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HorizonKind {
    /// Short full-fidelity window (≈2h).
    Tactical,
    /// Long guidance window (≈24h).
    Strategic,
}

impl HorizonKind {
    /// Label for logging.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tactical => "tactical",
            Self::Strategic => "strategic",
        }
    }
}

/// Time-stamped inflow and price forecast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastSeries {
    /// Horizon the series was produced for.
    pub kind: HorizonKind,
    /// Step length (minutes).
    pub step_minutes: u32,
    /// Step start times.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Forecast inflow per step (m³/s).
    pub inflow_m3s: Vec<f64>,
    /// Forecast price per step (EUR/kWh).
    pub price_eur_kwh: Vec<f64>,
}

impl ForecastSeries {
    /// Builds a series with evenly spaced timestamps.
    #[must_use]
    pub fn new(
        kind: HorizonKind,
        start: DateTime<Utc>,
        step_minutes: u32,
        inflow_m3s: Vec<f64>,
        price_eur_kwh: Vec<f64>,
    ) -> Self {
        let steps = inflow_m3s.len().max(price_eur_kwh.len());
        let timestamps = (0..steps)
            .map(|idx| start + Duration::minutes(i64::from(step_minutes) * idx as i64))
            .collect();
        Self {
            kind,
            step_minutes,
            timestamps,
            inflow_m3s,
            price_eur_kwh,
        }
    }

    /// Constant forecast, handy for one-shot solves.
    #[must_use]
    pub fn flat(
        kind: HorizonKind,
        start: DateTime<Utc>,
        step_minutes: u32,
        steps: usize,
        inflow_m3s: f64,
        price_eur_kwh: f64,
    ) -> Self {
        Self::new(
            kind,
            start,
            step_minutes,
            vec![inflow_m3s; steps],
            vec![price_eur_kwh; steps],
        )
    }

    /// Usable steps: the shortest of the three arrays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps
            .len()
            .min(self.inflow_m3s.len())
            .min(self.price_eur_kwh.len())
    }

    /// True when no step is usable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Step length in hours.
    #[must_use]
    pub fn step_hours(&self) -> f64 {
        f64::from(self.step_minutes) / 60.0
    }

    /// First `steps` usable steps, with all arrays cut to the same length.
    #[must_use]
    pub fn truncated(&self, steps: usize) -> Self {
        let steps = steps.min(self.len());
        Self {
            kind: self.kind,
            step_minutes: self.step_minutes,
            timestamps: self.timestamps[..steps].to_vec(),
            inflow_m3s: self.inflow_m3s[..steps].to_vec(),
            price_eur_kwh: self.price_eur_kwh[..steps].to_vec(),
        }
    }

    /// Mean forecast inflow over the usable steps.
    #[must_use]
    pub fn mean_inflow(&self) -> f64 {
        mean(&self.inflow_m3s[..self.len()])
    }

    /// Mean and population standard deviation of the usable prices.
    #[must_use]
    pub fn price_stats(&self) -> (f64, f64) {
        let prices = &self.price_eur_kwh[..self.len()];
        let mu = mean(prices);
        (mu, std_dev(prices, mu))
    }
}

/// Arithmetic mean, zero for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population standard deviation around `mu`.
#[must_use]
pub fn std_dev(values: &[f64], mu: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Statistics that decide whether the daily flush term is active and where.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FlushContext {
    /// Hours since the level last reached the flush target.
    pub hours_since_flush: f64,
    /// Average inflow over the strategic horizon (m³/s).
    pub inflow_avg_24h: f64,
    /// Mean price over the strategic horizon.
    pub price_mean_24h: f64,
    /// Price standard deviation over the strategic horizon.
    pub price_std_24h: f64,
}

impl FlushContext {
    /// Hours without flush after which the term switches on.
    pub const ACTIVATION_HOURS: f64 = 20.0;
    /// Hours at which the term reaches full weight.
    pub const FULL_WEIGHT_HOURS: f64 = 24.0;
    /// Inflow must be below this fraction of the 24h average.
    pub const LOW_INFLOW_RATIO: f64 = 0.8;
    /// Price must be below mean minus this many standard deviations.
    pub const LOW_PRICE_SIGMAS: f64 = 0.3;
    /// Smallest ramp once active, so a just-activated term is never zero.
    const MIN_RAMP: f64 = 0.1;

    /// Derives the context from a strategic forecast.
    #[must_use]
    pub fn from_forecast(hours_since_flush: f64, strategic: &ForecastSeries) -> Self {
        let (price_mean_24h, price_std_24h) = strategic.price_stats();
        Self {
            hours_since_flush,
            inflow_avg_24h: strategic.mean_inflow(),
            price_mean_24h,
            price_std_24h,
        }
    }

    /// Fraction of the flush weight in effect: 0 below 20h, ramping to 1 at 24h.
    #[must_use]
    pub fn ramp(&self) -> f64 {
        if self.hours_since_flush <= Self::ACTIVATION_HOURS {
            return 0.0;
        }
        ((self.hours_since_flush - Self::ACTIVATION_HOURS)
            / (Self::FULL_WEIGHT_HOURS - Self::ACTIVATION_HOURS))
            .clamp(Self::MIN_RAMP, 1.0)
    }

    /// Whether a step with this inflow and price is a favourable flush window.
    #[must_use]
    pub fn is_window(&self, inflow_m3s: f64, price_eur_kwh: f64) -> bool {
        inflow_m3s < Self::LOW_INFLOW_RATIO * self.inflow_avg_24h
            && price_eur_kwh < self.price_std_24h.mul_add(-Self::LOW_PRICE_SIGMAS, self.price_mean_24h)
    }
}

/// Solve tier that produced a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SolveMode {
    /// Complete MILP.
    Full,
    /// Safety-critical MILP with loosened bands.
    Simplified,
    /// Deterministic heuristic.
    RuleBased,
}

impl SolveMode {
    /// Label for logging.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Simplified => "simplified",
            Self::RuleBased => "rule_based",
        }
    }
}

/// Setpoints for one pump over the horizon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpSchedule {
    /// Pump identifier.
    pub pump_id: String,
    /// On/off per step.
    pub on: Vec<bool>,
    /// Frequency per step (Hz).
    pub frequency_hz: Vec<f64>,
    /// Flow per step (m³/s).
    pub flow_m3s: Vec<f64>,
    /// Power per step (kW).
    pub power_kw: Vec<f64>,
}

/// Outcome of one solve, immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Result identifier.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Always true for returned results; degraded tiers still succeed.
    pub success: bool,
    /// Tier that produced the schedule.
    pub mode: SolveMode,
    /// Step length (minutes).
    pub step_minutes: u32,
    /// Per-pump setpoints.
    pub schedule: Vec<PumpSchedule>,
    /// Level at the end of each step (m).
    pub level_trajectory: Vec<f64>,
    /// Total pumped flow per step (m³/s).
    pub outflow_m3s: Vec<f64>,
    /// Energy cost over the horizon (EUR).
    pub total_cost: f64,
    /// Energy over the horizon (kWh).
    pub total_energy_kwh: f64,
    /// Steps whose level leaves the band.
    pub violation_count: usize,
    /// Largest excursion outside the band (m).
    pub max_violation_m: f64,
    /// Objective value reported by the solver, if a MILP tier produced the result.
    pub objective_value: Option<f64>,
    /// Wall-clock time spent in the cascade (ms).
    pub solve_millis: u64,
    /// Why higher tiers were abandoned, and other degradations.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl OptimizationResult {
    /// Number of steps in the schedule.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.level_trajectory.len()
    }

    /// Pumps running at step `t`.
    #[must_use]
    pub fn pumps_on_at(&self, t: usize) -> usize {
        self.schedule
            .iter()
            .filter(|pump| pump.on.get(t).copied().unwrap_or(false))
            .count()
    }

    /// Total outflow of the first step, zero for an empty schedule.
    #[must_use]
    pub fn first_step_outflow(&self) -> f64 {
        self.outflow_m3s.first().copied().unwrap_or(0.0)
    }

    /// Level predicted at the end of the first step.
    #[must_use]
    pub fn predicted_level_after_first_step(&self) -> Option<f64> {
        self.level_trajectory.first().copied()
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
    fn overlay_is_a_derived_copy() {
        let base = constraints();
        let derived = base.with_overlay(&ConstraintOverlay {
            l1_max_reduction: 1.25,
            l1_min_raise: 0.3,
        });
        assert!((derived.l1_max - 6.75).abs() < 1e-9);
        assert!((derived.l1_min - 0.8).abs() < 1e-9);
        assert!((base.l1_max - 8.0).abs() < 1e-9);
    }

    #[test]
    fn overlay_never_inverts_band() {
        let derived = constraints().with_overlay(&ConstraintOverlay {
            l1_max_reduction: 7.4,
            l1_min_raise: 0.3,
        });
        assert!(derived.l1_max - derived.l1_min >= MIN_LEVEL_BAND_M - 1e-9);
        assert!(derived.l1_min >= 0.5);
    }

    #[test]
    fn flush_ramp_starts_after_twenty_hours() {
        let mut ctx = FlushContext {
            hours_since_flush: 19.0,
            inflow_avg_24h: 1.0,
            price_mean_24h: 0.08,
            price_std_24h: 0.02,
        };
        assert_eq!(ctx.ramp(), 0.0);
        ctx.hours_since_flush = 21.0;
        assert!((ctx.ramp() - 0.25).abs() < 1e-9);
        ctx.hours_since_flush = 30.0;
        assert!((ctx.ramp() - 1.0).abs() < 1e-9);
        assert!(ctx.is_window(0.5, 0.05));
        assert!(!ctx.is_window(0.9, 0.05));
        assert!(!ctx.is_window(0.5, 0.075));
    }

    #[test]
    fn truncation_aligns_arrays() {
        let mut forecast = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 8, 1.0, 0.1);
        forecast.price_eur_kwh.truncate(5);
        assert_eq!(forecast.len(), 5);
        let cut = forecast.truncated(6);
        assert_eq!(cut.inflow_m3s.len(), 5);
        assert_eq!(cut.timestamps.len(), 5);
    }

    #[test]
    fn protective_bound_caps_cost_and_floors_safety() {
        let strategic = WeightMultipliers::new(0.9, 1.4, 1.1);
        let emergency = WeightMultipliers::new(2.0, 0.3, 0.5);
        let combined = strategic
            .combine(&emergency)
            .at_least_as_protective_as(&emergency);
        assert!(combined.safety >= 2.0);
        assert!(combined.cost <= 0.3 + 1e-12);
    }
}
