use std::f64::consts::TAU;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{
    CurrentState, ForecastSeries, HorizonKind, OptimizationResult, PumpSpec, PumpStatus,
    SystemConstraints,
};

use crate::providers::{ForecastProvider, StateProvider};

const PHYSICS_STEP_SECONDS: i64 = 60;
const MIN_PRICE_EUR_KWH: f64 = 0.005;

/// Returns a reproducible RNG.
#[must_use]
pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

/// Triangular storm hydrograph on top of the diurnal inflow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StormEvent {
    /// Hours after the scenario start at which the storm begins.
    pub start_offset_hours: f64,
    /// Storm length (hours).
    pub duration_hours: f64,
    /// Extra inflow at the peak (m³/s).
    pub peak_m3s: f64,
}

/// Ground truth of a synthetic backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticScenario {
    /// Scenario start; storm offsets are relative to it.
    pub start: DateTime<Utc>,
    /// RNG seed for observation and forecast noise.
    pub seed: u64,
    /// Mean dry-weather inflow (m³/s).
    pub base_inflow_m3s: f64,
    /// Diurnal inflow swing (m³/s), peaking in the morning.
    pub inflow_amplitude_m3s: f64,
    /// Mean price (EUR/kWh).
    pub base_price_eur_kwh: f64,
    /// Diurnal price swing (EUR/kWh), peaking in the evening.
    pub price_amplitude_eur_kwh: f64,
    /// Level at the start (m).
    pub initial_level_m: f64,
    /// Relative noise on observed inflow and price.
    pub observation_noise: f64,
    /// Optional storm.
    pub storm: Option<StormEvent>,
}

impl SyntheticScenario {
    /// Dry-weather scenario with typical values.
    #[must_use]
    pub fn dry_weather(start: DateTime<Utc>, seed: u64) -> Self {
        Self {
            start,
            seed,
            base_inflow_m3s: 2.0,
            inflow_amplitude_m3s: 0.6,
            base_price_eur_kwh: 0.08,
            price_amplitude_eur_kwh: 0.03,
            initial_level_m: 3.0,
            observation_noise: 0.02,
            storm: None,
        }
    }

    /// Adds a storm.
    #[must_use]
    pub const fn with_storm(mut self, storm: StormEvent) -> Self {
        self.storm = Some(storm);
        self
    }

    /// True inflow at `at`. `include_storm` lets forecasters miss the storm.
    #[must_use]
    pub fn inflow_at(&self, at: DateTime<Utc>, include_storm: bool) -> f64 {
        let diurnal = self
            .inflow_amplitude_m3s
            .mul_add((TAU * (hour_of_day(at) - 2.0) / 24.0).sin(), self.base_inflow_m3s);
        let storm = match self.storm {
            Some(storm) if include_storm => {
                let elapsed = (at - self.start).num_seconds() as f64 / 3_600.0;
                let x = (elapsed - storm.start_offset_hours) / storm.duration_hours.max(f64::EPSILON);
                if (0.0..=1.0).contains(&x) {
                    storm.peak_m3s * (1.0 - 2.0f64.mul_add(x, -1.0).abs())
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        (diurnal + storm).max(0.0)
    }

    /// True spot price at `at`.
    #[must_use]
    pub fn price_at(&self, at: DateTime<Utc>) -> f64 {
        self.price_amplitude_eur_kwh
            .mul_add((TAU * (hour_of_day(at) - 12.0) / 24.0).sin(), self.base_price_eur_kwh)
            .max(MIN_PRICE_EUR_KWH)
    }
}

fn hour_of_day(at: DateTime<Utc>) -> f64 {
    f64::from(at.hour()) + f64::from(at.minute()) / 60.0
}

fn jitter(rng: &mut SmallRng, fraction: f64) -> f64 {
    if fraction <= 0.0 {
        1.0
    } else {
        1.0 + rng.gen_range(-fraction..=fraction)
    }
}

#[derive(Debug)]
struct TunnelInner {
    clock: DateTime<Utc>,
    level_m: f64,
    statuses: Vec<PumpStatus>,
    rng: SmallRng,
}

/// Simulated tunnel and pump station acting on the first step of every written schedule.
#[derive(Debug)]
pub struct SyntheticTunnel {
    scenario: SyntheticScenario,
    pumps: Vec<PumpSpec>,
    volume_m3_per_m: f64,
    inner: Mutex<TunnelInner>,
}

impl SyntheticTunnel {
    /// Tunnel at the scenario's initial level with the minimum pumps running at mid speed.
    #[must_use]
    pub fn new(
        scenario: SyntheticScenario,
        pumps: Vec<PumpSpec>,
        constraints: &SystemConstraints,
    ) -> Self {
        let statuses = pumps
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                if idx < constraints.min_pumps_on {
                    PumpStatus::running(
                        spec.id.clone(),
                        (spec.min_frequency_hz + spec.max_frequency_hz) / 2.0,
                    )
                } else {
                    PumpStatus::off(spec.id.clone())
                }
            })
            .collect();
        let inner = TunnelInner {
            clock: scenario.start,
            level_m: scenario.initial_level_m,
            statuses,
            rng: seeded_rng(scenario.seed),
        };
        Self {
            volume_m3_per_m: constraints.tunnel_volume_m3_per_m.max(f64::EPSILON),
            scenario,
            pumps,
            inner: Mutex::new(inner),
        }
    }

    /// True level right now, without advancing the clock.
    #[must_use]
    pub fn level(&self) -> f64 {
        self.inner.lock().level_m
    }

    fn outflow(&self, statuses: &[PumpStatus]) -> f64 {
        statuses
            .iter()
            .filter(|status| status.is_on)
            .filter_map(|status| {
                self.pumps
                    .iter()
                    .find(|spec| spec.id == status.id)
                    .map(|spec| spec.flow_per_hz() * status.frequency_hz)
            })
            .sum()
    }

    fn advance(&self, inner: &mut TunnelInner, now: DateTime<Utc>) {
        while inner.clock < now {
            let remaining = (now - inner.clock).num_seconds();
            let dt = remaining.clamp(1, PHYSICS_STEP_SECONDS);
            let inflow = self.scenario.inflow_at(inner.clock, true);
            let outflow = self.outflow(&inner.statuses);
            inner.level_m = ((inflow - outflow) * dt as f64 / self.volume_m3_per_m + inner.level_m).max(0.0);
            inner.clock += Duration::seconds(dt);
        }
    }
}

#[async_trait]
impl StateProvider for SyntheticTunnel {
    async fn current_state(&self, now: DateTime<Utc>) -> Result<CurrentState> {
        let mut inner = self.inner.lock();
        if now < inner.clock {
            bail!("requested state at {now}, tunnel clock already at {}", inner.clock);
        }
        self.advance(&mut inner, now);
        let noise = self.scenario.observation_noise;
        let inflow = self.scenario.inflow_at(now, true) * jitter(&mut inner.rng, noise);
        let price = self.scenario.price_at(now) * jitter(&mut inner.rng, noise);
        Ok(CurrentState {
            timestamp: now,
            level_m: inner.level_m,
            inflow_m3s: inflow.max(0.0),
            outflow_m3s: self.outflow(&inner.statuses),
            price_eur_kwh: price.max(MIN_PRICE_EUR_KWH),
            pumps: inner.statuses.clone(),
        })
    }

    async fn write_schedule(&self, result: &OptimizationResult) -> Result<()> {
        let mut inner = self.inner.lock();
        for status in &mut inner.statuses {
            let Some(pump) = result.schedule.iter().find(|pump| pump.pump_id == status.id) else {
                continue;
            };
            let (Some(&on), Some(&frequency)) = (pump.on.first(), pump.frequency_hz.first()) else {
                continue;
            };
            status.steps_in_state = Some(if on == status.is_on {
                status.steps_in_state.unwrap_or(0).saturating_add(1)
            } else {
                1
            });
            status.is_on = on;
            status.frequency_hz = if on { frequency } else { 0.0 };
        }
        Ok(())
    }
}

/// Forecaster that perturbs the ground truth, and may miss storms or run short.
#[derive(Debug)]
pub struct NoisyForecaster {
    scenario: SyntheticScenario,
    noise: f64,
    storm_visible: bool,
    max_steps: Option<usize>,
    unavailable: bool,
    rng: Mutex<SmallRng>,
}

impl NoisyForecaster {
    /// Forecaster with relative `noise` that sees the storm.
    #[must_use]
    pub fn new(scenario: SyntheticScenario, noise: f64) -> Self {
        let rng = seeded_rng(scenario.seed.wrapping_add(1));
        Self {
            scenario,
            noise: noise.max(0.0),
            storm_visible: true,
            max_steps: None,
            unavailable: false,
            rng: Mutex::new(rng),
        }
    }

    /// Forecasts dry weather through the storm.
    #[must_use]
    pub const fn blind_to_storms(mut self) -> Self {
        self.storm_visible = false;
        self
    }

    /// Never returns more than `steps` steps.
    #[must_use]
    pub const fn capped_at(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Every request fails.
    #[must_use]
    pub const fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }
}

#[async_trait]
impl ForecastProvider for NoisyForecaster {
    async fn forecast(
        &self,
        kind: HorizonKind,
        start: DateTime<Utc>,
        steps: usize,
        step_minutes: u32,
    ) -> Result<ForecastSeries> {
        if self.unavailable {
            bail!("{} forecast service unavailable", kind.label());
        }
        let steps = self.max_steps.map_or(steps, |cap| steps.min(cap));
        let mut rng = self.rng.lock();
        let (inflow, price): (Vec<f64>, Vec<f64>) = (0..steps)
            .map(|idx| {
                let at = start + Duration::minutes(i64::from(step_minutes) * idx as i64);
                let inflow = self.scenario.inflow_at(at, self.storm_visible) * jitter(&mut rng, self.noise);
                let price = self.scenario.price_at(at) * jitter(&mut rng, self.noise);
                (inflow.max(0.0), price.max(MIN_PRICE_EUR_KWH))
            })
            .unzip();
        Ok(ForecastSeries::new(kind, start, step_minutes, inflow, price))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tunnelflow_scheduling::domain::{PumpSchedule, SolveMode};
    use uuid::Uuid;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    fn pumps() -> Vec<PumpSpec> {
        ["P1", "P2"]
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

    fn all_on(frequency: f64) -> OptimizationResult {
        OptimizationResult {
            id: Uuid::new_v4(),
            created_at: start(),
            success: true,
            mode: SolveMode::RuleBased,
            step_minutes: 15,
            schedule: pumps()
                .iter()
                .map(|spec| PumpSchedule {
                    pump_id: spec.id.clone(),
                    on: vec![true],
                    frequency_hz: vec![frequency],
                    flow_m3s: vec![spec.flow_per_hz() * frequency],
                    power_kw: vec![spec.power_at(frequency, 3.0)],
                })
                .collect(),
            level_trajectory: vec![3.0],
            outflow_m3s: vec![4.0],
            total_cost: 0.0,
            total_energy_kwh: 0.0,
            violation_count: 0,
            max_violation_m: 0.0,
            objective_value: None,
            solve_millis: 0,
            notes: Vec::new(),
        }
    }

    #[test]
    fn storm_adds_triangular_peak() {
        let scenario = SyntheticScenario::dry_weather(start(), 7).with_storm(StormEvent {
            start_offset_hours: 2.0,
            duration_hours: 2.0,
            peak_m3s: 3.0,
        });
        let peak = start() + Duration::hours(3);
        let extra = scenario.inflow_at(peak, true) - scenario.inflow_at(peak, false);
        assert!((extra - 3.0).abs() < 1e-9);
        assert!((scenario.inflow_at(start(), true) - scenario.inflow_at(start(), false)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn tunnel_integrates_mass_balance() {
        let mut scenario = SyntheticScenario::dry_weather(start(), 1);
        scenario.observation_noise = 0.0;
        let tunnel = SyntheticTunnel::new(scenario, pumps(), &constraints());
        tunnel.write_schedule(&all_on(50.0)).await.unwrap();
        let later = tunnel.current_state(start() + Duration::minutes(15)).await.unwrap();
        // 4 m³/s out against roughly 1.5 m³/s in at midnight
        assert!(later.level_m < 3.0);
        assert!((later.outflow_m3s - 4.0).abs() < 1e-9);
        assert_eq!(later.pumps[0].steps_in_state, Some(1));
        assert!(tunnel.current_state(start()).await.is_err());
    }

    #[tokio::test]
    async fn forecaster_is_reproducible_and_can_run_short() {
        let scenario = SyntheticScenario::dry_weather(start(), 11);
        let a = NoisyForecaster::new(scenario.clone(), 0.1)
            .forecast(HorizonKind::Tactical, start(), 8, 15)
            .await
            .unwrap();
        let b = NoisyForecaster::new(scenario.clone(), 0.1)
            .forecast(HorizonKind::Tactical, start(), 8, 15)
            .await
            .unwrap();
        assert_eq!(a, b);
        let short = NoisyForecaster::new(scenario.clone(), 0.1)
            .capped_at(5)
            .forecast(HorizonKind::Tactical, start(), 8, 15)
            .await
            .unwrap();
        assert_eq!(short.len(), 5);
        assert!(NoisyForecaster::new(scenario, 0.0)
            .unavailable()
            .forecast(HorizonKind::Strategic, start(), 96, 15)
            .await
            .is_err());
    }
}
