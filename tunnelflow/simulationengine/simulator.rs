use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::topics;
use shared_logging::LogLevel;
use tracing::warn;
use tunnelflow_planning::explainer::{BoundedExplainer, ExplanationRequest, Narrative};
use tunnelflow_planning::quality::{Confidence, ForecastQualityTracker};
use tunnelflow_planning::strategic::{CacheStatus, PlanCache, PlanType, StrategicPlan, StrategicPlanner};
use tunnelflow_scheduling::config::{ControllerConfig, HorizonConfig};
use tunnelflow_scheduling::controller::MpcController;
use tunnelflow_scheduling::domain::{
    CurrentState, ForecastSeries, HorizonKind, OptimizationResult, PumpSpec, SolveMode,
    SystemConstraints, WeightVector,
};
use tunnelflow_scheduling::error::{ControlSignal, ControllerError};
use tunnelflow_scheduling::solver::SolveBackend;
use tunnelflow_scheduling::telemetry::ControlTelemetry;

use crate::baseline::{BaselineSample, NaiveBaseline};
use crate::compare::{RunTotals, SimulationSummary};
use crate::divergence::{DivergenceMonitor, DivergenceRecord, Prediction, Severity};
use crate::emergency::EmergencyAdjuster;
use crate::providers::{ForecastProvider, StateProvider};

/// Level within this distance above the flush target counts as flushed (m).
const FLUSH_REACHED_MARGIN_M: f64 = 0.2;

/// Stage of a control cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Pull the station state.
    Observe,
    /// Score the previous prediction and fetch forecasts.
    Assess,
    /// Reuse or refresh the strategic plan.
    Plan,
    /// Apply emergency and quality overrides.
    Override,
    /// Run the solve cascade.
    Solve,
    /// Update counters and the stored prediction.
    Record,
    /// Hand over the schedule.
    Advance,
}

/// What one phase did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    /// Phase.
    pub phase: CyclePhase,
    /// Short description.
    pub detail: String,
}

impl PhaseOutcome {
    fn new(phase: CyclePhase, detail: impl Into<String>) -> Self {
        Self {
            phase,
            detail: detail.into(),
        }
    }
}

/// Everything kept about one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Cycle number from zero.
    pub cycle: u64,
    /// Cycle time.
    pub timestamp: DateTime<Utc>,
    /// Observed level (m).
    pub observed_level_m: f64,
    /// Observed inflow (m³/s).
    pub observed_inflow_m3s: f64,
    /// Observed price (EUR/kWh).
    pub observed_price_eur_kwh: f64,
    /// Tier that produced the schedule.
    pub mode: SolveMode,
    /// Strategic stance in effect.
    pub plan_type: PlanType,
    /// Whether the plan was rebuilt this cycle.
    pub plan_refreshed: bool,
    /// Cache lookup outcome.
    pub cache_status: String,
    /// Forecast confidence this cycle.
    pub confidence: Confidence,
    /// Divergences against the previous prediction.
    pub divergences: Vec<DivergenceRecord>,
    /// Worst divergence severity.
    pub emergency_severity: Option<Severity>,
    /// Effective lower level bound (m).
    pub l1_min_m: f64,
    /// Effective upper level bound (m).
    pub l1_max_m: f64,
    /// Effective objective weights.
    pub weights: WeightVector,
    /// Signals raised during the cycle.
    pub signals: Vec<ControlSignal>,
    /// Pumps on in the first step.
    pub pumps_on: usize,
    /// Recommended first-step outflow (m³/s).
    pub first_step_outflow_m3s: f64,
    /// Energy cost of the interval (EUR).
    pub interval_cost_eur: f64,
    /// Hours since the last flush, as given to the solve.
    pub hours_since_flush: f64,
    /// Level reached the flush target this cycle after being away from it.
    pub flush_reached: bool,
    /// Operator narrative, if an explainer is attached.
    pub narrative: Option<Narrative>,
    /// Fallbacks and degradations.
    pub notes: Vec<String>,
    /// Phase log.
    pub phases: Vec<PhaseOutcome>,
}

/// Mutable state of one run. Owned by the loop, never shared.
struct RunState {
    tracker: ForecastQualityTracker,
    cache: PlanCache,
    run_hours: IndexMap<String, f64>,
    hours_since_flush: f64,
    at_flush: bool,
    prediction: Option<Prediction>,
    last_confidence: Confidence,
    optimized: RunTotals,
    samples: Vec<BaselineSample>,
    initial_level: Option<f64>,
    records: Vec<CycleRecord>,
}

impl RunState {
    fn new(pumps: &[PumpSpec], plan_ttl: Duration, hours_since_flush: f64) -> Self {
        Self {
            tracker: ForecastQualityTracker::default(),
            cache: PlanCache::new(plan_ttl),
            run_hours: pumps.iter().map(|pump| (pump.id.clone(), 0.0)).collect(),
            hours_since_flush,
            at_flush: false,
            prediction: None,
            last_confidence: Confidence::Good,
            optimized: RunTotals::default(),
            samples: Vec::new(),
            initial_level: None,
            records: Vec::new(),
        }
    }
}

/// Rolling-horizon control loop: Observe, Assess, Plan, Override, Solve, Record, Advance.
pub struct RollingSimulator {
    controller: MpcController,
    planner: StrategicPlanner,
    monitor: DivergenceMonitor,
    adjuster: EmergencyAdjuster,
    states: Arc<dyn StateProvider>,
    forecasts: Arc<dyn ForecastProvider>,
    explainer: Option<BoundedExplainer>,
    pumps: Vec<PumpSpec>,
    constraints: SystemConstraints,
    weights: WeightVector,
    horizon: HorizonConfig,
    initial_hours_since_flush: f64,
    telemetry: Option<ControlTelemetry>,
}

impl std::fmt::Debug for RollingSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingSimulator")
            .field("pumps", &self.pumps.len())
            .field("horizon", &self.horizon)
            .field("explainer", &self.explainer.is_some())
            .finish_non_exhaustive()
    }
}

impl RollingSimulator {
    /// Simulator over the given providers.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Configuration`] when the configuration is inconsistent.
    pub fn new(
        config: &ControllerConfig,
        states: Arc<dyn StateProvider>,
        forecasts: Arc<dyn ForecastProvider>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        Ok(Self {
            controller: MpcController::from_config(config),
            planner: StrategicPlanner::new(config.horizon.strategic_period_hours),
            monitor: DivergenceMonitor::default(),
            adjuster: EmergencyAdjuster::default(),
            states,
            forecasts,
            explainer: None,
            pumps: config.pumps.clone(),
            constraints: config.system.clone(),
            weights: config.weights,
            horizon: config.horizon.clone(),
            initial_hours_since_flush: 0.0,
            telemetry: None,
        })
    }

    /// Replaces the MILP backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn SolveBackend>) -> Self {
        self.controller = self.controller.with_backend(backend);
        self
    }

    /// Attaches a narrative explainer.
    #[must_use]
    pub fn with_explainer(mut self, explainer: BoundedExplainer) -> Self {
        self.explainer = Some(explainer);
        self
    }

    /// Hours since the last flush at the start of the run.
    #[must_use]
    pub const fn with_hours_since_flush(mut self, hours: f64) -> Self {
        self.initial_hours_since_flush = hours;
        self
    }

    /// Attaches telemetry to the loop, the controller and the planner.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.controller = self
            .controller
            .with_telemetry(telemetry.scoped("scheduling.controller"));
        self.planner = self
            .planner
            .with_telemetry(telemetry.scoped("planning.strategic"));
        self.telemetry = Some(telemetry);
        self
    }

    /// Runs cycles every `interval` from `start` until `end` and compares with the baseline.
    ///
    /// # Errors
    ///
    /// Invalid run bounds, a failing state provider, or a fatal controller error.
    pub async fn run_rolling(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<SimulationSummary> {
        ensure!(end > start, "run end {end} is not after start {start}");
        ensure!(interval > Duration::zero(), "cycle interval must be positive");
        let interval_hours = interval.num_seconds() as f64 / 3_600.0;
        let plan_ttl = Duration::minutes(i64::from(self.horizon.plan_ttl_minutes));
        let mut run = RunState::new(&self.pumps, plan_ttl, self.initial_hours_since_flush);

        let mut now = start;
        let mut cycle = 0_u64;
        while now < end {
            let record = self
                .run_cycle(&mut run, cycle, now, interval_hours)
                .await
                .with_context(|| format!("cycle {cycle} at {now}"))?;
            run.records.push(record);
            now += interval;
            cycle += 1;
        }

        let baseline = NaiveBaseline::new(self.pumps.clone(), self.constraints.clone()).evaluate(
            run.initial_level.unwrap_or(self.constraints.mid_band()),
            &run.samples,
            interval_hours,
        );
        let summary = SimulationSummary::new(
            start,
            end,
            run.optimized,
            baseline,
            run.run_hours,
            run.records,
        );
        self.log(
            LogLevel::Info,
            "simulation.run.completed",
            cycle,
            json!({
                "cycles": summary.cycles,
                "cost_savings_eur": summary.cost_savings_eur,
                "modes": summary.mode_counts,
                "divergences": summary.divergence_events,
            }),
        );
        self.event(
            topics::RUN_COMPLETED,
            json!({ "summary_id": summary.id, "cycles": summary.cycles }),
        );
        Ok(summary)
    }

    async fn run_cycle(
        &self,
        run: &mut RunState,
        cycle: u64,
        now: DateTime<Utc>,
        interval_hours: f64,
    ) -> Result<CycleRecord> {
        let mut phases = Vec::with_capacity(7);
        let mut notes = Vec::new();

        let observed = self
            .states
            .current_state(now)
            .await
            .context("observing station state")?;
        let state = observed.with_run_hours(&run.run_hours);
        run.initial_level.get_or_insert(state.level_m);
        let at_flush = state.level_m <= self.constraints.flush_target_level + FLUSH_REACHED_MARGIN_M;
        let flush_reached = at_flush && !run.at_flush;
        if at_flush {
            run.hours_since_flush = 0.0;
        }
        run.at_flush = at_flush;
        phases.push(PhaseOutcome::new(
            CyclePhase::Observe,
            format!(
                "level {:.2} m, inflow {:.2} m³/s, price {:.3} EUR/kWh",
                state.level_m, state.inflow_m3s, state.price_eur_kwh
            ),
        ));

        run.tracker.start_cycle();
        let divergences = run.prediction.map_or_else(Vec::new, |previous| {
            run.tracker.record(
                previous.inflow_m3s,
                state.inflow_m3s,
                previous.price_eur_kwh,
                state.price_eur_kwh,
            );
            self.monitor.check(&previous, &state)
        });
        let tactical_steps = self.controller.tactical_steps();
        let tactical = self
            .fetch_forecast(HorizonKind::Tactical, &state, tactical_steps, &mut run.tracker, &mut notes)
            .await;
        let strategic = self
            .fetch_forecast(
                HorizonKind::Strategic,
                &state,
                self.horizon.strategic_steps().max(tactical_steps),
                &mut run.tracker,
                &mut notes,
            )
            .await;
        let quality = run.tracker.report();
        let mut signals: Vec<ControlSignal> = divergences.iter().map(DivergenceRecord::signal).collect();
        if quality.confidence > run.last_confidence {
            signals.push(ControlSignal::ForecastQualityDegraded {
                confidence: quality.confidence.label().to_owned(),
                relative_error: quality.relative_error(),
            });
            self.event(
                topics::FORECAST_DEGRADED,
                json!({
                    "cycle": cycle,
                    "confidence": quality.confidence.label(),
                    "relative_error": quality.relative_error(),
                    "missing_data": quality.missing_data,
                }),
            );
        }
        run.last_confidence = quality.confidence;
        for record in &divergences {
            warn!(
                kind = record.kind.label(),
                severity = record.severity.label(),
                magnitude = record.magnitude,
                "divergence detected"
            );
            self.event(
                topics::DIVERGENCE_DETECTED,
                json!({
                    "cycle": cycle,
                    "kind": record.kind.label(),
                    "severity": record.severity.label(),
                    "predicted": record.predicted,
                    "observed": record.observed,
                }),
            );
        }
        phases.push(PhaseOutcome::new(
            CyclePhase::Assess,
            format!(
                "confidence {}, {} divergence(s)",
                quality.confidence.label(),
                divergences.len()
            ),
        ));

        let (plan, status) = self.current_plan(run, &strategic, &state, quality.confidence, now);
        let plan_refreshed = status != CacheStatus::Hit;
        phases.push(PhaseOutcome::new(
            CyclePhase::Plan,
            format!("{} ({})", plan.plan_type.label(), status.label()),
        ));

        let response = self.adjuster.respond(&divergences);
        let overlay = response.overlay.merge(run.tracker.overlay());
        let constraints = self.constraints.with_overlay(&overlay);
        let weights = self
            .weights
            .scaled(&response.bound(&plan.multipliers_at(now)));
        phases.push(PhaseOutcome::new(
            CyclePhase::Override,
            format!(
                "band [{:.2}, {:.2}] m, safety weight {:.2}",
                constraints.l1_min, constraints.l1_max, weights.safety_margin
            ),
        ));

        let hours_since_flush = run.hours_since_flush;
        let outcome = self
            .controller
            .solve_cycle(
                &state,
                &tactical,
                Some(&strategic),
                &constraints,
                &weights,
                Some(hours_since_flush),
            )
            .await
            .context("solving control cycle")?;
        signals.extend(outcome.signals);
        let result = outcome.result;
        notes.extend(result.notes.iter().cloned());
        phases.push(PhaseOutcome::new(
            CyclePhase::Solve,
            format!("{} in {} ms", result.mode.label(), result.solve_millis),
        ));

        let narrative = match &self.explainer {
            Some(explainer) => Some(
                explainer
                    .narrate(&ExplanationRequest::new(&result, Some(&plan)))
                    .await,
            ),
            None => None,
        };
        let interval_cost_eur = self.record_interval(run, &state, &result, interval_hours);
        run.prediction = Prediction::from_cycle(now, &result, &tactical);
        run.hours_since_flush += interval_hours;
        phases.push(PhaseOutcome::new(
            CyclePhase::Record,
            format!("interval cost {interval_cost_eur:.2} EUR"),
        ));

        self.states
            .write_schedule(&result)
            .await
            .context("writing schedule")?;
        phases.push(PhaseOutcome::new(
            CyclePhase::Advance,
            format!("{} pump(s) on", result.pumps_on_at(0)),
        ));

        let record = CycleRecord {
            cycle,
            timestamp: now,
            observed_level_m: state.level_m,
            observed_inflow_m3s: state.inflow_m3s,
            observed_price_eur_kwh: state.price_eur_kwh,
            mode: result.mode,
            plan_type: plan.plan_type,
            plan_refreshed,
            cache_status: status.label().to_owned(),
            confidence: quality.confidence,
            emergency_severity: response.severity,
            divergences,
            l1_min_m: constraints.l1_min,
            l1_max_m: constraints.l1_max,
            weights,
            signals,
            pumps_on: result.pumps_on_at(0),
            first_step_outflow_m3s: result.first_step_outflow(),
            interval_cost_eur,
            hours_since_flush,
            flush_reached,
            narrative,
            notes,
            phases,
        };
        self.log(
            LogLevel::Info,
            "simulation.cycle.completed",
            cycle,
            json!({
                "mode": record.mode.label(),
                "plan": record.plan_type.label(),
                "confidence": record.confidence.label(),
                "level": record.observed_level_m,
                "pumps_on": record.pumps_on,
                "cost": record.interval_cost_eur,
            }),
        );
        self.event(
            topics::CYCLE_COMPLETED,
            json!({ "cycle": cycle, "mode": record.mode.label(), "result_id": result.id }),
        );
        Ok(record)
    }

    /// Fetches a forecast; on failure holds the observed inflow and price over the horizon.
    async fn fetch_forecast(
        &self,
        kind: HorizonKind,
        state: &CurrentState,
        steps: usize,
        tracker: &mut ForecastQualityTracker,
        notes: &mut Vec<String>,
    ) -> ForecastSeries {
        let step_minutes = self.horizon.step_minutes;
        let reason = match self
            .forecasts
            .forecast(kind, state.timestamp, steps, step_minutes)
            .await
        {
            Ok(series) if series.len() >= steps => return series,
            Ok(series) if !series.is_empty() => {
                tracker.note_missing_data();
                return series;
            }
            Ok(_) => "empty series".to_owned(),
            Err(err) => format!("{err:#}"),
        };
        warn!(horizon = kind.label(), %reason, "forecast unavailable, holding current values");
        tracker.note_missing_data();
        notes.push(format!(
            "{} forecast unavailable ({reason}); holding current inflow and price",
            kind.label()
        ));
        ForecastSeries::flat(
            kind,
            state.timestamp,
            step_minutes,
            steps,
            state.inflow_m3s,
            state.price_eur_kwh,
        )
    }

    fn current_plan(
        &self,
        run: &mut RunState,
        strategic: &ForecastSeries,
        state: &CurrentState,
        confidence: Confidence,
        now: DateTime<Utc>,
    ) -> (StrategicPlan, CacheStatus) {
        let observed = Some(state.inflow_m3s);
        let signature = self.planner.signature(strategic, observed, confidence);
        let status = run.cache.status(&signature, now);
        if let Some(plan) = run.cache.get(&signature, now) {
            return (plan.clone(), status);
        }
        let plan = self.planner.plan(strategic, observed, confidence, now);
        run.cache.store(plan.clone());
        (plan, status)
    }

    /// Books the interval actually run, returns its cost.
    fn record_interval(
        &self,
        run: &mut RunState,
        state: &CurrentState,
        result: &OptimizationResult,
        interval_hours: f64,
    ) -> f64 {
        let power_kw: f64 = result
            .schedule
            .iter()
            .filter_map(|pump| pump.power_kw.first())
            .sum();
        let energy_kwh = power_kw * interval_hours;
        let cost_eur = energy_kwh * state.price_eur_kwh;
        run.optimized
            .add_interval(energy_kwh, cost_eur, state.level_m, &self.constraints);
        run.samples.push(BaselineSample {
            inflow_m3s: state.inflow_m3s,
            price_eur_kwh: state.price_eur_kwh,
        });
        for pump in &result.schedule {
            if pump.on.first().copied().unwrap_or(false) {
                *run.run_hours.entry(pump.pump_id.clone()).or_default() += interval_hours;
            }
        }
        cost_eur
    }

    fn log(&self, level: LogLevel, message: &str, cycle: u64, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log_cycle(level, message, cycle, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.event(event_type, payload);
        }
    }
}
