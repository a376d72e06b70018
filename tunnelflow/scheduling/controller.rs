use serde_json::json;
use shared_logging::LogLevel;

use crate::config::ControllerConfig;
use crate::domain::{
    CurrentState, FlushContext, ForecastSeries, OptimizationResult, PumpSpec, SystemConstraints,
    WeightVector,
};
use crate::error::{ControlSignal, ControllerError};
use crate::solver::{SolveBackend, SolveRequest, SolverConfig, SolverOrchestrator};
use crate::telemetry::ControlTelemetry;

/// Result of [`MpcController::solve_cycle`] plus the signals raised while preparing it.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// Schedule for the cycle.
    pub result: OptimizationResult,
    /// Recoverable conditions noticed on the way.
    pub signals: Vec<ControlSignal>,
    /// Flush statistics used, if the term was evaluated.
    pub flush: Option<FlushContext>,
}

/// Tactical MPC step: prepares forecasts and flush statistics, then runs the cascade.
#[derive(Debug, Clone)]
pub struct MpcController {
    orchestrator: SolverOrchestrator,
    tactical_steps: usize,
    telemetry: Option<ControlTelemetry>,
}

impl MpcController {
    /// Controller for a station with an explicit tactical length.
    #[must_use]
    pub fn new(pumps: Vec<PumpSpec>, solver: SolverConfig, tactical_steps: usize) -> Self {
        Self {
            orchestrator: SolverOrchestrator::new(pumps, solver),
            tactical_steps: tactical_steps.max(1),
            telemetry: None,
        }
    }

    /// Controller from a validated configuration document.
    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.pumps.clone(),
            config.solver.clone(),
            config.horizon.tactical_steps(),
        )
    }

    /// Replaces the solver backend.
    #[must_use]
    pub fn with_backend(mut self, backend: std::sync::Arc<dyn SolveBackend>) -> Self {
        self.orchestrator = self.orchestrator.with_backend(backend);
        self
    }

    /// Attaches telemetry to the controller and its orchestrator.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.orchestrator = self
            .orchestrator
            .with_telemetry(telemetry.scoped("scheduling.solver"));
        self.telemetry = Some(telemetry);
        self
    }

    /// Pump table.
    #[must_use]
    pub fn pumps(&self) -> &[PumpSpec] {
        self.orchestrator.pumps()
    }

    /// Tactical steps requested per cycle.
    #[must_use]
    pub const fn tactical_steps(&self) -> usize {
        self.tactical_steps
    }

    /// Solves one cycle.
    ///
    /// The pump table and `constraints` are checked before any tier runs. A tactical forecast shorter than requested is truncated and flagged. The
    /// strategic forecast only contributes flush-window statistics; without one
    /// the tactical forecast stands in. `flush_hours` is the time since the level
    /// last reached the flush target.
    ///
    /// # Errors
    ///
    /// Only fatal configuration errors, such as an inverted frequency range or
    /// more required pumps than the station has.
    pub async fn solve_cycle(
        &self,
        state: &CurrentState,
        tactical: &ForecastSeries,
        strategic: Option<&ForecastSeries>,
        constraints: &SystemConstraints,
        weights: &WeightVector,
        flush_hours: Option<f64>,
    ) -> Result<CycleOutcome, ControllerError> {
        let mut signals = Vec::new();
        let mut notes = Vec::new();
        let available = tactical.len();
        if available < self.tactical_steps {
            let missing = ControllerError::MissingForecastData {
                requested: self.tactical_steps,
                available,
            };
            self.log(
                LogLevel::Warn,
                "controller.forecast.truncated",
                json!({ "requested": self.tactical_steps, "available": available }),
            );
            notes.push(missing.to_string());
            signals.push(ControlSignal::ForecastTruncated {
                requested: self.tactical_steps,
                available,
            });
        }
        let forecast = tactical.truncated(self.tactical_steps);

        let flush = flush_hours.map(|hours| {
            let source = strategic.filter(|series| !series.is_empty()).unwrap_or(tactical);
            FlushContext::from_forecast(hours, source)
        });

        let request = SolveRequest {
            state: state.clone(),
            forecast,
            constraints: constraints.clone(),
            weights: *weights,
            flush,
        };
        let mut result = self.orchestrator.solve(request).await?;
        notes.append(&mut result.notes);
        result.notes = notes;
        self.log(
            LogLevel::Info,
            "controller.cycle.solved",
            json!({
                "mode": result.mode.label(),
                "steps": result.steps(),
                "cost": result.total_cost,
                "violations": result.violation_count,
                "flush_ramp": flush.map(|ctx| ctx.ramp()),
            }),
        );
        Ok(CycleOutcome {
            result,
            signals,
            flush,
        })
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::{HorizonKind, PumpStatus, SolveMode};

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
        CurrentState {
            timestamp: Utc::now(),
            level_m: level,
            inflow_m3s: inflow,
            outflow_m3s: 2.0,
            price_eur_kwh: 0.05,
            pumps: vec![
                PumpStatus::running("P1", 50.0),
                PumpStatus::off("P2"),
                PumpStatus::off("P3"),
            ],
        }
    }

    #[tokio::test]
    async fn near_ceiling_pumps_hard_in_first_step() {
        let controller = MpcController::new(pumps(), SolverConfig::default(), 4);
        let now = Utc::now();
        let tactical = ForecastSeries::flat(HorizonKind::Tactical, now, 15, 4, 3.0, 0.05);
        let strategic = ForecastSeries::flat(HorizonKind::Strategic, now, 15, 96, 2.0, 0.08);
        let outcome = controller
            .solve_cycle(
                &state(7.9, 3.0),
                &tactical,
                Some(&strategic),
                &constraints(),
                &WeightVector::default(),
                Some(2.0),
            )
            .await
            .unwrap();
        let capacity: f64 = pumps().iter().map(|p| p.max_flow_m3s).sum();
        assert!(outcome.result.first_step_outflow() >= 0.8 * capacity);
        assert!(outcome.result.level_trajectory.iter().all(|l| *l <= 8.0 + 1e-4));
        assert!(outcome.signals.is_empty());
    }

    #[tokio::test]
    async fn flush_window_drains_toward_target() {
        let controller = MpcController::new(pumps(), SolverConfig::default(), 4);
        let now = Utc::now();
        let tactical = ForecastSeries::flat(HorizonKind::Tactical, now, 15, 4, 0.5, 0.02);
        // Strategic mean inflow 1.0; prices alternate 0.04/0.12: mean 0.08, stdev 0.04.
        let strategic = ForecastSeries::new(
            HorizonKind::Strategic,
            now,
            15,
            vec![1.0; 96],
            (0..96).map(|i| if i % 2 == 0 { 0.04 } else { 0.12 }).collect(),
        );
        let start = 5.0;
        let outcome = controller
            .solve_cycle(
                &state(start, 0.5),
                &tactical,
                Some(&strategic),
                &constraints(),
                &WeightVector::default(),
                Some(21.0),
            )
            .await
            .unwrap();
        let flush = outcome.flush.unwrap();
        assert!(flush.ramp() > 0.0);
        assert!(flush.is_window(0.5, 0.02));
        let last = *outcome.result.level_trajectory.last().unwrap();
        assert!(last < start - 0.1, "ended at {last} in {:?}", outcome.result.mode);
    }

    #[tokio::test]
    async fn bad_station_is_a_configuration_error() {
        let tactical = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 4, 1.0, 0.08);
        let mut inverted = pumps();
        inverted[1].min_frequency_hz = 50.0;
        inverted[1].max_frequency_hz = 30.0;
        let err = MpcController::new(inverted, SolverConfig::default(), 4)
            .solve_cycle(
                &state(4.0, 1.0),
                &tactical,
                None,
                &constraints(),
                &WeightVector::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Configuration(_)));

        let mut crowded = constraints();
        crowded.min_pumps_on = 4;
        let err = MpcController::new(pumps(), SolverConfig::default(), 4)
            .solve_cycle(
                &state(4.0, 1.0),
                &tactical,
                None,
                &crowded,
                &WeightVector::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn short_forecast_is_truncated_and_flagged() {
        let controller = MpcController::new(pumps(), SolverConfig::default(), 8);
        let tactical = ForecastSeries::flat(HorizonKind::Tactical, Utc::now(), 15, 3, 1.0, 0.08);
        let outcome = controller
            .solve_cycle(
                &state(4.0, 1.0),
                &tactical,
                None,
                &constraints(),
                &WeightVector::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.result.steps(), 3);
        assert!(matches!(
            outcome.signals[0],
            ControlSignal::ForecastTruncated { requested: 8, available: 3 }
        ));
        assert!(outcome.result.notes[0].contains("3 of 8"));
        assert_ne!(outcome.result.mode, SolveMode::RuleBased);
    }
}
