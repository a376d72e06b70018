//! Tiered solve cascade: full MILP, simplified MILP, rule-based schedule.

/// MILP backends.
pub mod backend;
/// Assignment decoding and result assembly.
pub mod decode;
/// Deterministic last-resort tier.
pub mod rule_based;
/// Safety invariant checks.
pub mod validate;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::topics;
use shared_logging::LogLevel;
use tracing::warn;

use crate::domain::{
    CurrentState, FlushContext, ForecastSeries, OptimizationResult, PumpSpec, SolveMode,
    SystemConstraints, WeightVector,
};
use crate::error::ControllerError;
use crate::model::{ConstraintModelBuilder, DecisionModel, ModelFidelity};
use crate::telemetry::ControlTelemetry;

pub use backend::{BackendError, BackendSolution, MicroLpBackend, SolveBackend};
pub use decode::{assemble_result, decode_assignment, HorizonFrame};
pub use rule_based::RuleBasedScheduler;
pub use validate::{check_invariants, check_station};

/// Budgets and switches of the cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SolverConfig {
    /// Wall-clock budget of the full tier (seconds).
    #[serde(default = "default_full_timeout")]
    pub full_timeout_secs: f64,
    /// Wall-clock budget of the simplified tier (seconds).
    #[serde(default = "default_simplified_timeout")]
    pub simplified_timeout_secs: f64,
    /// Deprecated soft level bounds. Needs `system.legacy_soft_tolerance_m`.
    #[serde(default)]
    pub legacy_soft_mode: bool,
}

const fn default_full_timeout() -> f64 {
    30.0
}

const fn default_simplified_timeout() -> f64 {
    10.0
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            full_timeout_secs: default_full_timeout(),
            simplified_timeout_secs: default_simplified_timeout(),
            legacy_soft_mode: false,
        }
    }
}

impl SolverConfig {
    /// Budget of a MILP tier.
    #[must_use]
    pub fn budget(&self, tier: SolveMode) -> Duration {
        let secs = match tier {
            SolveMode::Full => self.full_timeout_secs,
            SolveMode::Simplified | SolveMode::RuleBased => self.simplified_timeout_secs,
        };
        Duration::from_secs_f64(secs.max(0.001))
    }
}

/// Everything one cascade run needs, owned so tiers can move it to the blocking pool.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    /// Observed state.
    pub state: CurrentState,
    /// Tactical forecast, already truncated to the usable horizon.
    pub forecast: ForecastSeries,
    /// Effective constraints for this cycle.
    pub constraints: SystemConstraints,
    /// Effective weights for this cycle.
    pub weights: WeightVector,
    /// Flush statistics, if known.
    pub flush: Option<FlushContext>,
}

/// Runs the cascade against a [`SolveBackend`].
#[derive(Debug, Clone)]
pub struct SolverOrchestrator {
    pumps: Vec<PumpSpec>,
    config: SolverConfig,
    backend: Arc<dyn SolveBackend>,
    telemetry: Option<ControlTelemetry>,
}

impl SolverOrchestrator {
    /// Orchestrator using the default `microlp` backend.
    #[must_use]
    pub fn new(pumps: Vec<PumpSpec>, config: SolverConfig) -> Self {
        Self {
            pumps,
            config,
            backend: Arc::new(MicroLpBackend),
            telemetry: None,
        }
    }

    /// Replaces the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn SolveBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Cascade configuration.
    #[must_use]
    pub const fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Pump table.
    #[must_use]
    pub fn pumps(&self) -> &[PumpSpec] {
        &self.pumps
    }

    /// Solves one cycle. Always yields a schedule unless the configuration is unusable.
    ///
    /// # Errors
    ///
    /// Only fatal [`ControllerError::Configuration`] errors are returned, including
    /// a pump table or constraint set that fails [`check_station`].
    pub async fn solve(&self, request: SolveRequest) -> Result<OptimizationResult, ControllerError> {
        check_station(&self.pumps, &request.constraints)?;
        let started = Instant::now();
        let request = Arc::new(request);
        let mut notes = Vec::new();

        for (tier, fidelity) in [
            (SolveMode::Full, ModelFidelity::Full),
            (SolveMode::Simplified, ModelFidelity::Simplified),
        ] {
            match self.attempt(tier, fidelity, Arc::clone(&request)).await {
                Ok(mut result) => {
                    result.notes.extend(notes);
                    result.solve_millis = elapsed_millis(started);
                    self.log(
                        LogLevel::Info,
                        "solver.tier.succeeded",
                        json!({
                            "mode": tier.label(),
                            "objective": result.objective_value,
                            "cost": result.total_cost,
                            "millis": result.solve_millis,
                        }),
                    );
                    return Ok(result);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(tier = tier.label(), error = %err, "solver tier abandoned");
                    self.log(
                        LogLevel::Warn,
                        "solver.tier.failed",
                        json!({ "mode": tier.label(), "error": err.to_string() }),
                    );
                    self.event(
                        topics::SOLVER_FALLBACK,
                        json!({ "from": tier.label(), "error": err.to_string() }),
                    );
                    notes.push(format!("{}: {err}", tier.label()));
                }
            }
        }

        let mut result = RuleBasedScheduler::new(self.pumps.clone()).schedule(
            &request.state,
            &request.forecast,
            &request.constraints,
            request.flush.as_ref(),
        );
        notes.append(&mut result.notes);
        if let Err(breach) = check_invariants(
            &result,
            &request.state,
            &self.pumps,
            &request.constraints,
            None,
        ) {
            warn!(error = %breach, "rule-based schedule breaches an invariant");
            notes.push(format!("{}: {breach}", SolveMode::RuleBased.label()));
        }
        result.notes = notes;
        result.solve_millis = elapsed_millis(started);
        self.log(
            LogLevel::Warn,
            "solver.rule_based.used",
            json!({ "violations": result.violation_count, "notes": result.notes }),
        );
        Ok(result)
    }

    async fn attempt(
        &self,
        tier: SolveMode,
        fidelity: ModelFidelity,
        request: Arc<SolveRequest>,
    ) -> Result<OptimizationResult, ControllerError> {
        let decision = ConstraintModelBuilder::new(self.pumps.clone())
            .fidelity(fidelity)
            .legacy_soft_mode(self.config.legacy_soft_mode)
            .build(
                &request.state,
                &request.forecast,
                &request.constraints,
                &request.weights,
                request.flush.as_ref(),
            )?;
        self.log(
            LogLevel::Debug,
            "solver.model.built",
            json!({
                "mode": tier.label(),
                "variables": decision.model.variables.len(),
                "binaries": decision.model.binary_count(),
                "constraints": decision.model.constraints.len(),
                "flush_weight": decision.flush_weight,
            }),
        );

        let decision = Arc::new(decision);
        let budget = self.config.budget(tier);
        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&decision);
        let handle = tokio::task::spawn_blocking(move || backend.solve(&shared.model));
        let solution = match tokio::time::timeout(budget, handle).await {
            Err(_) => return Err(ControllerError::SolverTimeout { tier, budget }),
            Ok(Err(join)) => return Err(ControllerError::Backend(join.to_string())),
            Ok(Ok(Err(BackendError::Infeasible(detail)))) => {
                return Err(ControllerError::SolverInfeasible { tier, detail })
            }
            Ok(Ok(Err(BackendError::Failed(detail)))) => {
                return Err(ControllerError::Backend(detail))
            }
            Ok(Ok(Ok(solution))) => solution,
        };

        let result = decode_assignment(&decision, &solution.values, tier, solution.objective);
        self.verify(&decision, &request.state, &result)?;
        Ok(result)
    }

    fn verify(
        &self,
        decision: &DecisionModel,
        state: &CurrentState,
        result: &OptimizationResult,
    ) -> Result<(), ControllerError> {
        let tolerance = if decision.soft_bounds {
            decision.constraints.legacy_soft_tolerance_m
        } else {
            None
        };
        check_invariants(result, state, &self.pumps, &decision.constraints, tolerance)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.event(event_type, payload);
        }
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
