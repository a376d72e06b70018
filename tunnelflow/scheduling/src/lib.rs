#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions,
    clippy::suboptimal_flops,
    clippy::too_many_lines
)]

//! Tunnelflow scheduling – constraint modeling, tiered MILP solving and the tactical MPC step.

/// Station, forecast and schedule types.
#[path = "../domain.rs"]
pub mod domain;

/// Controller errors and recoverable control signals.
#[path = "../error.rs"]
pub mod error;

/// Solver-agnostic linear model and its builder.
#[path = "../model/main.rs"]
pub mod model;

/// Solve cascade and backends.
#[path = "../solver/main.rs"]
pub mod solver;

/// TOML controller configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry handle for controller components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Tactical cycle entry point.
#[path = "../controller.rs"]
pub mod controller;

pub use config::{ControllerConfig, HorizonConfig};
pub use controller::{CycleOutcome, MpcController};
pub use domain::{
    ConstraintOverlay, CurrentState, FlushContext, ForecastSeries, HorizonKind,
    OptimizationResult, PumpSchedule, PumpSpec, PumpStatus, SolveMode, SystemConstraints,
    WeightMultipliers, WeightVector,
};
pub use error::{ControlSignal, ControllerError};
pub use solver::{SolveBackend, SolveRequest, SolverConfig, SolverOrchestrator};
pub use telemetry::{ControlTelemetry, ControlTelemetryBuilder};
