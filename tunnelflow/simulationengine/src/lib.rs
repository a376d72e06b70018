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

//! Tunnelflow simulation engine – the rolling control loop, divergence handling and synthetic backtests.

/// Prediction-versus-observation checks.
#[path = "../divergence.rs"]
pub mod divergence;

/// Emergency overlays and weight bounds.
#[path = "../emergency.rs"]
pub mod emergency;

/// State and forecast provider seams.
#[path = "../providers.rs"]
pub mod providers;

/// Seeded synthetic tunnel and forecaster.
#[path = "../synthetic.rs"]
pub mod synthetic;

/// Naive reference controller.
#[path = "../baseline.rs"]
pub mod baseline;

/// Run totals and summaries.
#[path = "../compare.rs"]
pub mod compare;

/// Rolling-horizon control loop.
#[path = "../simulator.rs"]
pub mod simulator;

pub use compare::{RunTotals, SimulationSummary};
pub use divergence::{DivergenceKind, DivergenceMonitor, DivergenceRecord, Prediction, Severity};
pub use emergency::{EmergencyAdjuster, EmergencyResponse};
pub use providers::{ForecastProvider, StateProvider};
pub use simulator::{CyclePhase, CycleRecord, PhaseOutcome, RollingSimulator};
pub use synthetic::{NoisyForecaster, StormEvent, SyntheticScenario, SyntheticTunnel};
