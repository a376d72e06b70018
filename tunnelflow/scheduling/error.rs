use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::SolveMode;

/// Errors surfaced by modeling and solving.
///
/// Everything except [`ControllerError::Configuration`] is absorbed by the
/// solve cascade; configuration errors abort before the first cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControllerError {
    /// A tier exceeded its wall-clock budget.
    #[error("{tier:?} solve timed out after {budget:?}")]
    SolverTimeout {
        /// Tier that timed out.
        tier: SolveMode,
        /// Budget that was exceeded.
        budget: Duration,
    },
    /// The model has no feasible point.
    #[error("{tier:?} model infeasible: {detail}")]
    SolverInfeasible {
        /// Tier that failed.
        tier: SolveMode,
        /// Solver detail.
        detail: String,
    },
    /// The forecast covers fewer steps than requested.
    #[error("forecast covers {available} of {requested} requested steps")]
    MissingForecastData {
        /// Steps requested.
        requested: usize,
        /// Steps available.
        available: usize,
    },
    /// Static configuration is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The solver backend failed for a reason other than infeasibility.
    #[error("solver backend failure: {0}")]
    Backend(String),
    /// A decoded schedule broke a safety invariant.
    #[error("schedule rejected: {0}")]
    InvalidSolution(String),
}

impl ControllerError {
    /// True for errors that must abort a run instead of falling back.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Recoverable conditions that adjust the next solve. Not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    /// Observation departed from the previous prediction.
    DivergenceDetected {
        /// Trigger kind label.
        kind: String,
        /// Severity label.
        severity: String,
        /// Size of the departure in the trigger's unit.
        magnitude: f64,
    },
    /// Forecast confidence dropped.
    ForecastQualityDegraded {
        /// Confidence label after the drop.
        confidence: String,
        /// Mean relative error behind the label.
        relative_error: f64,
    },
    /// The forecast was shorter than requested and was truncated.
    ForecastTruncated {
        /// Steps requested.
        requested: usize,
        /// Steps used.
        available: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_is_fatal() {
        assert!(ControllerError::Configuration("x".into()).is_fatal());
        assert!(!ControllerError::SolverTimeout {
            tier: SolveMode::Full,
            budget: Duration::from_secs(30),
        }
        .is_fatal());
        assert!(!ControllerError::MissingForecastData {
            requested: 8,
            available: 3
        }
        .is_fatal());
    }
}
