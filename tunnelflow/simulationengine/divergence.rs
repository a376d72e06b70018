use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::{CurrentState, ForecastSeries, OptimizationResult};
use tunnelflow_scheduling::error::ControlSignal;

/// Level error that triggers a divergence (m).
pub const LEVEL_TRIGGER_M: f64 = 0.5;
/// Observed/forecast inflow ratio that triggers a divergence.
pub const INFLOW_TRIGGER_RATIO: f64 = 1.3;
/// Observed/forecast price ratio that triggers a divergence.
pub const PRICE_TRIGGER_RATIO: f64 = 1.5;

const LEVEL_SEVERITY: [f64; 4] = [0.5, 0.75, 1.0, 1.5];
const INFLOW_SEVERITY: [f64; 4] = [1.3, 1.5, 1.75, 2.5];
const PRICE_SEVERITY: [f64; 4] = [1.5, 2.0, 3.0, 4.0];

const INFLOW_FLOOR_M3S: f64 = 0.1;
const PRICE_FLOOR_EUR_KWH: f64 = 0.001;

/// What departed from the prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// Level higher than predicted.
    LevelRising,
    /// Level lower than predicted.
    LevelFalling,
    /// Inflow well above the forecast.
    InflowSurge,
    /// Price well above the forecast.
    PriceSpike,
}

impl DivergenceKind {
    /// Label for logs and signals.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::LevelRising => "level_rising",
            Self::LevelFalling => "level_falling",
            Self::InflowSurge => "inflow_surge",
            Self::PriceSpike => "price_spike",
        }
    }
}

/// How far past the trigger the departure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Just past the trigger.
    Low,
    /// Second band.
    Medium,
    /// Third band.
    High,
    /// Beyond the last threshold.
    Critical,
}

impl Severity {
    /// Label for logs and signals.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn from_thresholds(magnitude: f64, thresholds: &[f64; 4]) -> Self {
        if magnitude >= thresholds[3] {
            Self::Critical
        } else if magnitude >= thresholds[2] {
            Self::High
        } else if magnitude >= thresholds[1] {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// What the previous cycle expected to see now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// When the prediction was made.
    pub made_at: DateTime<Utc>,
    /// Level after the first step, if the schedule had one.
    pub level_m: Option<f64>,
    /// First-step forecast inflow (m³/s).
    pub inflow_m3s: f64,
    /// First-step forecast price (EUR/kWh).
    pub price_eur_kwh: f64,
}

impl Prediction {
    /// Prediction carried from a solved cycle to the next one.
    #[must_use]
    pub fn from_cycle(
        made_at: DateTime<Utc>,
        result: &OptimizationResult,
        forecast: &ForecastSeries,
    ) -> Option<Self> {
        Some(Self {
            made_at,
            level_m: result.predicted_level_after_first_step(),
            inflow_m3s: *forecast.inflow_m3s.first()?,
            price_eur_kwh: *forecast.price_eur_kwh.first()?,
        })
    }
}

/// One triggered divergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    /// Trigger.
    pub kind: DivergenceKind,
    /// Severity band.
    pub severity: Severity,
    /// Level error in metres, or observed/forecast ratio.
    pub magnitude: f64,
    /// Predicted value.
    pub predicted: f64,
    /// Observed value.
    pub observed: f64,
}

impl DivergenceRecord {
    /// Signal recorded on the cycle.
    #[must_use]
    pub fn signal(&self) -> ControlSignal {
        ControlSignal::DivergenceDetected {
            kind: self.kind.label().to_owned(),
            severity: self.severity.label().to_owned(),
            magnitude: self.magnitude,
        }
    }
}

/// Compares the previous prediction with the new observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DivergenceMonitor {
    /// Level error trigger (m).
    pub level_trigger_m: f64,
    /// Inflow ratio trigger.
    pub inflow_trigger_ratio: f64,
    /// Price ratio trigger.
    pub price_trigger_ratio: f64,
}

impl Default for DivergenceMonitor {
    fn default() -> Self {
        Self {
            level_trigger_m: LEVEL_TRIGGER_M,
            inflow_trigger_ratio: INFLOW_TRIGGER_RATIO,
            price_trigger_ratio: PRICE_TRIGGER_RATIO,
        }
    }
}

impl DivergenceMonitor {
    /// Every trigger that fires, level first.
    #[must_use]
    pub fn check(&self, prediction: &Prediction, observed: &CurrentState) -> Vec<DivergenceRecord> {
        let mut records = Vec::new();

        if let Some(predicted) = prediction.level_m {
            let error = observed.level_m - predicted;
            if error.abs() > self.level_trigger_m {
                records.push(DivergenceRecord {
                    kind: if error > 0.0 {
                        DivergenceKind::LevelRising
                    } else {
                        DivergenceKind::LevelFalling
                    },
                    severity: Severity::from_thresholds(error.abs(), &LEVEL_SEVERITY),
                    magnitude: error.abs(),
                    predicted,
                    observed: observed.level_m,
                });
            }
        }

        let inflow_ratio = observed.inflow_m3s / prediction.inflow_m3s.max(INFLOW_FLOOR_M3S);
        if inflow_ratio > self.inflow_trigger_ratio {
            records.push(DivergenceRecord {
                kind: DivergenceKind::InflowSurge,
                severity: Severity::from_thresholds(inflow_ratio, &INFLOW_SEVERITY),
                magnitude: inflow_ratio,
                predicted: prediction.inflow_m3s,
                observed: observed.inflow_m3s,
            });
        }

        let price_ratio = observed.price_eur_kwh / prediction.price_eur_kwh.max(PRICE_FLOOR_EUR_KWH);
        if price_ratio > self.price_trigger_ratio {
            records.push(DivergenceRecord {
                kind: DivergenceKind::PriceSpike,
                severity: Severity::from_thresholds(price_ratio, &PRICE_SEVERITY),
                magnitude: price_ratio,
                predicted: prediction.price_eur_kwh,
                observed: observed.price_eur_kwh,
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(level: f64, inflow: f64, price: f64) -> Prediction {
        Prediction {
            made_at: Utc::now(),
            level_m: Some(level),
            inflow_m3s: inflow,
            price_eur_kwh: price,
        }
    }

    fn observed(level: f64, inflow: f64, price: f64) -> CurrentState {
        CurrentState {
            timestamp: Utc::now(),
            level_m: level,
            inflow_m3s: inflow,
            outflow_m3s: 2.0,
            price_eur_kwh: price,
            pumps: Vec::new(),
        }
    }

    #[test]
    fn doubled_inflow_is_a_high_surge() {
        let records = DivergenceMonitor::default().check(&prediction(4.0, 2.0, 0.08), &observed(4.1, 4.0, 0.08));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, DivergenceKind::InflowSurge);
        assert!(records[0].severity >= Severity::High);
        assert!((records[0].magnitude - 2.0).abs() < 1e-12);
    }

    #[test]
    fn level_error_direction_and_bands() {
        let rising = DivergenceMonitor::default().check(&prediction(4.0, 2.0, 0.08), &observed(4.8, 2.0, 0.08));
        assert_eq!(rising[0].kind, DivergenceKind::LevelRising);
        assert_eq!(rising[0].severity, Severity::Medium);

        let falling = DivergenceMonitor::default().check(&prediction(4.0, 2.0, 0.08), &observed(2.4, 2.0, 0.08));
        assert_eq!(falling[0].kind, DivergenceKind::LevelFalling);
        assert_eq!(falling[0].severity, Severity::Critical);

        assert!(DivergenceMonitor::default()
            .check(&prediction(4.0, 2.0, 0.08), &observed(4.4, 2.5, 0.11))
            .is_empty());
    }

    #[test]
    fn price_spike_uses_floor_for_tiny_forecasts() {
        let records = DivergenceMonitor::default().check(&prediction(4.0, 2.0, 0.0), &observed(4.0, 2.0, 0.005));
        assert_eq!(records[0].kind, DivergenceKind::PriceSpike);
        assert_eq!(records[0].severity, Severity::Critical);
        assert!(matches!(
            records[0].signal(),
            ControlSignal::DivergenceDetected { ref kind, .. } if kind == "price_spike"
        ));
    }
}
