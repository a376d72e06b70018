use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tunnelflow_scheduling::domain::ConstraintOverlay;

/// Inflow below this is treated as this when computing relative error (m³/s).
pub const INFLOW_FLOOR_M3S: f64 = 0.1;
/// Price below this is treated as this when computing relative error (EUR/kWh).
pub const PRICE_FLOOR_EUR_KWH: f64 = 0.001;

const GOOD_BELOW: f64 = 0.10;
const FAIR_UP_TO: f64 = 0.25;
const TREND_BAND: f64 = 0.10;

/// Confidence classification of the recent forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Relative error below 10%.
    Good,
    /// Relative error 10–25%.
    Fair,
    /// Relative error above 25%.
    Poor,
}

impl Confidence {
    /// Classifies a mean relative error.
    #[must_use]
    pub fn from_relative_error(error: f64) -> Self {
        if error < GOOD_BELOW {
            Self::Good
        } else if error <= FAIR_UP_TO {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    /// One level worse.
    #[must_use]
    pub const fn downgraded(self) -> Self {
        match self {
            Self::Good => Self::Fair,
            Self::Fair | Self::Poor => Self::Poor,
        }
    }

    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

/// Direction of the recent error compared to the whole window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Recent errors more than 10% lower.
    Improving,
    /// Within ±10%.
    Stable,
    /// Recent errors more than 10% higher.
    Worsening,
}

#[derive(Debug, Clone, Copy)]
struct ErrorSample {
    inflow_abs: f64,
    inflow_rel: f64,
    price_abs: f64,
    price_rel: f64,
}

impl ErrorSample {
    fn worst_rel(&self) -> f64 {
        self.inflow_rel.max(self.price_rel)
    }
}

/// Snapshot of forecast quality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    /// Samples in the window.
    pub samples: usize,
    /// Mean absolute inflow error (m³/s).
    pub inflow_mae: f64,
    /// Mean absolute price error (EUR/kWh).
    pub price_mae: f64,
    /// Mean relative inflow error.
    pub inflow_relative_error: f64,
    /// Mean relative price error.
    pub price_relative_error: f64,
    /// Trend of the worse of the two relative errors.
    pub trend: Trend,
    /// Worse of the inflow and price classifications, after any missing-data downgrade.
    pub confidence: Confidence,
    /// Whether this cycle's forecast was incomplete.
    pub missing_data: bool,
}

impl QualityReport {
    /// Worse of the two mean relative errors.
    #[must_use]
    pub fn relative_error(&self) -> f64 {
        self.inflow_relative_error.max(self.price_relative_error)
    }
}

/// Sliding window of forecast errors.
#[derive(Debug, Clone)]
pub struct ForecastQualityTracker {
    window: usize,
    short_window: usize,
    samples: VecDeque<ErrorSample>,
    missing_data: bool,
}

impl Default for ForecastQualityTracker {
    fn default() -> Self {
        Self::new(50, 10)
    }
}

impl ForecastQualityTracker {
    /// Tracker with explicit window sizes.
    #[must_use]
    pub fn new(window: usize, short_window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            short_window: short_window.clamp(1, window),
            samples: VecDeque::with_capacity(window),
            missing_data: false,
        }
    }

    /// Clears per-cycle flags. Called once at the start of every cycle.
    pub fn start_cycle(&mut self) {
        self.missing_data = false;
    }

    /// Records the forecast and observed values of one step.
    pub fn record(
        &mut self,
        forecast_inflow: f64,
        actual_inflow: f64,
        forecast_price: f64,
        actual_price: f64,
    ) {
        if ![forecast_inflow, actual_inflow, forecast_price, actual_price]
            .iter()
            .all(|v| v.is_finite())
        {
            self.missing_data = true;
            return;
        }
        let inflow_abs = (forecast_inflow - actual_inflow).abs();
        let price_abs = (forecast_price - actual_price).abs();
        let sample = ErrorSample {
            inflow_abs,
            inflow_rel: inflow_abs / actual_inflow.abs().max(INFLOW_FLOOR_M3S),
            price_abs,
            price_rel: price_abs / actual_price.abs().max(PRICE_FLOOR_EUR_KWH),
        };
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Marks the current cycle's forecast as incomplete.
    pub fn note_missing_data(&mut self) {
        self.missing_data = true;
    }

    /// Samples currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True before the first sample.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Current report.
    #[must_use]
    pub fn report(&self) -> QualityReport {
        let n = self.samples.len();
        let avg = |f: fn(&ErrorSample) -> f64| {
            if n == 0 {
                0.0
            } else {
                self.samples.iter().map(f).sum::<f64>() / n as f64
            }
        };
        let inflow_relative_error = avg(|s| s.inflow_rel);
        let price_relative_error = avg(|s| s.price_rel);
        let mut confidence = Confidence::from_relative_error(inflow_relative_error)
            .max(Confidence::from_relative_error(price_relative_error));
        if self.missing_data {
            confidence = confidence.downgraded();
        }
        QualityReport {
            samples: n,
            inflow_mae: avg(|s| s.inflow_abs),
            price_mae: avg(|s| s.price_abs),
            inflow_relative_error,
            price_relative_error,
            trend: self.trend(),
            confidence,
            missing_data: self.missing_data,
        }
    }

    fn trend(&self) -> Trend {
        let n = self.samples.len();
        if n <= self.short_window {
            return Trend::Stable;
        }
        let whole = self.samples.iter().map(ErrorSample::worst_rel).sum::<f64>() / n as f64;
        let recent = self
            .samples
            .iter()
            .skip(n - self.short_window)
            .map(ErrorSample::worst_rel)
            .sum::<f64>()
            / self.short_window as f64;
        if whole <= f64::EPSILON {
            return Trend::Stable;
        }
        if recent < whole * (1.0 - TREND_BAND) {
            Trend::Improving
        } else if recent > whole * (1.0 + TREND_BAND) {
            Trend::Worsening
        } else {
            Trend::Stable
        }
    }

    /// Total band tightening for poor forecasts: 0.5 m at 25% error rising to 1.5 m at 50%.
    #[must_use]
    pub fn tightening_margin(&self) -> f64 {
        let report = self.report();
        if report.confidence != Confidence::Poor {
            return 0.0;
        }
        let excess = ((report.relative_error() - FAIR_UP_TO) / FAIR_UP_TO).clamp(0.0, 1.0);
        0.5 + excess
    }

    /// Band overlay for the tightening margin, mostly taken from the top of the band.
    #[must_use]
    pub fn overlay(&self) -> ConstraintOverlay {
        let margin = self.tightening_margin();
        ConstraintOverlay {
            l1_max_reduction: 0.8 * margin,
            l1_min_raise: 0.2 * margin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accurate_forecasts_are_good() {
        let mut tracker = ForecastQualityTracker::default();
        for _ in 0..20 {
            tracker.record(2.0, 2.05, 0.08, 0.081);
        }
        let report = tracker.report();
        assert_eq!(report.confidence, Confidence::Good);
        assert_eq!(report.trend, Trend::Stable);
        assert_eq!(tracker.tightening_margin(), 0.0);
        assert!(tracker.overlay().is_empty());
    }

    #[test]
    fn worst_signal_sets_confidence_and_tightening() {
        let mut tracker = ForecastQualityTracker::default();
        for _ in 0..20 {
            // inflow 50% off, price exact
            tracker.record(1.0, 2.0, 0.08, 0.08);
        }
        let report = tracker.report();
        assert_eq!(report.confidence, Confidence::Poor);
        assert!((report.inflow_relative_error - 0.5).abs() < 1e-9);
        assert!((tracker.tightening_margin() - 1.5).abs() < 1e-9);
        let overlay = tracker.overlay();
        assert!((overlay.l1_max_reduction + overlay.l1_min_raise - 1.5).abs() < 1e-9);
    }

    #[test]
    fn window_slides_and_trend_follows_recent_samples() {
        let mut tracker = ForecastQualityTracker::new(50, 10);
        for _ in 0..40 {
            tracker.record(1.0, 1.3, 0.08, 0.08);
        }
        for _ in 0..10 {
            tracker.record(1.0, 1.0, 0.08, 0.08);
        }
        assert_eq!(tracker.report().trend, Trend::Improving);
        for _ in 0..60 {
            tracker.record(1.0, 1.0, 0.08, 0.08);
        }
        assert_eq!(tracker.len(), 50);
        assert_eq!(tracker.report().confidence, Confidence::Good);
    }

    #[test]
    fn missing_data_downgrades_for_one_cycle() {
        let mut tracker = ForecastQualityTracker::default();
        tracker.record(2.0, 2.0, 0.08, 0.08);
        tracker.note_missing_data();
        assert_eq!(tracker.report().confidence, Confidence::Fair);
        tracker.start_cycle();
        assert_eq!(tracker.report().confidence, Confidence::Good);
    }
}
