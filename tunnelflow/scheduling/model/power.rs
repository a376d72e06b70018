use crate::domain::PumpSpec;

/// Line `slope·freq + intercept·on`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLine {
    /// kW per Hz.
    pub slope: f64,
    /// kW at zero frequency, multiplied by the on/off variable.
    pub intercept: f64,
}

impl PowerLine {
    fn through(f0: f64, p0: f64, f1: f64, p1: f64) -> Self {
        let slope = if (f1 - f0).abs() < f64::EPSILON {
            0.0
        } else {
            (p1 - p0) / (f1 - f0)
        };
        Self {
            slope,
            intercept: p0 - slope * f0,
        }
    }

    /// Value at a running frequency.
    #[must_use]
    pub fn at(&self, frequency_hz: f64) -> f64 {
        self.slope.mul_add(frequency_hz, self.intercept)
    }
}

/// Piecewise-linear stand-in for the cubic affinity law over `[min_freq, max_freq]`.
///
/// The cubic is convex, so the interpolation equals the maximum of the
/// segment lines and the chord lies above it. Lower bands go against every
/// segment, the upper band against the chord.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerCurve {
    /// Segment lines of the interpolation.
    pub segments: Vec<PowerLine>,
    /// Chord from the minimum to the maximum frequency point.
    pub chord: PowerLine,
    /// Power at minimum frequency (kW).
    pub base_power_kw: f64,
    /// Nameplate maximum power (kW).
    pub max_power_kw: f64,
}

impl PowerCurve {
    /// Builds the curve for a pump at the given level.
    #[must_use]
    pub fn for_pump(spec: &PumpSpec, level_m: f64, segments: usize) -> Self {
        let segments = segments.max(1);
        let f_min = spec.min_frequency_hz;
        let f_max = spec.max_frequency_hz;
        let power = |f: f64| spec.power_at(f, level_m);
        let step = (f_max - f_min) / segments as f64;
        let lines = (0..segments)
            .map(|k| {
                let f0 = (k as f64).mul_add(step, f_min);
                let f1 = f0 + step;
                PowerLine::through(f0, power(f0), f1, power(f1))
            })
            .collect();
        Self {
            segments: lines,
            chord: PowerLine::through(f_min, power(f_min), f_max, power(f_max)),
            base_power_kw: power(f_min),
            max_power_kw: spec.max_power_kw,
        }
    }

    /// Interpolated power at a running frequency.
    #[must_use]
    pub fn interpolate(&self, frequency_hz: f64) -> f64 {
        self.segments
            .iter()
            .map(|line| line.at(frequency_hz))
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump() -> PumpSpec {
        PumpSpec {
            id: "P1".into(),
            max_flow_m3s: 2.0,
            max_power_kw: 400.0,
            min_frequency_hz: 30.0,
            max_frequency_hz: 50.0,
            level_power_slope: 0.0,
        }
    }

    #[test]
    fn interpolation_stays_within_band_of_cubic() {
        let spec = pump();
        let curve = PowerCurve::for_pump(&spec, 2.0, 4);
        for f in [30.0, 33.0, 37.5, 41.0, 46.0, 50.0] {
            let exact = spec.power_at(f, 2.0);
            let approx = curve.interpolate(f);
            assert!(approx >= exact - 1e-9, "interpolation of a convex curve is above it");
            assert!(approx <= exact * 1.15, "f={f}: {approx} vs {exact}");
            assert!(curve.chord.at(f) >= approx - 1e-9);
        }
    }

    #[test]
    fn endpoints_match_exact_power() {
        let spec = pump();
        let curve = PowerCurve::for_pump(&spec, 2.0, 3);
        assert!((curve.interpolate(50.0) - 400.0).abs() < 1e-6);
        assert!((curve.base_power_kw - 400.0 * 0.216).abs() < 1e-6);
    }
}
