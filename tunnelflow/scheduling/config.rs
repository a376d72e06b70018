use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::domain::{PumpSpec, SystemConstraints, WeightVector};
use crate::error::ControllerError;
use crate::solver::{check_station, SolverConfig};

/// Horizon lengths and cadences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HorizonConfig {
    /// Tactical window (hours).
    #[serde(default = "default_tactical_hours")]
    pub tactical_hours: f64,
    /// Strategic window (hours).
    #[serde(default = "default_strategic_hours")]
    pub strategic_hours: f64,
    /// Model step (minutes).
    #[serde(default = "default_step_minutes")]
    pub step_minutes: u32,
    /// Re-optimisation interval (minutes).
    #[serde(default = "default_reoptimize_minutes")]
    pub reoptimize_minutes: u32,
    /// Strategic plan time-to-live (minutes).
    #[serde(default = "default_plan_ttl_minutes")]
    pub plan_ttl_minutes: u32,
    /// Strategic bucket length (hours).
    #[serde(default = "default_strategic_period_hours")]
    pub strategic_period_hours: f64,
}

const fn default_tactical_hours() -> f64 {
    2.0
}
const fn default_strategic_hours() -> f64 {
    24.0
}
const fn default_step_minutes() -> u32 {
    15
}
const fn default_reoptimize_minutes() -> u32 {
    15
}
const fn default_plan_ttl_minutes() -> u32 {
    60
}
const fn default_strategic_period_hours() -> f64 {
    2.0
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            tactical_hours: default_tactical_hours(),
            strategic_hours: default_strategic_hours(),
            step_minutes: default_step_minutes(),
            reoptimize_minutes: default_reoptimize_minutes(),
            plan_ttl_minutes: default_plan_ttl_minutes(),
            strategic_period_hours: default_strategic_period_hours(),
        }
    }
}

impl HorizonConfig {
    /// Steps in the tactical window.
    #[must_use]
    pub fn tactical_steps(&self) -> usize {
        self.steps_for(self.tactical_hours)
    }

    /// Steps in the strategic window.
    #[must_use]
    pub fn strategic_steps(&self) -> usize {
        self.steps_for(self.strategic_hours)
    }

    fn steps_for(&self, hours: f64) -> usize {
        if self.step_minutes == 0 {
            return 0;
        }
        (hours * 60.0 / f64::from(self.step_minutes)).round().max(1.0) as usize
    }
}

/// Complete controller configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Tunnel and station limits.
    pub system: SystemConstraints,
    /// Baseline objective weights.
    #[serde(default)]
    pub weights: WeightVector,
    /// Solve cascade settings.
    #[serde(default)]
    pub solver: SolverConfig,
    /// Horizons and cadences.
    #[serde(default)]
    pub horizon: HorizonConfig,
    /// Pump table.
    #[serde(default)]
    pub pumps: Vec<PumpSpec>,
}

impl ControllerConfig {
    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Configuration`] for unreadable, malformed or inconsistent files.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            ControllerError::Configuration(format!("reading {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Configuration`] for malformed or inconsistent documents.
    pub fn from_toml_str(raw: &str) -> Result<Self, ControllerError> {
        let config: Self = toml::from_str(raw)
            .map_err(|err| ControllerError::Configuration(format!("parsing config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// [`ControllerError::Configuration`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ControllerError> {
        let fail = |msg: String| Err(ControllerError::Configuration(msg));
        let system = &self.system;
        check_station(&self.pumps, system)?;
        if system.flush_target_level < system.l1_min || system.flush_target_level > system.l1_max {
            return fail("flush_target_level must lie inside [l1_min, l1_max]".into());
        }
        let weights = &self.weights;
        if [
            weights.energy_cost,
            weights.smoothness,
            weights.safety_margin,
            weights.specific_energy,
            weights.fairness,
            weights.flush,
        ]
        .iter()
        .any(|w| !w.is_finite() || *w < 0.0)
        {
            return fail("weights must be finite and non-negative".into());
        }
        if self.horizon.step_minutes == 0 || self.horizon.reoptimize_minutes == 0 {
            return fail("step_minutes and reoptimize_minutes must be positive".into());
        }
        if self.horizon.tactical_hours <= 0.0 || self.horizon.strategic_hours < self.horizon.tactical_hours {
            return fail("strategic horizon must cover the tactical horizon".into());
        }
        if [self.solver.full_timeout_secs, self.solver.simplified_timeout_secs]
            .iter()
            .any(|secs| !secs.is_finite() || *secs <= 0.0)
        {
            return fail("solver timeouts must be finite and positive".into());
        }
        if self.solver.legacy_soft_mode
            && !system.legacy_soft_tolerance_m.is_some_and(|tol| tol > 0.0)
        {
            return fail("legacy_soft_mode requires system.legacy_soft_tolerance_m".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[system]
tunnel_volume_m3_per_m = 5000.0
l1_min = 0.5
l1_max = 8.0
min_pumps_on = 1
min_on_steps = 2
min_off_steps = 2
flush_target_level = 1.0

[weights]
safety_margin = 12.0

[horizon]
tactical_hours = 2.0

[[pumps]]
id = "P1"
max_flow_m3s = 2.0
max_power_kw = 400.0
min_frequency_hz = 30.0
max_frequency_hz = 50.0

[[pumps]]
id = "P2"
max_flow_m3s = 2.0
max_power_kw = 400.0
min_frequency_hz = 30.0
max_frequency_hz = 50.0
"#;

    #[test]
    fn sample_parses_with_defaults() {
        let config = ControllerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.pumps.len(), 2);
        assert!((config.weights.safety_margin - 12.0).abs() < 1e-12);
        assert!((config.weights.energy_cost - 1.0).abs() < 1e-12);
        assert_eq!(config.horizon.tactical_steps(), 8);
        assert_eq!(config.horizon.strategic_steps(), 96);
        assert!((config.solver.full_timeout_secs - 30.0).abs() < 1e-12);
        assert!((config.system.target_specific_energy_kwh_m3 - 0.04).abs() < 1e-12);
    }

    #[test]
    fn unbounded_timeouts_are_rejected() {
        for secs in ["inf", "nan", "0.0"] {
            let raw = format!("{SAMPLE}\n[solver]\nfull_timeout_secs = {secs}\n");
            let err = ControllerConfig::from_toml_str(&raw).unwrap_err();
            assert!(err.to_string().contains("timeouts"), "{secs}: {err}");
        }
    }

    #[test]
    fn inverted_frequency_range_is_rejected() {
        let raw = SAMPLE.replacen("min_frequency_hz = 30.0", "min_frequency_hz = 55.0", 1);
        let err = ControllerConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("frequency range"));
    }

    #[test]
    fn soft_mode_needs_tolerance() {
        let raw = format!("{SAMPLE}\n[solver]\nlegacy_soft_mode = true\n");
        assert!(ControllerConfig::from_toml_str(&raw).is_err());
        let raw = raw.replace(
            "flush_target_level = 1.0",
            "flush_target_level = 1.0\nlegacy_soft_tolerance_m = 0.3",
        );
        assert!(ControllerConfig::from_toml_str(&raw).is_ok());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert!(ControllerConfig::load(&path).is_ok());
        assert!(ControllerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
