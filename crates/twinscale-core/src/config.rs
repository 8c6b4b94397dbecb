//! twinscale.toml configuration parser.
//!
//! Every threshold the control loop uses lives here. Missing keys fall back
//! to [`Default`]; [`ScalerConfig::validate`] rejects values the loop cannot
//! run with (zero streak thresholds, empty windows, unparsable durations).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub window: WindowConfig,
    pub detector: DetectorConfig,
    pub policy: PolicyConfig,
    pub controller: ControllerConfig,
}

/// Retention and sufficiency policy for per-sensor sample windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Maximum samples retained per sensor.
    pub max_samples: usize,
    /// Maximum time span retained per sensor (e.g. "10m"). Unbounded if unset.
    pub max_span: Option<String>,
    /// Minimum samples before a window may be evaluated.
    pub min_samples: usize,
    /// Minimum time span before a window may be evaluated.
    pub min_span: String,
    /// Telemetry silence after which a sensor counts as stale. Disabled if unset.
    pub stale_after: Option<String>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_samples: 120,
            max_span: None,
            min_samples: 20,
            min_span: "0s".to_string(),
            stale_after: Some("15m".to_string()),
        }
    }
}

impl WindowConfig {
    pub fn max_span(&self) -> Option<Duration> {
        self.max_span.as_deref().and_then(parse_duration)
    }

    pub fn min_span(&self) -> Duration {
        parse_duration(&self.min_span).unwrap_or_default()
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after.as_deref().and_then(parse_duration)
    }
}

/// Which steady-state test the detector runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Half-window variance ratio plus robust trend slope.
    #[default]
    DispersionTrend,
    /// Mean absolute relative change between consecutive samples.
    RelativeChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub method: DetectionMethod,
    /// Allowed distance of the recent/prior variance ratio from 1.0.
    pub dispersion_tolerance: f64,
    /// Maximum normalised trend (drift across the window in standard
    /// deviations) for a steady verdict.
    pub trend_threshold: f64,
    /// Maximum mean relative change for a steady verdict (relative method).
    pub relative_tolerance: f64,
    /// Variances below this are treated as zero.
    pub variance_floor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            method: DetectionMethod::DispersionTrend,
            dispersion_tolerance: 0.5,
            trend_threshold: 1.0,
            relative_tolerance: 0.01,
            variance_floor: 1e-12,
        }
    }
}

/// Hysteresis thresholds for the scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Consecutive steady verdicts before scaling a sensor down.
    pub k_steady: u32,
    /// Consecutive transient verdicts before scaling a sensor up.
    pub k_transient: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            k_steady: 3,
            k_transient: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Interval between ticks (e.g. "30s").
    pub tick_interval: String,
    /// Maximum sensors processed concurrently within a tick.
    pub worker_concurrency: usize,
    /// Timeout for a single telemetry pull.
    pub fetch_timeout: String,
    /// Timeout for a single create/destroy command.
    pub command_timeout: String,
    /// Upper bound on one sensor's whole step within a tick.
    pub sensor_timeout: String,
    /// Consecutive command failures before a sensor is flagged degraded.
    pub max_command_failures: u32,
    /// Cap on telemetry retry backoff, in ticks.
    pub max_backoff_ticks: u64,
    /// Reconcile against the lifecycle collaborator every N ticks.
    pub reconcile_every: u64,
    /// How long tombstones of provisional sensors are kept.
    pub tombstone_ttl: String,
    /// How long shutdown waits for in-flight sensor steps.
    pub shutdown_grace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "30s".to_string(),
            worker_concurrency: 8,
            fetch_timeout: "10s".to_string(),
            command_timeout: "30s".to_string(),
            sensor_timeout: "60s".to_string(),
            max_command_failures: 5,
            max_backoff_ticks: 16,
            reconcile_every: 10,
            tombstone_ttl: "1h".to_string(),
            shutdown_grace: "10s".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn fetch_timeout(&self) -> Duration {
        parse_duration(&self.fetch_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn sensor_timeout(&self) -> Duration {
        parse_duration(&self.sensor_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn tombstone_ttl(&self) -> Duration {
        parse_duration(&self.tombstone_ttl).unwrap_or(Duration::from_secs(3600))
    }

    pub fn shutdown_grace(&self) -> Duration {
        parse_duration(&self.shutdown_grace).unwrap_or(Duration::from_secs(10))
    }
}

impl ScalerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ScalerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.window;
        if w.max_samples == 0 {
            return Err(ConfigError::Zero { field: "window.max_samples" });
        }
        // The dispersion test splits the window into two halves of at least
        // two samples each.
        if w.min_samples < 4 {
            return Err(ConfigError::Inconsistent(format!(
                "window.min_samples must be at least 4, got {}",
                w.min_samples
            )));
        }
        if w.min_samples > w.max_samples {
            return Err(ConfigError::Inconsistent(format!(
                "window.min_samples ({}) exceeds window.max_samples ({})",
                w.min_samples, w.max_samples
            )));
        }
        check_optional_duration("window.max_span", w.max_span.as_deref(), true)?;
        check_duration("window.min_span", &w.min_span, false)?;
        check_optional_duration("window.stale_after", w.stale_after.as_deref(), true)?;
        if let (Some(max), min) = (w.max_span(), w.min_span())
            && min > max
        {
            return Err(ConfigError::Inconsistent(format!(
                "window.min_span ({min:?}) exceeds window.max_span ({max:?})"
            )));
        }

        let d = &self.detector;
        check_positive("detector.dispersion_tolerance", d.dispersion_tolerance)?;
        check_positive("detector.trend_threshold", d.trend_threshold)?;
        check_positive("detector.relative_tolerance", d.relative_tolerance)?;
        check_positive("detector.variance_floor", d.variance_floor)?;

        if self.policy.k_steady == 0 {
            return Err(ConfigError::Zero { field: "policy.k_steady" });
        }
        if self.policy.k_transient == 0 {
            return Err(ConfigError::Zero { field: "policy.k_transient" });
        }

        let c = &self.controller;
        check_duration("controller.tick_interval", &c.tick_interval, true)?;
        check_duration("controller.fetch_timeout", &c.fetch_timeout, true)?;
        check_duration("controller.command_timeout", &c.command_timeout, true)?;
        check_duration("controller.sensor_timeout", &c.sensor_timeout, true)?;
        check_duration("controller.tombstone_ttl", &c.tombstone_ttl, false)?;
        check_duration("controller.shutdown_grace", &c.shutdown_grace, false)?;
        if c.worker_concurrency == 0 {
            return Err(ConfigError::Zero { field: "controller.worker_concurrency" });
        }
        if c.max_command_failures == 0 {
            return Err(ConfigError::Zero { field: "controller.max_command_failures" });
        }
        if c.max_backoff_ticks == 0 {
            return Err(ConfigError::Zero { field: "controller.max_backoff_ticks" });
        }
        if c.reconcile_every == 0 {
            return Err(ConfigError::Zero { field: "controller.reconcile_every" });
        }
        Ok(())
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive {
            field,
            value: value.to_string(),
        })
    }
}

fn check_duration(field: &'static str, value: &str, non_zero: bool) -> Result<(), ConfigError> {
    match parse_duration(value) {
        Some(d) if non_zero && d.is_zero() => Err(ConfigError::Zero { field }),
        Some(_) => Ok(()),
        None => Err(ConfigError::Duration {
            field,
            value: value.to_string(),
        }),
    }
}

fn check_optional_duration(
    field: &'static str,
    value: Option<&str>,
    non_zero: bool,
) -> Result<(), ConfigError> {
    match value {
        Some(v) => check_duration(field, v, non_zero),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ScalerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.controller.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.window.stale_after(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn parse_partial_document() {
        let toml_str = r#"
[policy]
k_steady = 5

[detector]
method = "relative_change"
relative_tolerance = 0.002

[window]
max_samples = 60
max_span = "10m"
"#;
        let config = ScalerConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.policy.k_steady, 5);
        assert_eq!(config.policy.k_transient, PolicyConfig::default().k_transient);
        assert_eq!(config.detector.method, DetectionMethod::RelativeChange);
        assert_eq!(config.window.max_span(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn rejects_zero_streak_threshold() {
        let mut config = ScalerConfig::default();
        config.policy.k_steady = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "policy.k_steady" })
        );
    }

    #[test]
    fn rejects_empty_window() {
        let mut config = ScalerConfig::default();
        config.window.max_samples = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "window.max_samples" })
        );
    }

    #[test]
    fn rejects_min_above_max_samples() {
        let mut config = ScalerConfig::default();
        config.window.min_samples = 200;
        assert!(matches!(config.validate(), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn rejects_bad_duration_and_thresholds() {
        let mut config = ScalerConfig::default();
        config.controller.tick_interval = "whenever".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duration { field: "controller.tick_interval", .. })
        ));

        let mut config = ScalerConfig::default();
        config.detector.trend_threshold = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "detector.trend_threshold", .. })
        ));

        let mut config = ScalerConfig::default();
        config.controller.worker_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ScalerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("k_steady"));
        let parsed = ScalerConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }
}
