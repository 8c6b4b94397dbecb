//! Steady-state detector — classifies a sample window as steady, transient,
//! or not yet judgeable.
//!
//! Two methods are available (see [`DetectionMethod`]):
//!
//! - **Dispersion/trend** compares the variance of the recent half of the
//!   window against the prior half and measures drift with a Theil–Sen slope
//!   normalised by the signal's standard deviation.
//! - **Relative change** averages the absolute relative change between
//!   consecutive samples.
//!
//! Confidence is the margin by which the measurements clear (steady) or miss
//! (transient) the thresholds, scaled to [0, 1]. It is not a probability.

use twinscale_core::config::{DetectionMethod, DetectorConfig};
use twinscale_core::{Classification, Verdict};

use crate::stats::{mean_abs_relative_change, theil_sen_slope, variance};
use crate::window::WindowSnapshot;

/// Pure evaluator over window snapshots. Holds only configuration.
#[derive(Debug, Clone)]
pub struct SteadyStateDetector {
    config: DetectorConfig,
}

/// Measurements behind a verdict, before classification.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Measurement {
    /// Excess over each threshold, as a fraction of the threshold. A steady
    /// window has every entry inside its band.
    dispersion_excess: f64,
    trend_excess: f64,
    dispersion_ratio: Option<f64>,
    trend: f64,
}

impl SteadyStateDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Evaluate a window. Deterministic: identical snapshots give identical
    /// verdicts. `computed_at` is the newest sample timestamp.
    pub fn evaluate(&self, window: &WindowSnapshot) -> Verdict {
        let computed_at = window.newest_timestamp().unwrap_or(0);
        if !window.is_sufficient() {
            return Verdict::insufficient(
                window.sensor_id(),
                window.len(),
                window.span_ms(),
                computed_at,
            );
        }

        let m = match self.config.method {
            DetectionMethod::DispersionTrend => self.measure_dispersion_trend(window),
            DetectionMethod::RelativeChange => self.measure_relative_change(window),
        };

        // Dispersion sits on a closed band, trend must stay strictly below.
        let steady = m.dispersion_excess <= 1.0 && m.trend_excess < 1.0;
        let confidence = if steady {
            (1.0 - m.dispersion_excess).min(1.0 - m.trend_excess)
        } else {
            (m.dispersion_excess - 1.0).max(m.trend_excess - 1.0)
        };

        Verdict {
            sensor_id: window.sensor_id().to_string(),
            window_span_ms: window.span_ms(),
            sample_count: window.len(),
            classification: if steady {
                Classification::Steady
            } else {
                Classification::Transient
            },
            confidence: clamp_unit(confidence),
            dispersion_ratio: m.dispersion_ratio,
            trend: Some(m.trend),
            computed_at,
        }
    }

    fn measure_dispersion_trend(&self, window: &WindowSnapshot) -> Measurement {
        let samples = window.samples();
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let floor = self.config.variance_floor;

        let mid = values.len() / 2;
        let var_prior = variance(&values[..mid]).unwrap_or(0.0);
        let var_recent = variance(&values[mid..]).unwrap_or(0.0);
        let ratio = if var_prior < floor && var_recent < floor {
            1.0
        } else if var_prior < floor {
            f64::INFINITY
        } else {
            var_recent / var_prior
        };

        let t0 = samples.first().map(|s| s.timestamp_ms).unwrap_or(0);
        let xs: Vec<f64> = samples
            .iter()
            .map(|s| (s.timestamp_ms - t0) as f64 / 1000.0)
            .collect();
        let slope = theil_sen_slope(&xs, &values).unwrap_or(0.0);
        let stddev = variance(&values).unwrap_or(0.0).sqrt().max(floor.sqrt());
        let span_secs = window.span_ms() as f64 / 1000.0;
        let trend = if slope == 0.0 {
            0.0
        } else {
            slope.abs() * span_secs / stddev
        };

        Measurement {
            dispersion_excess: (ratio - 1.0).abs() / self.config.dispersion_tolerance,
            trend_excess: trend / self.config.trend_threshold,
            dispersion_ratio: Some(ratio),
            trend,
        }
    }

    fn measure_relative_change(&self, window: &WindowSnapshot) -> Measurement {
        let values: Vec<f64> = window.samples().iter().map(|s| s.value).collect();
        // An all-zero signal has no defined relative change and is flat.
        let change = mean_abs_relative_change(&values).unwrap_or(0.0);

        Measurement {
            dispersion_excess: 0.0,
            trend_excess: change / self.config.relative_tolerance,
            dispersion_ratio: None,
            trend: change,
        }
    }
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}
