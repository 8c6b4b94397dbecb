//! twinscale-signal — per-sensor sample windows and steady-state detection.
//!
//! # Detection
//!
//! ```text
//! window      = last N samples (bounded by count and/or span)
//! prior, recent = first half, second half of the window
//!
//! ratio = var(recent) / var(prior)
//! trend = |theil_sen_slope| * span / stddev(window)
//!
//! STEADY    if |ratio - 1| <= dispersion_tolerance and trend < trend_threshold
//! TRANSIENT otherwise
//! INSUFFICIENT_DATA below the minimum sample count / span
//! ```
//!
//! The detector is a pure function of the window: identical windows always
//! produce identical verdicts.

pub mod detector;
pub mod stats;
pub mod window;

pub use detector::SteadyStateDetector;
pub use window::{PushReport, SensorWindowBuffer, WindowPolicy, WindowSnapshot};
