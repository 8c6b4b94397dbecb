//! Domain types for the virtual sensor autoscaler.
//!
//! Samples flow in from the telemetry source, verdicts come out of the
//! detector, decisions come out of the policy engine, and sensor records
//! live in the registry. All types serialize to JSON so collaborators can
//! persist them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a virtual sensor.
pub type SensorId = String;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = u64;

// ── Telemetry ─────────────────────────────────────────────────────

/// A single telemetry reading for one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor_id: SensorId,
    pub timestamp_ms: EpochMillis,
    pub value: f64,
}

impl Sample {
    pub fn new(sensor_id: impl Into<SensorId>, timestamp_ms: EpochMillis, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp_ms,
            value,
        }
    }
}

// ── Verdicts ──────────────────────────────────────────────────────

/// Outcome of a steady-state evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Transient,
    Steady,
    InsufficientData,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Transient => write!(f, "transient"),
            Classification::Steady => write!(f, "steady"),
            Classification::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// Result of evaluating one window. Produced once per tick per sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub sensor_id: SensorId,
    /// Time between the oldest and newest sample evaluated.
    pub window_span_ms: u64,
    /// Number of samples evaluated.
    pub sample_count: usize,
    pub classification: Classification,
    /// How far the measurements sit inside (steady) or outside (transient)
    /// the configured thresholds, in [0, 1].
    pub confidence: f64,
    /// Recent-to-prior dispersion ratio, when measured.
    pub dispersion_ratio: Option<f64>,
    /// Normalised trend (or mean relative change), when measured.
    pub trend: Option<f64>,
    /// Timestamp of the newest sample in the window.
    pub computed_at: EpochMillis,
}

impl Verdict {
    /// Verdict for a window that cannot be judged yet.
    pub fn insufficient(
        sensor_id: impl Into<SensorId>,
        sample_count: usize,
        window_span_ms: u64,
        computed_at: EpochMillis,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            window_span_ms,
            sample_count,
            classification: Classification::InsufficientData,
            confidence: 0.0,
            dispersion_ratio: None,
            trend: None,
            computed_at,
        }
    }

    pub fn is_steady(&self) -> bool {
        self.classification == Classification::Steady
    }
}

// ── Sensor records ────────────────────────────────────────────────

/// Lifecycle of a virtual sensor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    PendingCreate,
    Active,
    PendingDestroy,
    Destroyed,
}

impl LifecycleState {
    /// Whether a lifecycle command is outstanding for this state.
    pub fn is_pending(self) -> bool {
        matches!(self, LifecycleState::PendingCreate | LifecycleState::PendingDestroy)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::PendingCreate => write!(f, "pending_create"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::PendingDestroy => write!(f, "pending_destroy"),
            LifecycleState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Registry-owned state of one virtual sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub sensor_id: SensorId,
    pub state: LifecycleState,
    pub consecutive_steady_count: u32,
    pub consecutive_transient_count: u32,
    /// Last time a transition or confirmation touched this record.
    pub last_action_at: EpochMillis,
    /// Auto-discovered from telemetry rather than registered by an operator.
    /// Provisional sensors are retired (not scaled down) once settled.
    pub provisional: bool,
    /// Lifecycle commands failed too often; skipped until cleared.
    pub degraded: bool,
    /// Consecutive lifecycle command failures.
    pub command_failures: u32,
    /// A `PendingCreate` record whose create command should go out. Set for
    /// operator registrations, applied scale-ups and drift; a sensor only
    /// seen in telemetry stays unprovisioned until it earns a scale-up.
    #[serde(default)]
    pub create_requested: bool,
    pub created_at: EpochMillis,
}

impl SensorRecord {
    pub fn new(
        sensor_id: impl Into<SensorId>,
        state: LifecycleState,
        provisional: bool,
        now: EpochMillis,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            state,
            consecutive_steady_count: 0,
            consecutive_transient_count: 0,
            last_action_at: now,
            provisional,
            degraded: false,
            command_failures: 0,
            create_requested: false,
            created_at: now,
        }
    }

    pub fn streak(&self) -> Streak {
        Streak {
            steady: self.consecutive_steady_count,
            transient: self.consecutive_transient_count,
        }
    }
}

/// Consecutive verdict counters used for hysteresis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streak {
    pub steady: u32,
    pub transient: u32,
}

// ── Decisions ─────────────────────────────────────────────────────

/// What the policy engine wants done with a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Hold,
    Retire,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
            ScalingAction::Hold => write!(f, "hold"),
            ScalingAction::Retire => write!(f, "retire"),
        }
    }
}

/// A scaling decision for a single sensor, produced once per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub sensor_id: SensorId,
    pub action: ScalingAction,
    pub reason: String,
    pub decided_at: EpochMillis,
    /// Streak counters the registry stores when applying this decision.
    pub streak: Streak,
}
