//! Error taxonomy for the autoscaler.
//!
//! Nothing here is fatal to the control loop except [`ConfigError`], which is
//! only raised while validating configuration at startup.

use thiserror::Error;

use crate::types::{EpochMillis, LifecycleState, ScalingAction, SensorId};

/// A sample the window buffer refused to insert.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    #[error(
        "out-of-order sample for {sensor_id}: timestamp {timestamp_ms} does not advance past {last_timestamp_ms}"
    )]
    OutOfOrderSample {
        sensor_id: SensorId,
        timestamp_ms: EpochMillis,
        last_timestamp_ms: EpochMillis,
    },

    #[error("sample for {got} pushed into window for {expected}")]
    SensorMismatch { expected: SensorId, got: SensorId },

    #[error("non-finite value for {sensor_id} at {timestamp_ms}")]
    NonFiniteValue {
        sensor_id: SensorId,
        timestamp_ms: EpochMillis,
    },
}

/// What was applied to a record when a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionInput {
    Decision(ScalingAction),
    CreateConfirmed,
    DestroyConfirmed,
    /// Reconciliation found no live instance behind an active record.
    DriftDetected,
}

impl std::fmt::Display for TransitionInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionInput::Decision(action) => write!(f, "{action}"),
            TransitionInput::CreateConfirmed => write!(f, "create_confirmed"),
            TransitionInput::DestroyConfirmed => write!(f, "destroy_confirmed"),
            TransitionInput::DriftDetected => write!(f, "drift_detected"),
        }
    }
}

/// Errors raised by the sensor registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("invalid transition for {sensor_id}: {input} from {}", display_state(.from))]
    InvalidTransition {
        sensor_id: SensorId,
        from: Option<LifecycleState>,
        input: TransitionInput,
    },

    #[error("sensor not found: {0}")]
    NotFound(SensorId),

    #[error("sensor {sensor_id} already registered ({state})")]
    AlreadyRegistered {
        sensor_id: SensorId,
        state: LifecycleState,
    },
}

fn display_state(state: &Option<LifecycleState>) -> String {
    match state {
        Some(s) => s.to_string(),
        None => "absent".to_string(),
    }
}

/// Failure reported by an external collaborator (telemetry source,
/// lifecycle controller, decision sink).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Invalid configuration, rejected at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be a positive finite number, got {value}")]
    NotPositive { field: &'static str, value: String },

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),
}

/// Per-sensor fault surfaced by a controller tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScalerError {
    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("insufficient data for {sensor_id}: {have} samples, need {need}")]
    InsufficientData {
        sensor_id: SensorId,
        have: usize,
        need: usize,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("telemetry unavailable for {sensor_id}: {source}")]
    TelemetryUnavailable {
        sensor_id: SensorId,
        source: CollaboratorError,
    },

    #[error("lifecycle command {command} failed for {sensor_id}: {source}")]
    LifecycleCommandFailed {
        sensor_id: SensorId,
        command: &'static str,
        source: CollaboratorError,
    },

    #[error("sensor {0} timed out during tick")]
    SensorTimeout(SensorId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ScalerError {
    /// Sensor this fault belongs to, if any.
    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            ScalerError::Window(WindowError::OutOfOrderSample { sensor_id, .. })
            | ScalerError::Window(WindowError::NonFiniteValue { sensor_id, .. })
            | ScalerError::InsufficientData { sensor_id, .. }
            | ScalerError::TelemetryUnavailable { sensor_id, .. }
            | ScalerError::LifecycleCommandFailed { sensor_id, .. }
            | ScalerError::SensorTimeout(sensor_id) => Some(sensor_id),
            ScalerError::Window(WindowError::SensorMismatch { expected, .. }) => Some(expected),
            ScalerError::Registry(RegistryError::InvalidTransition { sensor_id, .. })
            | ScalerError::Registry(RegistryError::AlreadyRegistered { sensor_id, .. }) => {
                Some(sensor_id)
            }
            ScalerError::Registry(RegistryError::NotFound(sensor_id)) => Some(sensor_id),
            ScalerError::Config(_) => None,
        }
    }
}
