//! twinscale-autoscale — steady-state-driven virtual sensor scaling.
//!
//! Each tick the controller pulls new samples for every tracked sensor,
//! asks the detector for a verdict, turns the verdict into a decision with
//! hysteresis, applies it to the registry, and dispatches the lifecycle
//! command the new state calls for.
//!
//! # Policy
//!
//! ```text
//! STEADY     steady_streak += 1, transient_streak = 0
//!            steady_streak >= k_steady and ACTIVE  -> SCALE_DOWN (RETIRE if provisional)
//! TRANSIENT  transient_streak += 1, steady_streak = 0
//!            transient_streak >= k_transient and not yet ACTIVE -> SCALE_UP
//! otherwise  HOLD
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! (absent) --SCALE_UP--> PENDING_CREATE --create acked--> ACTIVE
//! ACTIVE --SCALE_DOWN/RETIRE--> PENDING_DESTROY --destroy acked--> DESTROYED
//! ```
//!
//! `DESTROYED` is terminal for the control loop. The record stays behind as
//! a tombstone so a sensor that keeps reporting is not re-created on the
//! next tick.

pub mod backoff;
pub mod collaborator;
pub mod controller;
pub mod policy;
pub mod registry;

pub use backoff::RetryBackoff;
pub use collaborator::{
    BoxFuture, DecisionSink, LifecycleCommand, LifecycleController, MemoryLifecycle,
    MemoryTelemetry, TelemetrySource,
};
pub use controller::{AutoscalingController, ReconcileReport, SkipReason, TickReport};
pub use policy::ScalingPolicyEngine;
pub use registry::VirtualSensorRegistry;
