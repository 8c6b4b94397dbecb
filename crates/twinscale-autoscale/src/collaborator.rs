//! Seams to the outside world.
//!
//! The controller talks to three collaborators: a telemetry source that
//! yields samples, a lifecycle controller that creates and destroys the
//! actual virtual sensor instances, and an optional decision sink that
//! records every decision for audit. All three are object-safe traits
//! returning boxed futures so they can be swapped for in-memory doubles.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use twinscale_core::{CollaboratorError, EpochMillis, Sample, ScalingDecision, SensorId, Verdict};

/// Boxed future alias used by every collaborator method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of sensor samples (a time-series store, a file drop, a queue).
pub trait TelemetrySource: Send + Sync {
    /// Samples for `sensor_id` newer than `since`, oldest first. `None`
    /// asks for everything the source still retains.
    fn fetch_samples<'a>(
        &'a self,
        sensor_id: &'a str,
        since: Option<EpochMillis>,
    ) -> BoxFuture<'a, Result<Vec<Sample>, CollaboratorError>>;

    /// Sensors currently reporting. Sources that cannot enumerate return an
    /// empty list and rely on operator registration.
    fn discover(&self) -> BoxFuture<'_, Result<Vec<SensorId>, CollaboratorError>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Creates and destroys virtual sensor instances.
///
/// `Ok(())` is the acknowledgement; the registry only confirms a transition
/// after it.
pub trait LifecycleController: Send + Sync {
    fn create_sensor<'a>(&'a self, sensor_id: &'a str)
    -> BoxFuture<'a, Result<(), CollaboratorError>>;

    fn destroy_sensor<'a>(
        &'a self,
        sensor_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>>;

    /// Instances that currently exist, for reconciliation.
    fn list_active(&self) -> BoxFuture<'_, Result<HashSet<SensorId>, CollaboratorError>>;
}

/// Durable record of decisions. Failures are logged and never block the
/// decision itself.
pub trait DecisionSink: Send + Sync {
    fn record<'a>(
        &'a self,
        decision: &'a ScalingDecision,
        verdict: Option<&'a Verdict>,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>>;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── In-memory telemetry ───────────────────────────────────────────

#[derive(Debug, Default)]
struct TelemetryInner {
    samples: HashMap<SensorId, Vec<Sample>>,
    failing: HashSet<SensorId>,
    delays: HashMap<SensorId, Duration>,
}

/// Telemetry held in memory. Cloning shares the underlying store.
///
/// Used by tests and by replay tooling that feeds recorded samples through
/// the controller.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Order is preserved as given, so callers can inject
    /// out-of-order data.
    pub fn push(&self, sample: Sample) {
        lock(&self.inner)
            .samples
            .entry(sample.sensor_id.clone())
            .or_default()
            .push(sample);
    }

    pub fn extend(&self, samples: impl IntoIterator<Item = Sample>) {
        for sample in samples {
            self.push(sample);
        }
    }

    /// Make every fetch for `sensor_id` fail until cleared.
    pub fn set_failing(&self, sensor_id: &str, failing: bool) {
        let mut inner = lock(&self.inner);
        if failing {
            inner.failing.insert(sensor_id.to_string());
        } else {
            inner.failing.remove(sensor_id);
        }
    }

    /// Delay every fetch for `sensor_id` by `delay`.
    pub fn set_delay(&self, sensor_id: &str, delay: Option<Duration>) {
        let mut inner = lock(&self.inner);
        match delay {
            Some(d) => inner.delays.insert(sensor_id.to_string(), d),
            None => inner.delays.remove(sensor_id),
        };
    }
}

impl TelemetrySource for MemoryTelemetry {
    fn fetch_samples<'a>(
        &'a self,
        sensor_id: &'a str,
        since: Option<EpochMillis>,
    ) -> BoxFuture<'a, Result<Vec<Sample>, CollaboratorError>> {
        Box::pin(async move {
            let delay = lock(&self.inner).delays.get(sensor_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let inner = lock(&self.inner);
            if inner.failing.contains(sensor_id) {
                return Err(CollaboratorError::Unavailable(format!(
                    "no telemetry route for {sensor_id}"
                )));
            }
            let samples = inner
                .samples
                .get(sensor_id)
                .map(|all| {
                    all.iter()
                        .filter(|s| since.is_none_or(|since| s.timestamp_ms > since))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            Ok(samples)
        })
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<SensorId>, CollaboratorError>> {
        Box::pin(async move {
            let mut ids: Vec<SensorId> = lock(&self.inner).samples.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }
}

// ── In-memory lifecycle ───────────────────────────────────────────

/// A lifecycle command as received by [`MemoryLifecycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommand {
    Create(SensorId),
    Destroy(SensorId),
}

#[derive(Debug, Default)]
struct LifecycleInner {
    active: HashSet<SensorId>,
    /// Remaining injected failures per sensor.
    failures: HashMap<SensorId, u32>,
    list_unavailable: bool,
    commands: Vec<LifecycleCommand>,
}

/// Lifecycle controller that only tracks instances in memory.
///
/// Backs the daemon's dry-run mode and the controller tests. Cloning shares
/// state.
#[derive(Debug, Clone, Default)]
pub struct MemoryLifecycle {
    inner: Arc<Mutex<LifecycleInner>>,
}

impl MemoryLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commands for `sensor_id`.
    pub fn fail_next(&self, sensor_id: &str, count: u32) {
        lock(&self.inner)
            .failures
            .insert(sensor_id.to_string(), count);
    }

    /// Make `list_active` fail until cleared.
    pub fn set_list_unavailable(&self, unavailable: bool) {
        lock(&self.inner).list_unavailable = unavailable;
    }

    /// Pretend an instance exists (or vanished) without a command, as an
    /// out-of-band change would.
    pub fn set_active(&self, sensor_id: &str, active: bool) {
        let mut inner = lock(&self.inner);
        if active {
            inner.active.insert(sensor_id.to_string());
        } else {
            inner.active.remove(sensor_id);
        }
    }

    pub fn is_active(&self, sensor_id: &str) -> bool {
        lock(&self.inner).active.contains(sensor_id)
    }

    /// Every command received, including failed ones, in arrival order.
    pub fn commands(&self) -> Vec<LifecycleCommand> {
        lock(&self.inner).commands.clone()
    }

    fn execute(&self, command: LifecycleCommand) -> Result<(), CollaboratorError> {
        let mut inner = lock(&self.inner);
        inner.commands.push(command.clone());

        let id = match &command {
            LifecycleCommand::Create(id) | LifecycleCommand::Destroy(id) => id.clone(),
        };
        if let Some(remaining) = inner.failures.get_mut(&id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(CollaboratorError::Rejected(format!(
                "injected failure for {id}"
            )));
        }

        match command {
            LifecycleCommand::Create(id) => inner.active.insert(id),
            LifecycleCommand::Destroy(id) => inner.active.remove(&id),
        };
        Ok(())
    }
}

impl LifecycleController for MemoryLifecycle {
    fn create_sensor<'a>(
        &'a self,
        sensor_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        let result = self.execute(LifecycleCommand::Create(sensor_id.to_string()));
        Box::pin(async move { result })
    }

    fn destroy_sensor<'a>(
        &'a self,
        sensor_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        let result = self.execute(LifecycleCommand::Destroy(sensor_id.to_string()));
        Box::pin(async move { result })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<HashSet<SensorId>, CollaboratorError>> {
        let inner = lock(&self.inner);
        let result = if inner.list_unavailable {
            Err(CollaboratorError::Unavailable("lifecycle listing disabled".to_string()))
        } else {
            Ok(inner.active.clone())
        };
        Box::pin(async move { result })
    }
}
