//! Autoscaling controller — the periodic control loop.
//!
//! One tick:
//!
//! 1. Reconcile the registry against the lifecycle controller (first tick
//!    and every `reconcile_every` ticks).
//! 2. Discover sensors newly present in telemetry.
//! 3. Purge expired provisional tombstones.
//! 4. For every live, non-degraded sensor, concurrently (bounded by
//!    `worker_concurrency`): pull new samples, evaluate, decide, apply,
//!    record, and dispatch the lifecycle command the resulting state calls
//!    for. Sensors known only from telemetry are not created until the
//!    policy scales them up.
//!
//! A fault in one sensor never aborts the tick for the others. Each sensor
//! is processed under its own lock, so at most one task touches a given
//! sensor's window at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{debug, error, info, warn};

use twinscale_core::config::ControllerConfig;
use twinscale_core::{
    Classification, CollaboratorError, ConfigError, EpochMillis, LifecycleState, ScalerConfig,
    ScalerError, ScalingDecision, SensorId, SensorRecord, Verdict,
};
use twinscale_signal::{SensorWindowBuffer, SteadyStateDetector, WindowPolicy};

use crate::backoff::RetryBackoff;
use crate::collaborator::{DecisionSink, LifecycleController, TelemetrySource};
use crate::policy::ScalingPolicyEngine;
use crate::registry::VirtualSensorRegistry;

/// Why a sensor was not evaluated this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Lifecycle commands failed too often; waiting for an operator.
    Degraded,
    /// Telemetry failed recently; waiting out the backoff.
    Backoff,
    /// The record disappeared while the tick was running.
    Removed,
}

/// Result of comparing registry state with live instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `PendingCreate` records whose instance turned out to exist.
    pub confirmed_created: Vec<SensorId>,
    /// `PendingDestroy` records whose instance is already gone.
    pub confirmed_destroyed: Vec<SensorId>,
    /// `Active` records with no live instance, sent back to `PendingCreate`.
    pub drifted: Vec<SensorId>,
    /// Live instances the registry did not know, now tracked as `Active`.
    pub adopted: Vec<SensorId>,
    /// Live instances behind a tombstone; destroy was re-issued.
    pub orphaned: Vec<SensorId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.confirmed_created.is_empty()
            && self.confirmed_destroyed.is_empty()
            && self.drifted.is_empty()
            && self.adopted.is_empty()
            && self.orphaned.is_empty()
    }
}

/// Everything that happened in one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub decisions: Vec<ScalingDecision>,
    pub verdicts: Vec<Verdict>,
    /// Non-fatal per-sensor faults, in no particular order.
    pub faults: Vec<ScalerError>,
    pub skipped: Vec<(SensorId, SkipReason)>,
    pub discovered: Vec<SensorId>,
    pub purged: Vec<SensorId>,
    /// Sensors whose pending transition was undone after shutdown cut the
    /// tick short.
    pub rolled_back: Vec<SensorId>,
    pub reconcile: Option<ReconcileReport>,
    /// Shutdown arrived while sensors were still being processed.
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl TickReport {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn decision_for(&self, sensor_id: &str) -> Option<&ScalingDecision> {
        self.decisions.iter().find(|d| d.sensor_id == sensor_id)
    }

    pub fn verdict_for(&self, sensor_id: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.sensor_id == sensor_id)
    }

    pub fn faults_for(&self, sensor_id: &str) -> Vec<&ScalerError> {
        self.faults
            .iter()
            .filter(|f| f.sensor_id() == Some(sensor_id))
            .collect()
    }

    fn absorb(&mut self, outcome: SensorOutcome) {
        if let Some(reason) = outcome.skipped {
            self.skipped.push((outcome.sensor_id, reason));
        }
        self.decisions.extend(outcome.decision);
        self.verdicts.extend(outcome.verdict);
        self.faults.extend(outcome.faults);
    }

    fn log(&self) {
        info!(
            tick = self.tick,
            decisions = self.decisions.len(),
            faults = self.faults.len(),
            skipped = self.skipped.len(),
            discovered = self.discovered.len(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "tick complete"
        );
    }
}

/// What happened to one sensor during a tick.
#[derive(Debug)]
struct SensorOutcome {
    sensor_id: SensorId,
    decision: Option<ScalingDecision>,
    verdict: Option<Verdict>,
    faults: Vec<ScalerError>,
    skipped: Option<SkipReason>,
}

impl SensorOutcome {
    fn new(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            decision: None,
            verdict: None,
            faults: Vec::new(),
            skipped: None,
        }
    }

    fn skipped(sensor_id: &str, reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::new(sensor_id)
        }
    }
}

/// Controller-private per-sensor state.
struct SensorSlot {
    window: SensorWindowBuffer,
    backoff: RetryBackoff,
}

/// State shared with per-sensor tasks.
#[derive(Clone)]
struct Shared {
    config: ControllerConfig,
    window_policy: WindowPolicy,
    telemetry: Arc<dyn TelemetrySource>,
    lifecycle: Arc<dyn LifecycleController>,
    sink: Option<Arc<dyn DecisionSink>>,
    registry: Arc<VirtualSensorRegistry>,
    detector: SteadyStateDetector,
    policy: ScalingPolicyEngine,
    slots: Arc<Mutex<HashMap<SensorId, Arc<Mutex<SensorSlot>>>>>,
}

/// The control loop. Owns the windows, drives the registry.
pub struct AutoscalingController {
    shared: Arc<Shared>,
    ticks: u64,
}

impl AutoscalingController {
    /// Build a controller. Configuration is validated here so a bad config
    /// never reaches the loop.
    pub fn new(
        config: &ScalerConfig,
        telemetry: Arc<dyn TelemetrySource>,
        lifecycle: Arc<dyn LifecycleController>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config: config.controller.clone(),
                window_policy: WindowPolicy::from_config(&config.window),
                telemetry,
                lifecycle,
                sink: None,
                registry: Arc::new(VirtualSensorRegistry::new()),
                detector: SteadyStateDetector::new(config.detector.clone()),
                policy: ScalingPolicyEngine::new(&config.policy),
                slots: Arc::new(Mutex::new(HashMap::new())),
            }),
            ticks: 0,
        })
    }

    /// Record every applied decision to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn DecisionSink>) -> Self {
        self.shared_mut().sink = Some(sink);
        self
    }

    /// Use an existing registry, e.g. one an operator API also holds.
    pub fn with_registry(mut self, registry: Arc<VirtualSensorRegistry>) -> Self {
        self.shared_mut().registry = registry;
        self
    }

    fn shared_mut(&mut self) -> &mut Shared {
        Arc::make_mut(&mut self.shared)
    }

    pub fn registry(&self) -> Arc<VirtualSensorRegistry> {
        self.shared.registry.clone()
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run ticks every `tick_interval` until `shutdown` flips to `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.shared.config.tick_interval();
        info!(
            interval_ms = interval.as_millis() as u64,
            concurrency = self.shared.config.worker_concurrency,
            "autoscaling controller started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.tick_inner(epoch_millis(), Some(&mut shutdown)).await;
                    report.log();
                    if report.interrupted || *shutdown.borrow() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        info!(ticks = self.ticks, "autoscaling controller stopped");
    }

    /// Run one tick at wall-clock time `now`.
    pub async fn tick(&mut self, now: EpochMillis) -> TickReport {
        self.tick_inner(now, None).await
    }

    async fn tick_inner(
        &mut self,
        now: EpochMillis,
        shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> TickReport {
        self.ticks += 1;
        let tick = self.ticks;
        let started = Instant::now();
        let mut report = TickReport::new(tick);
        let shared = self.shared.clone();

        let reconcile_every = shared.config.reconcile_every.max(1);
        if tick == 1 || tick % reconcile_every == 0 {
            match self.reconcile(now).await {
                Ok(r) => report.reconcile = Some(r),
                Err(e) => warn!(error = %e, "reconciliation skipped"),
            }
        }

        report.discovered = shared.discover(now).await;
        report.purged = shared
            .registry
            .purge_expired(now, shared.config.tombstone_ttl())
            .await;
        if !report.purged.is_empty() {
            let mut slots = shared.slots.lock().await;
            for id in &report.purged {
                slots.remove(id);
            }
        }

        let semaphore = Arc::new(Semaphore::new(shared.config.worker_concurrency.max(1)));
        let sensor_timeout = shared.config.sensor_timeout();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<TaskId, SensorId> = HashMap::new();

        for record in shared.registry.list().await {
            if record.state == LifecycleState::Destroyed {
                continue;
            }
            if record.degraded {
                report.skipped.push((record.sensor_id, SkipReason::Degraded));
                continue;
            }

            let sensor_id = record.sensor_id.clone();
            let task_shared = shared.clone();
            let semaphore = semaphore.clone();
            let handle = tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return SensorOutcome::skipped(&sensor_id, SkipReason::Removed);
                };
                match tokio::time::timeout(
                    sensor_timeout,
                    task_shared.process_sensor(&sensor_id, tick, now),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(sensor = %sensor_id, "sensor processing timed out");
                        let mut outcome = SensorOutcome::new(&sensor_id);
                        outcome.faults.push(ScalerError::SensorTimeout(sensor_id.clone()));
                        outcome
                    }
                }
            });
            in_flight.insert(handle.id(), record.sensor_id);
        }

        let drained = match shutdown {
            Some(rx) => {
                tokio::select! {
                    _ = collect(&mut tasks, &mut in_flight, &mut report) => true,
                    _ = rx.changed() => false,
                }
            }
            None => {
                collect(&mut tasks, &mut in_flight, &mut report).await;
                true
            }
        };

        if !drained {
            report.interrupted = true;
            let grace = shared.config.shutdown_grace();
            info!(
                in_flight = in_flight.len(),
                grace_ms = grace.as_millis() as u64,
                "shutdown requested; waiting for in-flight sensors"
            );
            let finished =
                tokio::time::timeout(grace, collect(&mut tasks, &mut in_flight, &mut report)).await;
            if finished.is_err() {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                let mut pending: Vec<SensorId> = in_flight.drain().map(|(_, id)| id).collect();
                pending.sort();
                for id in pending {
                    match shared.registry.rollback(&id, now).await {
                        Ok(_) => report.rolled_back.push(id),
                        Err(e) => debug!(sensor = %id, error = %e, "nothing to roll back"),
                    }
                }
                warn!(
                    rolled_back = report.rolled_back.len(),
                    "aborted in-flight sensors after shutdown grace"
                );
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    /// Compare the registry with the instances that actually exist and
    /// repair the difference.
    pub async fn reconcile(&self, now: EpochMillis) -> Result<ReconcileReport, CollaboratorError> {
        let shared = &self.shared;
        let timeout = shared.config.command_timeout();
        let live = tokio::time::timeout(timeout, shared.lifecycle.list_active())
            .await
            .map_err(|_| CollaboratorError::Timeout(timeout))??;

        let mut report = ReconcileReport::default();
        let records = shared.registry.list().await;

        for record in &records {
            let id = record.sensor_id.as_str();
            let exists = live.contains(id);
            let result = match (record.state, exists) {
                (LifecycleState::PendingCreate, true) => shared
                    .registry
                    .confirm_created(id, now)
                    .await
                    .map(|_| report.confirmed_created.push(id.to_string())),
                (LifecycleState::PendingDestroy, false) => {
                    let r = shared
                        .registry
                        .confirm_destroyed(id, now)
                        .await
                        .map(|_| report.confirmed_destroyed.push(id.to_string()));
                    shared.drop_slot(id).await;
                    r
                }
                (LifecycleState::Active, false) => shared
                    .registry
                    .mark_drifted(id, now)
                    .await
                    .map(|_| report.drifted.push(id.to_string())),
                (LifecycleState::Destroyed, true) => {
                    warn!(sensor = %id, "instance still running behind tombstone; re-issuing destroy");
                    if let Err(e) = shared.destroy_command(id).await {
                        warn!(sensor = %id, error = %e, "orphan destroy failed");
                    }
                    report.orphaned.push(id.to_string());
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(sensor = %id, error = %e, "reconcile step failed");
            }
        }

        let mut unknown: Vec<&SensorId> = live
            .iter()
            .filter(|id| !records.iter().any(|r| &r.sensor_id == *id))
            .collect();
        unknown.sort();
        for id in unknown {
            match shared.registry.adopt(id, now).await {
                Ok(_) => report.adopted.push(id.clone()),
                Err(e) => warn!(sensor = %id, error = %e, "adopt failed"),
            }
        }

        if report.is_clean() {
            debug!(live = live.len(), "registry in sync");
        } else {
            info!(
                confirmed_created = report.confirmed_created.len(),
                confirmed_destroyed = report.confirmed_destroyed.len(),
                drifted = report.drifted.len(),
                adopted = report.adopted.len(),
                orphaned = report.orphaned.len(),
                "reconciled registry with live instances"
            );
        }
        Ok(report)
    }
}

/// Drain finished tasks into `report`. Cancel-safe: progress made before a
/// cancellation is already recorded.
async fn collect(
    tasks: &mut JoinSet<SensorOutcome>,
    in_flight: &mut HashMap<TaskId, SensorId>,
    report: &mut TickReport,
) {
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, outcome)) => {
                in_flight.remove(&id);
                report.absorb(outcome);
            }
            Err(e) => {
                let sensor = in_flight.remove(&e.id()).unwrap_or_default();
                error!(sensor = %sensor, error = %e, "sensor task failed");
            }
        }
    }
}

impl Shared {
    async fn slot(&self, sensor_id: &str, now: EpochMillis) -> Arc<Mutex<SensorSlot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(sensor_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SensorSlot {
                    window: SensorWindowBuffer::new(sensor_id, self.window_policy.clone(), now),
                    backoff: RetryBackoff::new(self.config.max_backoff_ticks),
                }))
            })
            .clone()
    }

    async fn drop_slot(&self, sensor_id: &str) {
        self.slots.lock().await.remove(sensor_id);
    }

    async fn discover(&self, now: EpochMillis) -> Vec<SensorId> {
        let timeout = self.config.fetch_timeout();
        let ids = match tokio::time::timeout(timeout, self.telemetry.discover()).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                warn!(error = %e, "sensor discovery failed");
                return Vec::new();
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "sensor discovery timed out");
                return Vec::new();
            }
        };

        let mut discovered = Vec::new();
        for id in ids {
            if self.registry.observe(&id, now).await.is_some() {
                info!(sensor = %id, "new sensor in telemetry");
                discovered.push(id);
            }
        }
        discovered
    }

    async fn process_sensor(&self, sensor_id: &str, tick: u64, now: EpochMillis) -> SensorOutcome {
        let slot = self.slot(sensor_id, now).await;
        let mut slot = slot.lock().await;
        let mut outcome = SensorOutcome::new(sensor_id);

        if !slot.backoff.should_attempt(tick) {
            outcome.skipped = Some(SkipReason::Backoff);
            return outcome;
        }

        // Pull.
        let since = slot.window.last_timestamp();
        let timeout = self.config.fetch_timeout();
        let fetched = match tokio::time::timeout(
            timeout,
            self.telemetry.fetch_samples(sensor_id, since),
        )
        .await
        {
            Ok(Ok(samples)) => Ok(samples),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CollaboratorError::Timeout(timeout)),
        };
        let samples = match fetched {
            Ok(samples) => {
                slot.backoff.record_success();
                samples
            }
            Err(source) => {
                let delay = slot.backoff.record_failure(tick);
                warn!(
                    sensor = %sensor_id,
                    error = %source,
                    retry_in_ticks = delay,
                    "telemetry unavailable"
                );
                outcome.faults.push(ScalerError::TelemetryUnavailable {
                    sensor_id: sensor_id.to_string(),
                    source,
                });
                return outcome;
            }
        };

        let pushed = slot.window.push_batch(samples);
        if pushed.accepted > 0 {
            slot.window.mark_received(now);
        }
        if !pushed.dropped.is_empty() {
            warn!(
                sensor = %sensor_id,
                dropped = pushed.dropped.len(),
                accepted = pushed.accepted,
                "samples rejected by window"
            );
        }
        outcome
            .faults
            .extend(pushed.dropped.into_iter().map(ScalerError::Window));

        // Evaluate and decide.
        let Some(record) = self.registry.get(sensor_id).await else {
            outcome.skipped = Some(SkipReason::Removed);
            return outcome;
        };
        let (decision, verdict) = if slot.window.is_stale(now) {
            debug!(sensor = %sensor_id, "telemetry stale");
            (self.policy.decide_stale(&record, now), None)
        } else {
            let verdict = self.detector.evaluate(&slot.window.snapshot());
            if verdict.classification == Classification::InsufficientData {
                outcome.faults.push(ScalerError::InsufficientData {
                    sensor_id: sensor_id.to_string(),
                    have: verdict.sample_count,
                    need: self.window_policy.min_samples,
                });
            }
            (self.policy.decide(&record, &verdict, now), Some(verdict))
        };

        // Apply.
        let applied = match self.registry.apply(&decision).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(sensor = %sensor_id, action = %decision.action, error = %e, "decision rejected");
                outcome.faults.push(e.into());
                outcome.decision = Some(decision);
                outcome.verdict = verdict;
                return outcome;
            }
        };

        if let Some(sink) = &self.sink
            && let Err(e) = sink.record(&decision, verdict.as_ref()).await
        {
            warn!(sensor = %sensor_id, error = %e, "decision not recorded");
        }

        // Dispatch.
        let state = self.dispatch(&applied, now, &mut outcome).await;
        if state == LifecycleState::Destroyed {
            slot.window.clear();
            drop(slot);
            self.drop_slot(sensor_id).await;
        }

        outcome.decision = Some(decision);
        outcome.verdict = verdict;
        outcome
    }

    /// Issue the command a pending state calls for and confirm on ack.
    /// `PendingCreate` only calls for a create once one was requested.
    /// Returns the state the record ends up in.
    async fn dispatch(
        &self,
        record: &SensorRecord,
        now: EpochMillis,
        outcome: &mut SensorOutcome,
    ) -> LifecycleState {
        let id = record.sensor_id.as_str();
        let (command, result) = match record.state {
            LifecycleState::PendingCreate if record.create_requested => {
                ("create", self.create_command(id).await)
            }
            LifecycleState::PendingDestroy => ("destroy", self.destroy_command(id).await),
            state => return state,
        };

        if let Err(source) = result {
            warn!(sensor = %id, command, error = %source, "lifecycle command failed");
            if let Err(e) = self
                .registry
                .record_command_failure(id, self.config.max_command_failures)
                .await
            {
                debug!(sensor = %id, error = %e, "failure not recorded");
            }
            outcome.faults.push(ScalerError::LifecycleCommandFailed {
                sensor_id: id.to_string(),
                command,
                source,
            });
            return record.state;
        }

        let confirmed = match record.state {
            LifecycleState::PendingCreate => self.registry.confirm_created(id, now).await,
            _ => self.registry.confirm_destroyed(id, now).await,
        };
        match confirmed {
            Ok(r) => r.state,
            Err(e) => {
                outcome.faults.push(e.into());
                record.state
            }
        }
    }

    async fn create_command(&self, sensor_id: &str) -> Result<(), CollaboratorError> {
        let timeout = self.config.command_timeout();
        tokio::time::timeout(timeout, self.lifecycle.create_sensor(sensor_id))
            .await
            .map_err(|_| CollaboratorError::Timeout(timeout))?
    }

    async fn destroy_command(&self, sensor_id: &str) -> Result<(), CollaboratorError> {
        let timeout = self.config.command_timeout();
        tokio::time::timeout(timeout, self.lifecycle.destroy_sensor(sensor_id))
            .await
            .map_err(|_| CollaboratorError::Timeout(timeout))?
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> EpochMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
