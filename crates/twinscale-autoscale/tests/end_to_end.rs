//! Controller scenarios driven through in-memory collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use twinscale_autoscale::{
    AutoscalingController, BoxFuture, DecisionSink, LifecycleCommand, MemoryLifecycle,
    MemoryTelemetry, SkipReason, TelemetrySource,
};
use twinscale_core::{
    Classification, CollaboratorError, EpochMillis, LifecycleState, Sample, ScalerConfig,
    ScalerError, ScalingAction, ScalingDecision, SensorId, Verdict,
};

#[derive(Default, Clone)]
struct RecordingSink {
    decisions: Arc<Mutex<Vec<(ScalingDecision, Option<Verdict>)>>>,
}

impl RecordingSink {
    fn actions(&self, sensor_id: &str) -> Vec<ScalingAction> {
        self.decisions
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d.sensor_id == sensor_id)
            .map(|(d, _)| d.action)
            .collect()
    }
}

impl DecisionSink for RecordingSink {
    fn record<'a>(
        &'a self,
        decision: &'a ScalingDecision,
        verdict: Option<&'a Verdict>,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        self.decisions
            .lock()
            .unwrap()
            .push((decision.clone(), verdict.cloned()));
        Box::pin(async { Ok(()) })
    }
}

/// Telemetry that records how many fetches overlap.
#[derive(Clone)]
struct GaugedTelemetry {
    inner: MemoryTelemetry,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    hold: Duration,
}

impl GaugedTelemetry {
    fn new(inner: MemoryTelemetry, hold: Duration) -> Self {
        Self {
            inner,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            hold,
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl TelemetrySource for GaugedTelemetry {
    fn fetch_samples<'a>(
        &'a self,
        sensor_id: &'a str,
        since: Option<EpochMillis>,
    ) -> BoxFuture<'a, Result<Vec<Sample>, CollaboratorError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            let result = self.inner.fetch_samples(sensor_id, since).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<SensorId>, CollaboratorError>> {
        self.inner.discover()
    }
}

fn config() -> ScalerConfig {
    let mut config = ScalerConfig::default();
    config.window.min_samples = 10;
    config.window.max_samples = 120;
    config.window.stale_after = None;
    config.policy.k_steady = 3;
    config.policy.k_transient = 2;
    config.controller.tick_interval = "10ms".into();
    config.controller.worker_concurrency = 4;
    config.controller.max_command_failures = 3;
    config.controller.reconcile_every = 100;
    config
}

fn build(
    config: &ScalerConfig,
    telemetry: &MemoryTelemetry,
    lifecycle: &MemoryLifecycle,
) -> AutoscalingController {
    AutoscalingController::new(
        config,
        Arc::new(telemetry.clone()),
        Arc::new(lifecycle.clone()),
    )
    .unwrap()
}

/// `n` samples one second apart, alternating around `center`.
fn steady_samples(sensor_id: &str, n: u64, center: f64) -> Vec<Sample> {
    steady_samples_from(sensor_id, 1, n, center)
}

/// Like [`steady_samples`], starting at second `first`.
fn steady_samples_from(sensor_id: &str, first: u64, n: u64, center: f64) -> Vec<Sample> {
    (first..first + n)
        .map(|i| {
            let v = if i % 2 == 0 { center + 0.5 } else { center - 0.5 };
            Sample::new(sensor_id, i * 1_000, v)
        })
        .collect()
}

/// `n` samples one second apart on a steep ramp.
fn ramp_samples(sensor_id: &str, n: u64) -> Vec<Sample> {
    (1..=n)
        .map(|i| Sample::new(sensor_id, i * 1_000, 5.0 + 2.0 * i as f64))
        .collect()
}

async fn state(ctl: &AutoscalingController, id: &str) -> Option<LifecycleState> {
    ctl.registry().get(id).await.map(|r| r.state)
}

#[tokio::test]
async fn steady_sensor_is_scaled_down_after_confirmation() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let sink = RecordingSink::default();
    let mut ctl = build(&config(), &telemetry, &lifecycle).with_sink(Arc::new(sink.clone()));

    ctl.registry().register("s1", false, 0).await.unwrap();
    telemetry.extend(steady_samples("s1", 20, 10.0));

    // Tick 1: first steady verdict, instance created.
    let report = ctl.tick(21_000).await;
    let verdict = report.verdict_for("s1").unwrap();
    assert_eq!(verdict.classification, Classification::Steady);
    assert_eq!(report.decision_for("s1").unwrap().action, ScalingAction::Hold);
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));

    // Tick 2: still holding.
    let report = ctl.tick(22_000).await;
    assert_eq!(report.decision_for("s1").unwrap().action, ScalingAction::Hold);

    // Tick 3: third consecutive steady verdict. The destroy command fails
    // once, leaving the transition pending.
    lifecycle.fail_next("s1", 1);
    let report = ctl.tick(23_000).await;
    assert_eq!(report.decision_for("s1").unwrap().action, ScalingAction::ScaleDown);
    assert!(matches!(
        report.faults_for("s1").as_slice(),
        [ScalerError::LifecycleCommandFailed { command: "destroy", .. }]
    ));
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::PendingDestroy));
    assert!(lifecycle.is_active("s1"));

    // Tick 4: the retry is acknowledged.
    ctl.tick(24_000).await;
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Destroyed));
    assert!(!lifecycle.is_active("s1"));

    // Tombstone: no more decisions for s1 even though samples keep coming.
    telemetry.extend(steady_samples("s1", 30, 10.0).into_iter().skip(20));
    let report = ctl.tick(35_000).await;
    assert!(report.decision_for("s1").is_none());
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Destroyed));

    assert_eq!(
        sink.actions("s1"),
        vec![
            ScalingAction::Hold,
            ScalingAction::Hold,
            ScalingAction::ScaleDown,
            ScalingAction::Hold,
        ]
    );
    assert_eq!(
        lifecycle.commands(),
        vec![
            LifecycleCommand::Create("s1".into()),
            LifecycleCommand::Destroy("s1".into()),
            LifecycleCommand::Destroy("s1".into()),
        ]
    );
}

#[tokio::test]
async fn steady_discovered_sensor_is_never_created() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);
    telemetry.extend(steady_samples("calm", 20, 3.0));

    for t in 0..5 {
        let report = ctl.tick(21_000 + t * 1_000).await;
        assert_eq!(report.decision_for("calm").unwrap().action, ScalingAction::Hold);
    }
    let record = ctl.registry().get("calm").await.unwrap();
    assert!(record.provisional);
    assert_eq!(record.state, LifecycleState::PendingCreate);
    assert_eq!(record.consecutive_steady_count, 5);
    assert!(lifecycle.commands().is_empty());
}

#[tokio::test]
async fn insufficient_data_never_provisions() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);
    telemetry.extend(ramp_samples("s1", 3));

    let report = ctl.tick(4_000).await;
    assert_eq!(
        report.verdict_for("s1").unwrap().classification,
        Classification::InsufficientData
    );
    assert_eq!(report.decision_for("s1").unwrap().action, ScalingAction::Hold);
    assert!(lifecycle.commands().is_empty());
}

#[tokio::test]
async fn discovered_sensor_is_retired_once_settled() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut cfg = config();
    cfg.window.max_samples = 20;
    let mut ctl = build(&cfg, &telemetry, &lifecycle);
    telemetry.extend(ramp_samples("auto", 20));

    // Two transient verdicts earn the scale-up.
    let report = ctl.tick(21_000).await;
    assert_eq!(report.discovered, vec!["auto".to_string()]);
    assert_eq!(report.decision_for("auto").unwrap().action, ScalingAction::Hold);
    assert!(lifecycle.commands().is_empty());

    let report = ctl.tick(22_000).await;
    assert_eq!(report.decision_for("auto").unwrap().action, ScalingAction::ScaleUp);
    assert_eq!(state(&ctl, "auto").await, Some(LifecycleState::Active));
    assert!(ctl.registry().get("auto").await.unwrap().provisional);

    // The signal settles and fills the window with steady samples.
    telemetry.extend(steady_samples_from("auto", 21, 20, 3.0));
    ctl.tick(41_000).await;
    ctl.tick(42_000).await;
    let report = ctl.tick(43_000).await;
    assert_eq!(report.decision_for("auto").unwrap().action, ScalingAction::Retire);
    assert_eq!(state(&ctl, "auto").await, Some(LifecycleState::Destroyed));

    // Still reporting, but the tombstone keeps it from being re-created.
    telemetry.extend(steady_samples_from("auto", 41, 5, 3.0));
    let report = ctl.tick(46_000).await;
    assert!(report.discovered.is_empty());
    assert_eq!(
        lifecycle
            .commands()
            .iter()
            .filter(|c| matches!(c, LifecycleCommand::Create(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn transient_sensor_scales_up_and_stays_active() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);
    telemetry.extend(ramp_samples("ramp", 20));

    let mut actions = Vec::new();
    for t in 0..5 {
        let report = ctl.tick(21_000 + t * 1_000).await;
        let verdict = report.verdict_for("ramp").unwrap();
        assert_eq!(verdict.classification, Classification::Transient);
        actions.push(report.decision_for("ramp").unwrap().action);
        if t == 0 {
            assert_eq!(state(&ctl, "ramp").await, Some(LifecycleState::PendingCreate));
            assert!(lifecycle.commands().is_empty());
        }
    }
    use ScalingAction::{Hold, ScaleUp};
    assert_eq!(actions, vec![Hold, ScaleUp, Hold, Hold, Hold]);
    assert_eq!(lifecycle.commands(), vec![LifecycleCommand::Create("ramp".into())]);
    let record = ctl.registry().get("ramp").await.unwrap();
    assert_eq!(record.state, LifecycleState::Active);
    assert_eq!(record.consecutive_transient_count, 5);
    assert_eq!(record.consecutive_steady_count, 0);
}

#[tokio::test]
async fn telemetry_failure_is_isolated_and_backed_off() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);
    telemetry.extend(steady_samples("good", 20, 1.0));
    telemetry.extend(steady_samples("bad", 20, 1.0));
    telemetry.set_failing("bad", true);

    let report = ctl.tick(21_000).await;
    assert!(report.decision_for("good").is_some());
    assert!(report.decision_for("bad").is_none());
    assert!(matches!(
        report.faults_for("bad").as_slice(),
        [ScalerError::TelemetryUnavailable { .. }]
    ));

    // Second failure doubles the wait, so tick 3 skips the sensor.
    ctl.tick(22_000).await;
    let report = ctl.tick(23_000).await;
    assert!(report.skipped.contains(&("bad".to_string(), SkipReason::Backoff)));
    assert!(report.decision_for("good").is_some());

    // Recovery.
    telemetry.set_failing("bad", false);
    let report = ctl.tick(24_000).await;
    assert_eq!(
        report.verdict_for("bad").unwrap().classification,
        Classification::Steady
    );
}

#[tokio::test]
async fn out_of_order_samples_are_reported_not_fatal() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);

    let mut samples = steady_samples("s1", 20, 1.0);
    samples.swap(10, 11);
    telemetry.extend(samples);

    let report = ctl.tick(21_000).await;
    assert!(report.faults_for("s1").iter().any(|f| matches!(
        f,
        ScalerError::Window(twinscale_core::WindowError::OutOfOrderSample { .. })
    )));
    // The remaining 19 samples are still enough to judge.
    assert_eq!(report.verdict_for("s1").unwrap().sample_count, 19);
}

#[tokio::test]
async fn repeated_command_failures_degrade_sensor() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);
    ctl.registry().register("s1", false, 0).await.unwrap();
    telemetry.extend(steady_samples("s1", 20, 1.0));
    lifecycle.fail_next("s1", 100);

    for t in 0..3 {
        ctl.tick(21_000 + t * 1_000).await;
    }
    let record = ctl.registry().get("s1").await.unwrap();
    assert!(record.degraded);
    assert_eq!(record.state, LifecycleState::PendingCreate);
    assert_eq!(ctl.registry().degraded().await, vec!["s1".to_string()]);

    let report = ctl.tick(24_000).await;
    assert!(report.skipped.contains(&("s1".to_string(), SkipReason::Degraded)));
    assert_eq!(lifecycle.commands().len(), 3);

    // Operator clears the flag after fixing the backend.
    lifecycle.fail_next("s1", 0);
    ctl.registry().clear_degraded("s1").await.unwrap();
    ctl.tick(25_000).await;
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));
}

#[tokio::test]
async fn reconcile_adopts_orphans_and_repairs_drift() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut cfg = config();
    cfg.controller.reconcile_every = 1;
    let mut ctl = build(&cfg, &telemetry, &lifecycle);

    lifecycle.set_active("ghost", true);
    ctl.registry().register("s1", false, 0).await.unwrap();
    telemetry.extend(ramp_samples("s1", 20));

    let report = ctl.tick(21_000).await;
    let reconcile = report.reconcile.unwrap();
    assert_eq!(reconcile.adopted, vec!["ghost".to_string()]);
    assert_eq!(state(&ctl, "ghost").await, Some(LifecycleState::Active));
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));

    // The s1 instance disappears out of band.
    lifecycle.set_active("s1", false);
    let report = ctl.tick(22_000).await;
    assert_eq!(report.reconcile.unwrap().drifted, vec!["s1".to_string()]);
    // Drift sends it back to pending create; the same tick re-creates it.
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));
    assert!(lifecycle.is_active("s1"));
}

#[tokio::test]
async fn silent_sensor_is_retired() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut cfg = config();
    cfg.window.stale_after = Some("30s".into());
    let mut ctl = build(&cfg, &telemetry, &lifecycle);
    ctl.registry().register("s1", false, 0).await.unwrap();
    telemetry.extend(ramp_samples("s1", 20));

    ctl.tick(21_000).await;
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));

    // No new samples for well over stale_after.
    let report = ctl.tick(120_000).await;
    let decision = report.decision_for("s1").unwrap();
    assert_eq!(decision.action, ScalingAction::Retire);
    assert!(report.verdict_for("s1").is_none());
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Destroyed));
}

#[tokio::test]
async fn replayed_history_is_evaluated_not_retired() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut cfg = config();
    cfg.window.stale_after = Some("30s".into());
    let mut ctl = build(&cfg, &telemetry, &lifecycle);
    ctl.registry().register("s1", false, 0).await.unwrap();
    // Sample timestamps sit near the epoch while the clock is years later.
    telemetry.extend(ramp_samples("s1", 20));
    let now = 1_700_000_000_000;

    let report = ctl.tick(now).await;
    assert!(report.verdict_for("s1").is_some());
    assert_ne!(report.decision_for("s1").unwrap().action, ScalingAction::Retire);
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));

    let report = ctl.tick(now + 10_000).await;
    assert!(report.verdict_for("s1").is_some());
    assert_eq!(state(&ctl, "s1").await, Some(LifecycleState::Active));
}

#[tokio::test]
async fn slow_sensor_times_out_without_blocking_others() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut cfg = config();
    cfg.controller.sensor_timeout = "100ms".into();
    let mut ctl = build(&cfg, &telemetry, &lifecycle);
    telemetry.extend(steady_samples("fast", 20, 1.0));
    telemetry.extend(steady_samples("slow", 20, 1.0));
    telemetry.set_delay("slow", Some(Duration::from_secs(5)));

    let report = ctl.tick(21_000).await;
    assert!(report.decision_for("fast").is_some());
    assert_eq!(
        report.faults_for("slow"),
        vec![&ScalerError::SensorTimeout("slow".into())]
    );
    assert!(report.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn many_sensors_with_bounded_concurrency() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let gauged = GaugedTelemetry::new(telemetry.clone(), Duration::from_millis(20));
    let cfg = config();
    let mut ctl = AutoscalingController::new(
        &cfg,
        Arc::new(gauged.clone()),
        Arc::new(lifecycle.clone()),
    )
    .unwrap();
    for i in 0..50 {
        telemetry.extend(steady_samples(&format!("s{i:02}"), 20, i as f64));
    }

    let report = ctl.tick(21_000).await;
    assert_eq!(report.discovered.len(), 50);
    assert_eq!(report.decisions.len(), 50);
    // Steady from the start: nothing is provisioned.
    assert!(lifecycle.commands().is_empty());

    let peak = gauged.peak();
    assert!(peak >= 2, "fetches never overlapped (peak {peak})");
    assert!(
        peak <= cfg.controller.worker_concurrency,
        "peak {peak} exceeds worker_concurrency {}",
        cfg.controller.worker_concurrency
    );
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut ctl = build(&config(), &telemetry, &lifecycle);
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move {
        ctl.run(rx).await;
        ctl
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();

    let ctl = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
    assert!(ctl.ticks() >= 1);
}

#[tokio::test]
async fn shutdown_mid_tick_rolls_back_pending_work() {
    let telemetry = MemoryTelemetry::new();
    let lifecycle = MemoryLifecycle::new();
    let mut cfg = config();
    cfg.controller.shutdown_grace = "50ms".into();
    let mut ctl = build(&cfg, &telemetry, &lifecycle);
    let registry = ctl.registry();
    telemetry.extend(steady_samples("stuck", 20, 1.0));
    telemetry.set_delay("stuck", Some(Duration::from_secs(5)));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { ctl.run(rx).await });

    // Let the first tick discover the sensor and block on its fetch.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        registry.get("stuck").await.map(|r| r.state),
        Some(LifecycleState::PendingCreate)
    );
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("controller did not stop within grace")
        .unwrap();
    // The unconfirmed create was rolled back.
    assert!(registry.get("stuck").await.is_none());
    assert!(lifecycle.commands().is_empty());
}
