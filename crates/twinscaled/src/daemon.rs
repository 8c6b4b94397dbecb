//! Wiring of settings into a ready-to-run controller.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use twinscale_autoscale::{AutoscalingController, LifecycleController, MemoryLifecycle};
use twinscale_core::EpochMillis;
use twinscale_state::DecisionLog;

use crate::command_lifecycle::CommandLifecycle;
use crate::dir_source::DirectoryTelemetry;
use crate::settings::{LifecycleMode, Settings};

pub struct Daemon {
    pub controller: AutoscalingController,
    pub log: Option<DecisionLog>,
}

/// Build the controller and its collaborators, then register the
/// operator's sensors.
pub async fn build(settings: &Settings, now: EpochMillis) -> anyhow::Result<Daemon> {
    let telemetry = DirectoryTelemetry::new(
        &settings.daemon.telemetry.data_dir,
        &settings.daemon.telemetry.file_pattern,
    )?;
    info!(dir = %telemetry.root().display(), "telemetry directory");

    let lifecycle: Arc<dyn LifecycleController> = match settings.daemon.lifecycle.mode {
        LifecycleMode::DryRun => {
            info!("dry run: lifecycle commands are recorded in memory only");
            Arc::new(MemoryLifecycle::new())
        }
        LifecycleMode::Command => Arc::new(CommandLifecycle::new(&settings.daemon.lifecycle)?),
    };

    let mut controller =
        AutoscalingController::new(&settings.scaler, Arc::new(telemetry), lifecycle)?;

    let log = match &settings.daemon.state.path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let log = DecisionLog::open(path)?.with_retention(settings.daemon.state.keep_per_sensor);
            info!(
                path = %path.display(),
                entries = log.count()?,
                keep_per_sensor = log.retention(),
                "decision log opened"
            );
            controller = controller.with_sink(Arc::new(log.clone()));
            Some(log)
        }
        None => None,
    };

    let registry = controller.registry();
    for sensor_id in &settings.daemon.sensors {
        match registry.register(sensor_id, false, now).await {
            Ok(_) => info!(sensor = %sensor_id, "sensor registered"),
            Err(e) => warn!(sensor = %sensor_id, error = %e, "sensor not registered"),
        }
    }

    Ok(Daemon { controller, log })
}
