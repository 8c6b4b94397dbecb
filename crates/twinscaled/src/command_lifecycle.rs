//! Lifecycle commands carried out by external programs.
//!
//! Each operation runs a configured argv with `{sensor_id}` replaced by the
//! sensor's id. Exit status 0 acknowledges the command; any other status is
//! a rejection carrying the program's stderr. `list` prints one live sensor
//! id per line on stdout.

use std::collections::HashSet;
use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use twinscale_autoscale::{BoxFuture, LifecycleController};
use twinscale_core::{CollaboratorError, SensorId};

use crate::settings::LifecycleSettings;

const PLACEHOLDER: &str = "{sensor_id}";

#[derive(Debug, Clone)]
pub struct CommandLifecycle {
    create: Vec<String>,
    destroy: Vec<String>,
    list: Vec<String>,
}

impl CommandLifecycle {
    pub fn new(settings: &LifecycleSettings) -> anyhow::Result<Self> {
        for (field, argv) in [
            ("create", &settings.create),
            ("destroy", &settings.destroy),
            ("list", &settings.list),
        ] {
            if argv.is_empty() {
                anyhow::bail!("lifecycle.{field} must name a program");
            }
        }
        Ok(Self {
            create: settings.create.clone(),
            destroy: settings.destroy.clone(),
            list: settings.list.clone(),
        })
    }

    async fn run(&self, argv: &[String], sensor_id: Option<&str>) -> Result<Output, CollaboratorError> {
        let args: Vec<String> = argv
            .iter()
            .map(|arg| match sensor_id {
                Some(id) => arg.replace(PLACEHOLDER, id),
                None => arg.clone(),
            })
            .collect();
        let Some((program, rest)) = args.split_first() else {
            return Err(CollaboratorError::Unavailable("empty command".to_string()));
        };

        debug!(%program, args = ?rest, "running lifecycle command");
        let output = Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("spawning {program}: {e}")))?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CollaboratorError::Rejected(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

impl LifecycleController for CommandLifecycle {
    fn create_sensor<'a>(&'a self, sensor_id: &'a str) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        Box::pin(async move {
            self.run(&self.create, Some(sensor_id)).await?;
            Ok(())
        })
    }

    fn destroy_sensor<'a>(
        &'a self,
        sensor_id: &'a str,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        Box::pin(async move {
            self.run(&self.destroy, Some(sensor_id)).await?;
            Ok(())
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<HashSet<SensorId>, CollaboratorError>> {
        Box::pin(async move {
            let output = self.run(&self.list, None).await?;
            Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
        })
    }
}

fn parse_listing(stdout: &str) -> HashSet<SensorId> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
