//! Daemon-only sections of `twinscale.toml`.
//!
//! The control loop's own keys (`[window]`, `[detector]`, `[policy]`,
//! `[controller]`) are parsed by [`ScalerConfig`]; this module reads the
//! sections only the daemon cares about from the same file.
//!
//! ```toml
//! sensors = ["pump-1", "pump-2"]
//!
//! [telemetry]
//! data_dir = "/var/lib/twinscale/telemetry"
//!
//! [lifecycle]
//! mode = "command"
//! create = ["/usr/local/bin/sensorctl", "create", "{sensor_id}"]
//! destroy = ["/usr/local/bin/sensorctl", "destroy", "{sensor_id}"]
//! list = ["/usr/local/bin/sensorctl", "list"]
//!
//! [state]
//! path = "/var/lib/twinscale/decisions.redb"
//! keep_per_sensor = 1000
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use twinscale_core::ScalerConfig;

/// Default file-name pattern: `<stem>_<sensor id>.<jsonl|csv>`.
pub const DEFAULT_FILE_PATTERN: &str = r"^(?P<stem>.+)_(?P<id>[A-Za-z0-9][A-Za-z0-9.-]*)\.(?P<ext>jsonl|csv)$";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Operator-registered sensors. Sensors seen only in telemetry are
    /// tracked as provisional.
    pub sensors: Vec<String>,
    pub telemetry: TelemetrySettings,
    pub lifecycle: LifecycleSettings,
    pub state: StateSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Directory scanned (recursively) for sample files.
    pub data_dir: PathBuf,
    /// Regex with an `id` capture group applied to file names.
    pub file_pattern: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("telemetry"),
            file_pattern: DEFAULT_FILE_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    /// Track instances in memory only; nothing outside the process changes.
    #[default]
    DryRun,
    /// Run external programs for create/destroy/list.
    Command,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub mode: LifecycleMode,
    /// argv for creating an instance; `{sensor_id}` is substituted.
    pub create: Vec<String>,
    /// argv for destroying an instance; `{sensor_id}` is substituted.
    pub destroy: Vec<String>,
    /// argv printing one live sensor id per line.
    pub list: Vec<String>,
}

/// Decisions kept per sensor unless `state.keep_per_sensor` says otherwise.
pub const DEFAULT_KEEP_PER_SENSOR: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// Decision log location. No log is kept if unset.
    pub path: Option<PathBuf>,
    /// Most recent decisions kept per sensor; 0 keeps them all.
    pub keep_per_sensor: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            path: None,
            keep_per_sensor: DEFAULT_KEEP_PER_SENSOR,
        }
    }
}

/// Everything read from one `twinscale.toml`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub scaler: ScalerConfig,
    pub daemon: DaemonSettings,
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scaler = ScalerConfig::from_toml_str(content)?;
        let daemon: DaemonSettings = toml::from_str(content)?;
        let settings = Self { scaler, daemon };
        settings.validate()?;
        Ok(settings)
    }

    /// Daemon-level checks on top of [`ScalerConfig::validate`].
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scaler.validate()?;
        regex::Regex::new(&self.daemon.telemetry.file_pattern)
            .context("telemetry.file_pattern is not a valid regex")?;
        let lc = &self.daemon.lifecycle;
        if lc.mode == LifecycleMode::Command {
            for (field, argv) in [
                ("lifecycle.create", &lc.create),
                ("lifecycle.destroy", &lc.destroy),
                ("lifecycle.list", &lc.list),
            ] {
                if argv.is_empty() {
                    bail!("{field} is required when lifecycle.mode = \"command\"");
                }
            }
        }
        Ok(())
    }

    /// Render the effective configuration as one TOML document.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        let mut out = toml::to_string_pretty(&self.daemon)?;
        out.push('\n');
        out.push_str(&self.scaler.to_toml_string()?);
        Ok(out)
    }
}
