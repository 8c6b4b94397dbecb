//! Telemetry read from sample files under a directory.
//!
//! Every file whose name matches the configured pattern belongs to the
//! sensor captured by the pattern's `id` group, e.g. `pump_17.csv` or
//! `run-4/pressure_p2.jsonl`. Several files may feed the same sensor; their
//! samples are merged and sorted by timestamp.
//!
//! Formats:
//!
//! - `.jsonl`: one `{"timestamp_ms": 1700000000000, "value": 3.2}` per line.
//! - `.csv`: `timestamp_ms,value` per line; a non-numeric first line is
//!   treated as a header.
//!
//! Malformed lines are skipped and counted in a warning.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use twinscale_autoscale::{BoxFuture, TelemetrySource};
use twinscale_core::{CollaboratorError, EpochMillis, Sample, SensorId};

#[derive(Debug, Deserialize)]
struct Row {
    timestamp_ms: EpochMillis,
    value: f64,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    pattern: Regex,
}

/// File-backed [`TelemetrySource`]. Cloning shares configuration.
#[derive(Debug, Clone)]
pub struct DirectoryTelemetry {
    inner: Arc<Inner>,
}

impl DirectoryTelemetry {
    pub fn new(root: impl Into<PathBuf>, pattern: &str) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().any(|n| n == Some("id")) {
            anyhow::bail!("file pattern must have an `id` capture group");
        }
        Ok(Self {
            inner: Arc::new(Inner {
                root: root.into(),
                pattern,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CollaboratorError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, CollaboratorError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("telemetry scan panicked: {e}")))?
    }
}

impl Inner {
    /// `(sensor id, path)` for every matching file, sorted by path.
    fn scan(&self) -> Result<Vec<(SensorId, PathBuf)>, CollaboratorError> {
        if !self.root.is_dir() {
            return Err(CollaboratorError::Unavailable(format!(
                "telemetry directory {} does not exist",
                self.root.display()
            )));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable telemetry path");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if let Some(caps) = self.pattern.captures(name)
                && let Some(id) = caps.name("id")
            {
                files.push((id.as_str().to_string(), entry.path().to_path_buf()));
            }
        }
        Ok(files)
    }

    fn read_sensor(
        &self,
        sensor_id: &str,
        since: Option<EpochMillis>,
    ) -> Result<Vec<Sample>, CollaboratorError> {
        let mut samples = Vec::new();
        for (id, path) in self.scan()? {
            if id != sensor_id {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| {
                CollaboratorError::Unavailable(format!("reading {}: {e}", path.display()))
            })?;
            let parsed = match path.extension().and_then(|e| e.to_str()) {
                Some("csv") => parse_csv(sensor_id, &content),
                _ => parse_jsonl(sensor_id, &content),
            };
            if parsed.malformed > 0 {
                warn!(
                    path = %path.display(),
                    malformed = parsed.malformed,
                    "skipped malformed telemetry lines"
                );
            }
            samples.extend(parsed.samples);
        }

        samples.retain(|s| since.is_none_or(|since| s.timestamp_ms > since));
        samples.sort_by_key(|s| s.timestamp_ms);
        debug!(sensor = %sensor_id, count = samples.len(), ?since, "telemetry read");
        Ok(samples)
    }
}

impl TelemetrySource for DirectoryTelemetry {
    fn fetch_samples<'a>(
        &'a self,
        sensor_id: &'a str,
        since: Option<EpochMillis>,
    ) -> BoxFuture<'a, Result<Vec<Sample>, CollaboratorError>> {
        let sensor_id = sensor_id.to_string();
        Box::pin(self.blocking(move |inner| inner.read_sensor(&sensor_id, since)))
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<SensorId>, CollaboratorError>> {
        Box::pin(self.blocking(|inner| {
            let ids: BTreeSet<SensorId> = inner.scan()?.into_iter().map(|(id, _)| id).collect();
            Ok(ids.into_iter().collect())
        }))
    }
}

#[derive(Debug, Default)]
struct Parsed {
    samples: Vec<Sample>,
    malformed: usize,
}

fn parse_jsonl(sensor_id: &str, content: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Row>(line) {
            Ok(row) => parsed
                .samples
                .push(Sample::new(sensor_id, row.timestamp_ms, row.value)),
            Err(_) => parsed.malformed += 1,
        }
    }
    parsed
}

fn parse_csv(sensor_id: &str, content: &str) -> Parsed {
    let mut parsed = Parsed::default();
    let lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    for (i, line) in lines.enumerate() {
        let mut fields = line.split(',').map(str::trim);
        let ts = fields.next().and_then(|f| f.parse::<EpochMillis>().ok());
        let value = fields.next().and_then(|f| f.parse::<f64>().ok());
        match (ts, value) {
            (Some(ts), Some(value)) => parsed.samples.push(Sample::new(sensor_id, ts, value)),
            // Header row.
            _ if i == 0 => {}
            _ => parsed.malformed += 1,
        }
    }
    parsed
}
