//! Per-sensor sliding sample window.
//!
//! The buffer owns the retention policy (count and span bounds) and the
//! staleness policy for one sensor. Samples must arrive with strictly
//! advancing timestamps; anything else is dropped and reported back to the
//! caller without touching the window.
//!
//! Staleness is judged on the caller's clock: it runs from the last time a
//! fetch delivered accepted samples, never from the sample timestamps, so
//! replayed historical telemetry does not read as silent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use twinscale_core::config::WindowConfig;
use twinscale_core::{EpochMillis, Sample, SensorId, WindowError};

/// Retention, sufficiency and staleness bounds for a window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPolicy {
    pub max_samples: usize,
    pub max_span: Option<Duration>,
    pub min_samples: usize,
    pub min_span: Duration,
    pub stale_after: Option<Duration>,
}

impl WindowPolicy {
    pub fn from_config(config: &WindowConfig) -> Self {
        Self {
            max_samples: config.max_samples,
            max_span: config.max_span(),
            min_samples: config.min_samples,
            min_span: config.min_span(),
            stale_after: config.stale_after(),
        }
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::from_config(&WindowConfig::default())
    }
}

/// Outcome of pushing a batch of samples.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PushReport {
    pub accepted: usize,
    pub dropped: Vec<WindowError>,
    pub evicted: usize,
}

/// Immutable copy of a window at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    sensor_id: SensorId,
    samples: Arc<[Sample]>,
    min_samples: usize,
    min_span: Duration,
}

impl WindowSnapshot {
    /// Build a snapshot directly from samples (tests, replay tooling).
    ///
    /// Samples are expected in timestamp order.
    pub fn from_samples(
        sensor_id: impl Into<SensorId>,
        samples: Vec<Sample>,
        min_samples: usize,
        min_span: Duration,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            samples: samples.into(),
            min_samples,
            min_span,
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Milliseconds between the oldest and newest sample.
    pub fn span_ms(&self) -> u64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp_ms.saturating_sub(first.timestamp_ms),
            _ => 0,
        }
    }

    pub fn newest_timestamp(&self) -> Option<EpochMillis> {
        self.samples.last().map(|s| s.timestamp_ms)
    }

    /// Whether the snapshot holds enough samples and span to be evaluated.
    pub fn is_sufficient(&self) -> bool {
        self.samples.len() >= self.min_samples
            && self.span_ms() >= self.min_span.as_millis() as u64
    }
}

/// Bounded sliding window of recent samples for one sensor.
#[derive(Debug, Clone)]
pub struct SensorWindowBuffer {
    sensor_id: SensorId,
    policy: WindowPolicy,
    samples: VecDeque<Sample>,
    /// Last accepted timestamp. Survives eviction so monotonicity holds
    /// even after the window rolls over.
    last_timestamp_ms: Option<EpochMillis>,
    /// When the buffer was created; staleness is measured from here until
    /// the first delivery.
    created_at_ms: EpochMillis,
    /// Caller clock at the last delivery that added samples.
    last_received_ms: Option<EpochMillis>,
}

impl SensorWindowBuffer {
    pub fn new(sensor_id: impl Into<SensorId>, policy: WindowPolicy, created_at_ms: EpochMillis) -> Self {
        let capacity = policy.max_samples.min(1024);
        Self {
            sensor_id: sensor_id.into(),
            policy,
            samples: VecDeque::with_capacity(capacity),
            last_timestamp_ms: None,
            created_at_ms,
            last_received_ms: None,
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of the last accepted sample, used as the `since` cursor
    /// for the next telemetry pull.
    pub fn last_timestamp(&self) -> Option<EpochMillis> {
        self.last_timestamp_ms
    }

    /// Append one sample, evicting whatever falls outside retention.
    ///
    /// Returns the number of evicted samples. A rejected sample leaves the
    /// window untouched.
    pub fn push(&mut self, sample: Sample) -> Result<usize, WindowError> {
        if sample.sensor_id != self.sensor_id {
            return Err(WindowError::SensorMismatch {
                expected: self.sensor_id.clone(),
                got: sample.sensor_id,
            });
        }
        if !sample.value.is_finite() {
            return Err(WindowError::NonFiniteValue {
                sensor_id: sample.sensor_id,
                timestamp_ms: sample.timestamp_ms,
            });
        }
        if let Some(last) = self.last_timestamp_ms
            && sample.timestamp_ms <= last
        {
            return Err(WindowError::OutOfOrderSample {
                sensor_id: sample.sensor_id,
                timestamp_ms: sample.timestamp_ms,
                last_timestamp_ms: last,
            });
        }

        self.last_timestamp_ms = Some(sample.timestamp_ms);
        self.samples.push_back(sample);
        Ok(self.evict())
    }

    /// Push samples in order, collecting drops instead of stopping at the
    /// first rejected one.
    pub fn push_batch(&mut self, samples: impl IntoIterator<Item = Sample>) -> PushReport {
        let mut report = PushReport::default();
        for sample in samples {
            match self.push(sample) {
                Ok(evicted) => {
                    report.accepted += 1;
                    report.evicted += evicted;
                }
                Err(e) => {
                    trace!(sensor = %self.sensor_id, error = %e, "sample dropped");
                    report.dropped.push(e);
                }
            }
        }
        report
    }

    /// Drop samples beyond the count and span bounds.
    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.samples.len() > self.policy.max_samples {
            self.samples.pop_front();
            evicted += 1;
        }
        if let Some(max_span) = self.policy.max_span
            && let Some(newest) = self.samples.back().map(|s| s.timestamp_ms)
        {
            let max_span_ms = max_span.as_millis() as u64;
            while let Some(oldest) = self.samples.front()
                && newest.saturating_sub(oldest.timestamp_ms) > max_span_ms
            {
                self.samples.pop_front();
                evicted += 1;
            }
        }
        evicted
    }

    /// Copy the current window. Later pushes never affect the snapshot.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            sensor_id: self.sensor_id.clone(),
            samples: self.samples.iter().cloned().collect(),
            min_samples: self.policy.min_samples,
            min_span: self.policy.min_span,
        }
    }

    /// Milliseconds between the oldest and newest retained sample.
    pub fn span_ms(&self) -> u64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.timestamp_ms.saturating_sub(first.timestamp_ms),
            _ => 0,
        }
    }

    /// Whether the window holds enough samples and span to be evaluated.
    pub fn is_sufficient(&self) -> bool {
        self.samples.len() >= self.policy.min_samples
            && self.span_ms() >= self.policy.min_span.as_millis() as u64
    }

    /// Note that a delivery at `now_ms` added samples to the window.
    pub fn mark_received(&mut self, now_ms: EpochMillis) {
        self.last_received_ms = Some(now_ms);
    }

    pub fn last_received(&self) -> Option<EpochMillis> {
        self.last_received_ms
    }

    /// Whether no delivery has added samples for longer than `stale_after`.
    pub fn is_stale(&self, now_ms: EpochMillis) -> bool {
        let Some(stale_after) = self.policy.stale_after else {
            return false;
        };
        let last_seen = self.last_received_ms.unwrap_or(self.created_at_ms);
        now_ms.saturating_sub(last_seen) > stale_after.as_millis() as u64
    }

    /// Forget all samples and the monotonicity cursor.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_timestamp_ms = None;
    }
}
