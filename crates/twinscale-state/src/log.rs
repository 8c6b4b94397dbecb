//! DecisionLog — redb-backed history of scaling decisions.
//!
//! Append-only from the controller's point of view. Values are
//! JSON-serialized [`DecisionEntry`]s. The log supports both on-disk and
//! in-memory backends (the latter for tests and dry runs).
//!
//! With a retention cap set, each append drops that sensor's oldest
//! entries beyond the cap in the same write transaction. The next sequence
//! number is stored alongside the entries so opening never scans them.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use tracing::debug;

use twinscale_autoscale::{BoxFuture, DecisionSink};
use twinscale_core::{CollaboratorError, ScalingDecision, Verdict};

use crate::error::{StateError, StateResult};
use crate::tables::{DECISIONS, META, NEXT_SEQ, decision_key, sensor_range};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// One stored decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub decision: ScalingDecision,
    /// Absent for decisions taken without a verdict (stale telemetry).
    pub verdict: Option<Verdict>,
}

/// Thread-safe decision log backed by redb.
#[derive(Clone)]
pub struct DecisionLog {
    db: Arc<Database>,
    /// Disambiguates entries for the same sensor and millisecond.
    seq: Arc<AtomicU64>,
    /// Entries kept per sensor; 0 keeps everything.
    keep_per_sensor: usize,
}

impl DecisionLog {
    /// Open (or create) a persistent log at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let log = Self::from_database(db)?;
        debug!(?path, "decision log opened");
        Ok(log)
    }

    /// Create an ephemeral in-memory log.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let log = Self::from_database(db)?;
        debug!("in-memory decision log opened");
        Ok(log)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let log = Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU64::new(0)),
            keep_per_sensor: 0,
        };
        log.ensure_tables()?;
        // Continue numbering after whatever an earlier process wrote.
        log.seq.store(log.stored_next_seq()?, Ordering::Relaxed);
        Ok(log)
    }

    /// Keep at most `keep` entries per sensor, dropping the oldest first.
    /// Zero disables the cap.
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.keep_per_sensor = keep;
        self
    }

    pub fn retention(&self) -> usize {
        self.keep_per_sensor
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn stored_next_seq(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let next = meta.get(NEXT_SEQ).map_err(map_err!(Read))?;
        Ok(next.map(|v| v.value()).unwrap_or(0))
    }

    /// Append a decision and the verdict behind it.
    pub fn append(&self, decision: &ScalingDecision, verdict: Option<&Verdict>) -> StateResult<()> {
        let entry = DecisionEntry {
            decision: decision.clone(),
            verdict: verdict.cloned(),
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = decision_key(&decision.sensor_id, decision.decided_at, seq);
        let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let pruned = {
            let mut table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut expired = Vec::new();
            if self.keep_per_sensor > 0 {
                let (start, end) = sensor_range(&decision.sensor_id);
                let keys: Vec<String> = table
                    .range(start.as_str()..end.as_str())
                    .map_err(map_err!(Read))?
                    .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                    .collect::<Result<_, _>>()
                    .map_err(map_err!(Read))?;
                let excess = keys.len().saturating_sub(self.keep_per_sensor);
                expired.extend(keys.into_iter().take(excess));
            }
            for old in &expired {
                table.remove(old.as_str()).map_err(map_err!(Write))?;
            }
            expired.len()
        };
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            // Concurrent appends may commit out of sequence order.
            let stored = meta
                .get(NEXT_SEQ)
                .map_err(map_err!(Read))?
                .map(|v| v.value())
                .unwrap_or(0);
            if seq + 1 > stored {
                meta.insert(NEXT_SEQ, seq + 1).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, action = %decision.action, pruned, "decision stored");
        Ok(())
    }

    /// The most recent `limit` entries for a sensor, oldest first.
    pub fn list_for_sensor(&self, sensor_id: &str, limit: usize) -> StateResult<Vec<DecisionEntry>> {
        let (start, end) = sensor_range(sensor_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let decoded: DecisionEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(decoded);
        }
        results.reverse();
        Ok(results)
    }

    /// The latest entry for a sensor, if any.
    pub fn latest_for_sensor(&self, sensor_id: &str) -> StateResult<Option<DecisionEntry>> {
        Ok(self.list_for_sensor(sensor_id, 1)?.pop())
    }

    /// Total number of stored entries.
    pub fn count(&self) -> StateResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        let n = table.len().map_err(map_err!(Read))?;
        Ok(n as usize)
    }
}

impl DecisionSink for DecisionLog {
    fn record<'a>(
        &'a self,
        decision: &'a ScalingDecision,
        verdict: Option<&'a Verdict>,
    ) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        Box::pin(async move {
            self.append(decision, verdict)
                .map_err(|e| CollaboratorError::Unavailable(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinscale_core::{Classification, ScalingAction, Streak};

    fn decision(id: &str, action: ScalingAction, at: u64) -> ScalingDecision {
        ScalingDecision {
            sensor_id: id.to_string(),
            action,
            reason: "test".to_string(),
            decided_at: at,
            streak: Streak {
                steady: 1,
                transient: 0,
            },
        }
    }

    fn verdict(id: &str, at: u64) -> Verdict {
        Verdict {
            sensor_id: id.to_string(),
            window_span_ms: 19_000,
            sample_count: 20,
            classification: Classification::Steady,
            confidence: 0.9,
            dispersion_ratio: Some(1.02),
            trend: Some(0.1),
            computed_at: at,
        }
    }

    #[test]
    fn append_and_list_in_time_order() {
        let log = DecisionLog::open_in_memory().unwrap();
        log.append(&decision("s1", ScalingAction::Hold, 2_000), None)
            .unwrap();
        log.append(
            &decision("s1", ScalingAction::Hold, 1_000),
            Some(&verdict("s1", 1_000)),
        )
        .unwrap();
        log.append(&decision("s1", ScalingAction::ScaleDown, 3_000), None)
            .unwrap();

        let entries = log.list_for_sensor("s1", 10).unwrap();
        let times: Vec<u64> = entries.iter().map(|e| e.decision.decided_at).collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
        assert_eq!(entries[0].verdict.as_ref().unwrap().confidence, 0.9);
    }

    #[test]
    fn limit_keeps_most_recent() {
        let log = DecisionLog::open_in_memory().unwrap();
        for t in 1..=5 {
            log.append(&decision("s1", ScalingAction::Hold, t * 1_000), None)
                .unwrap();
        }
        let entries = log.list_for_sensor("s1", 2).unwrap();
        let times: Vec<u64> = entries.iter().map(|e| e.decision.decided_at).collect();
        assert_eq!(times, vec![4_000, 5_000]);

        let latest = log.latest_for_sensor("s1").unwrap().unwrap();
        assert_eq!(latest.decision.decided_at, 5_000);
    }

    #[test]
    fn sensors_do_not_bleed_into_each_other() {
        let log = DecisionLog::open_in_memory().unwrap();
        log.append(&decision("s1", ScalingAction::Hold, 1), None)
            .unwrap();
        log.append(&decision("s10", ScalingAction::Retire, 1), None)
            .unwrap();

        assert_eq!(log.list_for_sensor("s1", 10).unwrap().len(), 1);
        assert_eq!(log.list_for_sensor("s10", 10).unwrap().len(), 1);
        assert!(log.latest_for_sensor("s2").unwrap().is_none());
        assert_eq!(log.count().unwrap(), 2);
    }

    #[test]
    fn same_millisecond_entries_are_kept() {
        let log = DecisionLog::open_in_memory().unwrap();
        log.append(&decision("s1", ScalingAction::Hold, 7), None)
            .unwrap();
        log.append(&decision("s1", ScalingAction::ScaleDown, 7), None)
            .unwrap();
        let actions: Vec<ScalingAction> = log
            .list_for_sensor("s1", 10)
            .unwrap()
            .into_iter()
            .map(|e| e.decision.action)
            .collect();
        assert_eq!(actions, vec![ScalingAction::Hold, ScalingAction::ScaleDown]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.redb");
        {
            let log = DecisionLog::open(&path).unwrap();
            log.append(&decision("s1", ScalingAction::Retire, 42), None)
                .unwrap();
        }
        let log = DecisionLog::open(&path).unwrap();
        let latest = log.latest_for_sensor("s1").unwrap().unwrap();
        assert_eq!(latest.decision.action, ScalingAction::Retire);
    }

    #[test]
    fn retention_drops_oldest_per_sensor() {
        let log = DecisionLog::open_in_memory().unwrap().with_retention(3);
        for t in 1..=6 {
            log.append(&decision("s1", ScalingAction::Hold, t * 1_000), None)
                .unwrap();
        }
        log.append(&decision("s2", ScalingAction::Hold, 500), None)
            .unwrap();

        let times: Vec<u64> = log
            .list_for_sensor("s1", 10)
            .unwrap()
            .iter()
            .map(|e| e.decision.decided_at)
            .collect();
        assert_eq!(times, vec![4_000, 5_000, 6_000]);
        assert_eq!(log.list_for_sensor("s2", 10).unwrap().len(), 1);
        assert_eq!(log.count().unwrap(), 4);
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let log = DecisionLog::open_in_memory().unwrap().with_retention(0);
        for t in 1..=50 {
            log.append(&decision("s1", ScalingAction::Hold, t), None)
                .unwrap();
        }
        assert_eq!(log.count().unwrap(), 50);
    }

    #[test]
    fn sequence_survives_reopen_after_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.redb");
        {
            let log = DecisionLog::open(&path).unwrap().with_retention(1);
            for _ in 0..4 {
                log.append(&decision("s1", ScalingAction::Hold, 9), None)
                    .unwrap();
            }
            assert_eq!(log.count().unwrap(), 1);
        }
        // One entry survives but four sequence numbers were used; numbering
        // from the entry count would sort the next append before the survivor.
        let log = DecisionLog::open(&path).unwrap().with_retention(2);
        assert_eq!(log.stored_next_seq().unwrap(), 4);
        log.append(&decision("s1", ScalingAction::Retire, 9), None)
            .unwrap();
        let actions: Vec<ScalingAction> = log
            .list_for_sensor("s1", 10)
            .unwrap()
            .into_iter()
            .map(|e| e.decision.action)
            .collect();
        assert_eq!(actions, vec![ScalingAction::Hold, ScalingAction::Retire]);
    }

    #[tokio::test]
    async fn works_as_decision_sink() {
        let log = DecisionLog::open_in_memory().unwrap();
        let sink: &dyn DecisionSink = &log;
        let v = verdict("s1", 5);
        sink.record(&decision("s1", ScalingAction::Hold, 5), Some(&v))
            .await
            .unwrap();
        assert_eq!(log.count().unwrap(), 1);
    }
}
