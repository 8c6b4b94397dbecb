//! Virtual sensor registry — authoritative lifecycle state per sensor.
//!
//! Records live in a fixed number of shards, each a `RwLock`ed map of
//! per-sensor `Mutex`es. Operations on one sensor serialize on its mutex;
//! operations on different sensors only contend on a shard lock long enough
//! to clone an `Arc`. Locks are always taken shard first, record second.
//!
//! The transition table is a pure function ([`transition`]); everything
//! else here is bookkeeping around it.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use twinscale_core::{
    EpochMillis, LifecycleState, RegistryError, ScalingAction, ScalingDecision, SensorId,
    SensorRecord, TransitionInput,
};

const DEFAULT_SHARDS: usize = 16;

type Slot = Arc<Mutex<SensorRecord>>;
type Shard = RwLock<HashMap<SensorId, Slot>>;

/// Next state for a decision applied in `from`, or `None` if the
/// transition is invalid. `from == None` means the sensor is unknown.
pub fn transition(from: Option<LifecycleState>, action: ScalingAction) -> Option<LifecycleState> {
    use LifecycleState::*;
    use ScalingAction::*;

    match (from, action) {
        (None, ScaleUp) => Some(PendingCreate),
        (None, _) => None,
        (Some(PendingCreate), Hold | ScaleUp) => Some(PendingCreate),
        (Some(PendingCreate), ScaleDown | Retire) => None,
        (Some(Active), Hold | ScaleUp) => Some(Active),
        (Some(Active), ScaleDown | Retire) => Some(PendingDestroy),
        (Some(PendingDestroy), Hold) => Some(PendingDestroy),
        (Some(PendingDestroy), _) => None,
        (Some(Destroyed), _) => None,
    }
}

/// Sharded, concurrently accessible map of sensor records.
pub struct VirtualSensorRegistry {
    shards: Box<[Shard]>,
}

impl VirtualSensorRegistry {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard(&self, sensor_id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        sensor_id.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    async fn slot(&self, sensor_id: &str) -> Option<Slot> {
        self.shard(sensor_id).read().await.get(sensor_id).cloned()
    }

    async fn slot_or_not_found(&self, sensor_id: &str) -> Result<Slot, RegistryError> {
        self.slot(sensor_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(sensor_id.to_string()))
    }

    /// Snapshot of one record.
    pub async fn get(&self, sensor_id: &str) -> Option<SensorRecord> {
        let slot = self.slot(sensor_id).await?;
        let record = slot.lock().await.clone();
        Some(record)
    }

    /// Snapshot of every record, sorted by sensor id.
    pub async fn list(&self) -> Vec<SensorRecord> {
        let mut slots = Vec::new();
        for shard in self.shards.iter() {
            slots.extend(shard.read().await.values().cloned());
        }
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.lock().await.clone());
        }
        records.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        records
    }

    pub async fn len(&self) -> usize {
        let mut n = 0;
        for shard in self.shards.iter() {
            n += shard.read().await.len();
        }
        n
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Register a sensor by operator request. Starts in `PendingCreate` with
    /// its create command requested.
    ///
    /// A destroyed tombstone may be re-registered; any other existing
    /// record is an error.
    pub async fn register(
        &self,
        sensor_id: &str,
        provisional: bool,
        now: EpochMillis,
    ) -> Result<SensorRecord, RegistryError> {
        let mut shard = self.shard(sensor_id).write().await;
        if let Some(slot) = shard.get(sensor_id) {
            let mut record = slot.lock().await;
            if record.state != LifecycleState::Destroyed {
                return Err(RegistryError::AlreadyRegistered {
                    sensor_id: sensor_id.to_string(),
                    state: record.state,
                });
            }
            *record = SensorRecord::new(sensor_id, LifecycleState::PendingCreate, provisional, now);
            record.create_requested = true;
            info!(sensor = %sensor_id, "tombstoned sensor re-registered");
            return Ok(record.clone());
        }

        let mut record =
            SensorRecord::new(sensor_id, LifecycleState::PendingCreate, provisional, now);
        record.create_requested = true;
        shard.insert(sensor_id.to_string(), Arc::new(Mutex::new(record.clone())));
        debug!(sensor = %sensor_id, provisional, "sensor registered");
        Ok(record)
    }

    /// Note a sensor seen in telemetry. Unknown sensors become provisional
    /// `PendingCreate` records with no create requested: nothing is
    /// provisioned until the policy scales them up. Returns the new record,
    /// or `None` if the sensor was already known (tombstones included).
    pub async fn observe(&self, sensor_id: &str, now: EpochMillis) -> Option<SensorRecord> {
        if self.slot(sensor_id).await.is_some() {
            return None;
        }
        let mut shard = self.shard(sensor_id).write().await;
        if shard.contains_key(sensor_id) {
            return None;
        }
        let record = SensorRecord::new(sensor_id, LifecycleState::PendingCreate, true, now);
        shard.insert(sensor_id.to_string(), Arc::new(Mutex::new(record.clone())));
        Some(record)
    }

    /// Apply a decision atomically for its sensor.
    ///
    /// The decision's streak counters are stored even when the state does
    /// not change. Invalid transitions leave the record untouched.
    pub async fn apply(&self, decision: &ScalingDecision) -> Result<SensorRecord, RegistryError> {
        match self.slot(&decision.sensor_id).await {
            Some(slot) => self.apply_present(slot, decision).await,
            None => self.apply_absent(decision).await,
        }
    }

    async fn apply_present(
        &self,
        slot: Slot,
        decision: &ScalingDecision,
    ) -> Result<SensorRecord, RegistryError> {
        let mut record = slot.lock().await;
        let from = record.state;
        let Some(next) = transition(Some(from), decision.action) else {
            return Err(RegistryError::InvalidTransition {
                sensor_id: decision.sensor_id.clone(),
                from: Some(from),
                input: TransitionInput::Decision(decision.action),
            });
        };

        record.state = next;
        if next == LifecycleState::PendingCreate && decision.action == ScalingAction::ScaleUp {
            record.create_requested = true;
        }
        record.consecutive_steady_count = decision.streak.steady;
        record.consecutive_transient_count = decision.streak.transient;
        if next != from || decision.action != ScalingAction::Hold {
            record.last_action_at = decision.decided_at;
        }
        if next != from {
            info!(
                sensor = %decision.sensor_id,
                %from,
                to = %next,
                action = %decision.action,
                reason = %decision.reason,
                "sensor transition"
            );
        }
        Ok(record.clone())
    }

    async fn apply_absent(&self, decision: &ScalingDecision) -> Result<SensorRecord, RegistryError> {
        let sensor_id = decision.sensor_id.as_str();
        let mut shard = self.shard(sensor_id).write().await;
        if let Some(slot) = shard.get(sensor_id).cloned() {
            // Lost a race with an insert; apply against the record now present.
            drop(shard);
            return self.apply_present(slot, decision).await;
        }
        let Some(next) = transition(None, decision.action) else {
            return Err(RegistryError::InvalidTransition {
                sensor_id: sensor_id.to_string(),
                from: None,
                input: TransitionInput::Decision(decision.action),
            });
        };
        let mut record = SensorRecord::new(sensor_id, next, true, decision.decided_at);
        record.create_requested = next == LifecycleState::PendingCreate;
        record.consecutive_steady_count = decision.streak.steady;
        record.consecutive_transient_count = decision.streak.transient;
        shard.insert(sensor_id.to_string(), Arc::new(Mutex::new(record.clone())));
        info!(sensor = %sensor_id, to = %next, reason = %decision.reason, "sensor created by decision");
        Ok(record)
    }

    /// Lifecycle controller acknowledged creation: `PendingCreate -> Active`.
    pub async fn confirm_created(
        &self,
        sensor_id: &str,
        now: EpochMillis,
    ) -> Result<SensorRecord, RegistryError> {
        self.confirm(
            sensor_id,
            now,
            LifecycleState::PendingCreate,
            LifecycleState::Active,
            TransitionInput::CreateConfirmed,
        )
        .await
    }

    /// Lifecycle controller acknowledged destruction:
    /// `PendingDestroy -> Destroyed`. Streak history is purged.
    pub async fn confirm_destroyed(
        &self,
        sensor_id: &str,
        now: EpochMillis,
    ) -> Result<SensorRecord, RegistryError> {
        self.confirm(
            sensor_id,
            now,
            LifecycleState::PendingDestroy,
            LifecycleState::Destroyed,
            TransitionInput::DestroyConfirmed,
        )
        .await
    }

    async fn confirm(
        &self,
        sensor_id: &str,
        now: EpochMillis,
        expected: LifecycleState,
        next: LifecycleState,
        input: TransitionInput,
    ) -> Result<SensorRecord, RegistryError> {
        let slot = self.slot_or_not_found(sensor_id).await?;
        let mut record = slot.lock().await;
        if record.state != expected {
            return Err(RegistryError::InvalidTransition {
                sensor_id: sensor_id.to_string(),
                from: Some(record.state),
                input,
            });
        }
        record.state = next;
        record.last_action_at = now;
        record.command_failures = 0;
        record.create_requested = false;
        if next == LifecycleState::Destroyed {
            record.consecutive_steady_count = 0;
            record.consecutive_transient_count = 0;
        }
        info!(sensor = %sensor_id, from = %expected, to = %next, "transition confirmed");
        Ok(record.clone())
    }

    /// Count a failed lifecycle command. The record is flagged degraded once
    /// `max_failures` consecutive failures accumulate.
    pub async fn record_command_failure(
        &self,
        sensor_id: &str,
        max_failures: u32,
    ) -> Result<SensorRecord, RegistryError> {
        let slot = self.slot_or_not_found(sensor_id).await?;
        let mut record = slot.lock().await;
        record.command_failures = record.command_failures.saturating_add(1);
        if !record.degraded && record.command_failures >= max_failures {
            record.degraded = true;
            warn!(
                sensor = %sensor_id,
                state = %record.state,
                failures = record.command_failures,
                "sensor degraded; lifecycle commands keep failing"
            );
        }
        Ok(record.clone())
    }

    /// Operator override: resume processing a degraded sensor.
    pub async fn clear_degraded(&self, sensor_id: &str) -> Result<SensorRecord, RegistryError> {
        let slot = self.slot_or_not_found(sensor_id).await?;
        let mut record = slot.lock().await;
        record.degraded = false;
        record.command_failures = 0;
        info!(sensor = %sensor_id, "degraded flag cleared");
        Ok(record.clone())
    }

    /// Ids of every degraded sensor, sorted.
    pub async fn degraded(&self) -> Vec<SensorId> {
        self.list()
            .await
            .into_iter()
            .filter(|r| r.degraded)
            .map(|r| r.sensor_id)
            .collect()
    }

    /// Undo an unconfirmed transition.
    ///
    /// `PendingDestroy` goes back to `Active`. A provisional `PendingCreate`
    /// record is dropped entirely (returns `None`); an operator's stays
    /// pending so its create goes out again later. Other states are left
    /// alone.
    pub async fn rollback(
        &self,
        sensor_id: &str,
        now: EpochMillis,
    ) -> Result<Option<SensorRecord>, RegistryError> {
        let mut shard = self.shard(sensor_id).write().await;
        let slot = shard
            .get(sensor_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(sensor_id.to_string()))?;
        let mut record = slot.lock().await;
        match record.state {
            LifecycleState::PendingDestroy => {
                record.state = LifecycleState::Active;
                record.last_action_at = now;
                record.consecutive_steady_count = 0;
                info!(sensor = %sensor_id, "rolled back pending destroy");
                Ok(Some(record.clone()))
            }
            LifecycleState::PendingCreate if !record.provisional => {
                debug!(sensor = %sensor_id, "operator sensor stays pending create");
                Ok(Some(record.clone()))
            }
            LifecycleState::PendingCreate => {
                drop(record);
                shard.remove(sensor_id);
                info!(sensor = %sensor_id, "rolled back pending create");
                Ok(None)
            }
            _ => Ok(Some(record.clone())),
        }
    }

    /// Track an instance found running without a record. Adopted sensors
    /// are `Active` and provisional.
    pub async fn adopt(
        &self,
        sensor_id: &str,
        now: EpochMillis,
    ) -> Result<SensorRecord, RegistryError> {
        let mut shard = self.shard(sensor_id).write().await;
        if let Some(slot) = shard.get(sensor_id) {
            let state = slot.lock().await.state;
            return Err(RegistryError::AlreadyRegistered {
                sensor_id: sensor_id.to_string(),
                state,
            });
        }
        let record = SensorRecord::new(sensor_id, LifecycleState::Active, true, now);
        shard.insert(sensor_id.to_string(), Arc::new(Mutex::new(record.clone())));
        info!(sensor = %sensor_id, "adopted running instance");
        Ok(record)
    }

    /// An `Active` record lost its instance out of band. Sends it back to
    /// `PendingCreate` so the controller re-creates it.
    pub async fn mark_drifted(
        &self,
        sensor_id: &str,
        now: EpochMillis,
    ) -> Result<SensorRecord, RegistryError> {
        let slot = self.slot_or_not_found(sensor_id).await?;
        let mut record = slot.lock().await;
        if record.state != LifecycleState::Active {
            return Err(RegistryError::InvalidTransition {
                sensor_id: sensor_id.to_string(),
                from: Some(record.state),
                input: TransitionInput::DriftDetected,
            });
        }
        record.state = LifecycleState::PendingCreate;
        record.create_requested = true;
        record.last_action_at = now;
        warn!(sensor = %sensor_id, "instance missing; scheduling re-create");
        Ok(record.clone())
    }

    /// Drop provisional tombstones older than `ttl`. Operator-registered
    /// tombstones stay until re-registered. Returns the purged ids.
    pub async fn purge_expired(&self, now: EpochMillis, ttl: Duration) -> Vec<SensorId> {
        let ttl_ms = ttl.as_millis() as u64;
        let mut purged = Vec::new();
        for shard in self.shards.iter() {
            let mut map = shard.write().await;
            let mut expired = Vec::new();
            for (id, slot) in map.iter() {
                let record = slot.lock().await;
                if record.state == LifecycleState::Destroyed
                    && record.provisional
                    && now.saturating_sub(record.last_action_at) > ttl_ms
                {
                    expired.push(id.clone());
                }
            }
            for id in expired {
                map.remove(&id);
                purged.push(id);
            }
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "purged expired tombstones");
        }
        purged.sort();
        purged
    }
}

impl Default for VirtualSensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
