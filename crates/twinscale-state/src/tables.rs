//! redb table definitions for the decision log.

use redb::TableDefinition;

/// Decision entries keyed by `{sensor_id}:{decided_at:020}:{seq:020}`.
///
/// Zero-padded numbers keep lexicographic order equal to time order within
/// a sensor.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Small counters that must survive a restart.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// `META` key holding the sequence number the next append will use.
pub const NEXT_SEQ: &str = "next_seq";

/// Key for one decision entry.
pub fn decision_key(sensor_id: &str, decided_at: u64, seq: u64) -> String {
    format!("{sensor_id}:{decided_at:020}:{seq:020}")
}

/// Half-open key range `[start, end)` covering every entry of `sensor_id`.
///
/// `;` is the byte after `:`, so the end bound excludes other sensors that
/// merely share a prefix.
pub fn sensor_range(sensor_id: &str) -> (String, String) {
    (format!("{sensor_id}:"), format!("{sensor_id};"))
}
