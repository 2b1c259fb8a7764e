//! Conflict detection over sync timestamps.
//!
//! Three independent instants describe a document's sync position: when
//! the local copy last changed, when the cloud copy last changed, and the
//! last known-good sync point. Conflict is a pure function of that triple,
//! not persisted state; callers pass the stamps per call.

use serde_json::Value;

mod envelope;

pub use envelope::{CLOUD_SAVE_SCHEMA_VERSION, SaveEnvelope, resolve_updated_at};

/// The timestamp triple, epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStamps {
    pub local_updated_at: i64,
    pub cloud_updated_at: i64,
    pub last_synced_at: i64,
}

/// True iff both sides advanced independently since the last known-good
/// sync point. Symmetric and side-effect-free: callers use it
/// directly to prompt for manual resolution, and inverted to pick a safe
/// auto-merge direction.
///
/// Equal timestamps are never a conflict.
pub fn detect_sync_conflict(stamps: &SyncStamps) -> bool {
    stamps.local_updated_at > stamps.last_synced_at
        && stamps.cloud_updated_at > stamps.last_synced_at
}

/// True iff the cloud copy is strictly newer than the local one. Ties
/// favor the local copy so an already-synced document never triggers a
/// redundant pull.
pub fn should_pull_cloud_copy(local_updated_at: i64, cloud_updated_at: i64) -> bool {
    cloud_updated_at > local_updated_at
}

/// Coerce a JSON-borne timestamp to epoch milliseconds. Missing,
/// non-numeric, and non-finite inputs all collapse to 0, which sorts
/// before any real instant.
pub fn coerce_timestamp(raw: Option<&Value>) -> i64 {
    let Some(raw) = raw else {
        return 0;
    };
    if let Some(ms) = raw.as_i64() {
        return ms;
    }
    if let Some(ms) = raw.as_f64() {
        if ms.is_finite() {
            return ms as i64;
        }
        return 0;
    }
    if let Some(text) = raw.as_str() {
        return text.trim().parse::<i64>().unwrap_or(0);
    }
    0
}
