//! Versioned wrapper the cloud copy of a document travels in.
//!
//! The sync layer only needs a timestamp and a payload out of the remote
//! record; everything else in the document is opaque. `normalize` accepts
//! whatever shape the remote store hands back and either produces a
//! well-formed envelope or nothing; a partial envelope is never acted on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coerce_timestamp;

/// Bumped when the envelope shape changes incompatibly.
pub const CLOUD_SAVE_SCHEMA_VERSION: u32 = 1;

/// Cloud save envelope: schema version, last-modified instant, payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEnvelope {
    pub schema_version: u32,
    /// Epoch milliseconds of the most recent write.
    pub updated_at: i64,
    /// The document snapshot itself; opaque to the sync layer.
    pub payload: Value,
}

impl SaveEnvelope {
    /// Wrap a payload with the current schema version.
    pub fn build(payload: Value, updated_at: i64) -> Self {
        Self {
            schema_version: CLOUD_SAVE_SCHEMA_VERSION,
            updated_at,
            payload,
        }
    }

    /// Normalize a raw remote value into an envelope.
    ///
    /// Requires an object payload; a missing or malformed `updatedAt`
    /// collapses to 0 rather than failing, so a legacy record without a
    /// stamp still loads (and always loses a freshness comparison).
    pub fn normalize(raw: &Value) -> Option<Self> {
        let payload = raw.get("payload")?;
        if !payload.is_object() {
            return None;
        }
        let schema_version = raw
            .get("schemaVersion")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .filter(|v| *v > 0)
            .unwrap_or(CLOUD_SAVE_SCHEMA_VERSION);
        Some(Self {
            schema_version,
            updated_at: resolve_updated_at(raw),
            payload: payload.clone(),
        })
    }
}

/// Resolve the last-modified stamp of a remote record: `updatedAt` on the
/// record itself, falling back to `meta.updatedAt` for older layouts.
pub fn resolve_updated_at(entry: &Value) -> i64 {
    let direct = coerce_timestamp(entry.get("updatedAt"));
    if direct != 0 {
        return direct;
    }
    coerce_timestamp(entry.get("meta").and_then(|meta| meta.get("updatedAt")))
}
