//! Advisory local bookkeeping: which manifest version finished caching,
//! when, and which document the user last worked on.
//!
//! None of this is consulted by the caching run itself. It exists so the
//! caller can decide whether a refresh is owed and which record to reopen.
//! Reads tolerate a missing or corrupt file (the answer is just "unknown");
//! writes go through an atomic rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::OfflineError;

const STATE_FILE: &str = "offline-state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    manifest_version: Option<String>,
    /// Epoch ms of the last completed caching run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    manifest_updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_save_name: Option<String>,
}

/// Persisted offline bookkeeping record.
#[derive(Debug, Clone)]
pub struct OfflineStateStore {
    file_path: PathBuf,
}

impl OfflineStateStore {
    /// Store at the platform data directory (`<data_dir>/satchel/offline-state.json`).
    pub fn new() -> io::Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "could not determine a data directory")
            })?
            .join("satchel");
        Ok(Self::with_path(data_dir.join(STATE_FILE)))
    }

    /// Store at a custom file path (tests, embedded hosts).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn read(&self) -> StateFile {
        let Ok(raw) = fs::read_to_string(&self.file_path) else {
            return StateFile::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn write(&self, state: &StateFile) -> Result<(), OfflineError> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.file_path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.file_path)?;
        Ok(())
    }

    /// The manifest version we last finished caching, if any.
    pub fn stored_manifest_version(&self) -> Option<String> {
        self.read().manifest_version.filter(|v| !v.is_empty())
    }

    /// When that version finished caching, epoch ms.
    pub fn stored_manifest_timestamp(&self) -> Option<i64> {
        self.read().manifest_updated_at
    }

    /// Record a completed caching run. `None` clears the record (both the
    /// version and its timestamp); `updated_at` defaults to now.
    pub fn set_stored_manifest_version(
        &self,
        version: Option<&str>,
        updated_at: Option<i64>,
    ) -> Result<(), OfflineError> {
        let mut state = self.read();
        match version {
            Some(version) if !version.is_empty() => {
                state.manifest_version = Some(version.to_string());
                state.manifest_updated_at = Some(updated_at.unwrap_or_else(now_ms));
            }
            _ => {
                state.manifest_version = None;
                state.manifest_updated_at = None;
            }
        }
        self.write(&state)
    }

    /// Name of the document the user last saved, if any.
    pub fn last_save_name(&self) -> Option<String> {
        self.read()
            .last_save_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }

    /// Record (or with `None`/blank, clear) the last-saved document name.
    pub fn set_last_save_name(&self, name: Option<&str>) -> Result<(), OfflineError> {
        let mut state = self.read();
        state.last_save_name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        self.write(&state)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> OfflineStateStore {
        OfflineStateStore::with_path(dir.path().join("state/offline-state.json"))
    }

    #[test]
    fn absent_file_reads_as_unknown() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        assert_eq!(None, store.stored_manifest_version());
        assert_eq!(None, store.stored_manifest_timestamp());
        assert_eq!(None, store.last_save_name());
    }

    #[test]
    fn version_round_trips_and_clears() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);

        store
            .set_stored_manifest_version(Some("satchel-cache-aa11"), Some(5000))
            .expect("set");
        assert_eq!(
            Some("satchel-cache-aa11".to_string()),
            store.stored_manifest_version()
        );
        assert_eq!(Some(5000), store.stored_manifest_timestamp());

        store.set_stored_manifest_version(None, None).expect("clear");
        assert_eq!(None, store.stored_manifest_version());
        assert_eq!(None, store.stored_manifest_timestamp());
    }

    #[test]
    fn default_timestamp_is_current() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let before = now_ms();
        store
            .set_stored_manifest_version(Some("v1"), None)
            .expect("set");
        let stamped = store.stored_manifest_timestamp().expect("timestamp");
        assert!(stamped >= before);
    }

    #[test]
    fn last_save_name_trims_and_clears() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);

        store.set_last_save_name(Some("  Vex the Bold  ")).expect("set");
        assert_eq!(Some("Vex the Bold".to_string()), store.last_save_name());
        // Manifest bookkeeping is untouched by save-name writes.
        assert_eq!(None, store.stored_manifest_version());

        store.set_last_save_name(Some("   ")).expect("blank clears");
        assert_eq!(None, store.last_save_name());
    }

    #[test]
    fn corrupt_file_reads_as_unknown() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        fs::create_dir_all(dir.path().join("state")).expect("mkdir");
        fs::write(store.path(), "not json at all").expect("write");
        assert_eq!(None, store.stored_manifest_version());
    }
}
