//! Disk-backed asset cache.
//!
//! Layout, one directory per bucket, one file per asset:
//!
//! ```text
//! <root>/
//!   <bucket-dir>/
//!     bucket.json           { "name": "<manifest version>" }
//!     <sha256(url)[..32]>.json   cached asset (body base64-encoded)
//! ```
//!
//! Writes go through a `.tmp` sibling and an atomic rename, so a crash
//! mid-write never leaves a torn entry behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bucket::{AssetCache, CacheBucket, CachedAsset};
use crate::OfflineError;

const BUCKET_META_FILE: &str = "bucket.json";

#[derive(Debug, Serialize, Deserialize)]
struct BucketMeta {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskEntry {
    url: String,
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    /// Base64 of the response body.
    body: String,
}

/// Persistent [`AssetCache`] rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskAssetCache {
    root: PathBuf,
}

impl DiskAssetCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, OfflineError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, name: &str) -> PathBuf {
        self.root.join(dir_name_for(name))
    }
}

/// Map a bucket name to a filesystem-safe directory name. Names that are
/// already safe map to themselves; anything else gets its unsafe
/// characters replaced and a short hash suffix to stay collision-free.
fn dir_name_for(name: &str) -> String {
    let safe = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe && !name.is_empty() && name != "." && name != ".." {
        return name.to_string();
    }
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(name.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{sanitized}-{suffix}")
}

fn entry_file_name(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    format!("{hex}.json")
}

/// Atomically write `data` to `path` via a `.tmp` sibling.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), OfflineError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl AssetCache for DiskAssetCache {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>, OfflineError> {
        let dir = self.bucket_dir(name);
        fs::create_dir_all(&dir)?;
        let meta = BucketMeta {
            name: name.to_string(),
        };
        atomic_write(
            &dir.join(BUCKET_META_FILE),
            &serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(Arc::new(DiskBucket { dir }))
    }

    async fn list(&self) -> Result<Vec<String>, OfflineError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(BUCKET_META_FILE);
            let name = fs::read_to_string(&meta_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<BucketMeta>(&raw).ok())
                .map(|meta| meta.name)
                .unwrap_or_else(|| entry.file_name().to_string_lossy().into_owned());
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<(), OfflineError> {
        let dir = self.bucket_dir(name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct DiskBucket {
    dir: PathBuf,
}

#[async_trait]
impl CacheBucket for DiskBucket {
    async fn contains(&self, url: &str) -> Result<bool, OfflineError> {
        Ok(self.dir.join(entry_file_name(url)).exists())
    }

    async fn get(&self, url: &str) -> Result<Option<CachedAsset>, OfflineError> {
        let path = self.dir.join(entry_file_name(url));
        if !path.exists() {
            return Ok(None);
        }
        let entry: DiskEntry = serde_json::from_str(&fs::read_to_string(&path)?)?;
        let body = BASE64
            .decode(entry.body.as_bytes())
            .map_err(|err| OfflineError::Worker(format!("corrupt cache entry: {err}")))?;
        Ok(Some(CachedAsset {
            url: entry.url,
            status: entry.status,
            content_type: entry.content_type,
            body,
        }))
    }

    async fn put(&self, asset: CachedAsset) -> Result<(), OfflineError> {
        let entry = DiskEntry {
            url: asset.url.clone(),
            status: asset.status,
            content_type: asset.content_type,
            body: BASE64.encode(&asset.body),
        };
        atomic_write(
            &self.dir.join(entry_file_name(&asset.url)),
            &serde_json::to_vec_pretty(&entry)?,
        )
    }
}
