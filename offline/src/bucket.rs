//! Versioned cache buckets: named, append-only URL → response stores.
//!
//! Entries are written once per manifest version; re-fetching with
//! `force_reload` is the only path that overwrites one. Superseded
//! buckets are removed whole via [`purge_stale_buckets`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::OfflineError;

/// A cached response: enough to serve the asset without a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    /// Fully resolved URL the asset was fetched from; also the cache key.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// One named bucket, keyed by fully resolved asset URL.
#[async_trait]
pub trait CacheBucket: Send + Sync {
    async fn contains(&self, url: &str) -> Result<bool, OfflineError>;
    async fn get(&self, url: &str) -> Result<Option<CachedAsset>, OfflineError>;
    async fn put(&self, asset: CachedAsset) -> Result<(), OfflineError>;
}

/// A collection of named buckets, one per manifest version.
#[async_trait]
pub trait AssetCache: Send + Sync {
    /// Open the bucket with this name, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>, OfflineError>;
    /// Names of every existing bucket.
    async fn list(&self) -> Result<Vec<String>, OfflineError>;
    /// Delete a bucket and everything in it. Missing buckets are a no-op.
    async fn remove(&self, name: &str) -> Result<(), OfflineError>;
}

/// Delete every bucket except `keep`. Returns the removed names.
///
/// Run after a caching run completes to reclaim superseded versions,
/// the same way a service worker drops old caches on activation.
pub async fn purge_stale_buckets(
    cache: &dyn AssetCache,
    keep: &str,
) -> Result<Vec<String>, OfflineError> {
    let mut removed = Vec::new();
    for name in cache.list().await? {
        if name != keep {
            cache.remove(&name).await?;
            removed.push(name);
        }
    }
    if !removed.is_empty() {
        debug!(keep, count = removed.len(), "purged stale cache buckets");
    }
    Ok(removed)
}

/// In-memory cache, used by tests and as the reference semantics for
/// persistent backends.
#[derive(Debug, Default)]
pub struct MemoryAssetCache {
    buckets: Mutex<HashMap<String, Arc<MemoryBucket>>>,
}

#[derive(Debug, Default)]
struct MemoryBucket {
    entries: Mutex<HashMap<String, CachedAsset>>,
}

impl MemoryAssetCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetCache for MemoryAssetCache {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>, OfflineError> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBucket::default()))
            .clone();
        Ok(bucket)
    }

    async fn list(&self) -> Result<Vec<String>, OfflineError> {
        let buckets = self.buckets.lock().await;
        let mut names: Vec<String> = buckets.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<(), OfflineError> {
        let mut buckets = self.buckets.lock().await;
        buckets.remove(name);
        Ok(())
    }
}

#[async_trait]
impl CacheBucket for MemoryBucket {
    async fn contains(&self, url: &str) -> Result<bool, OfflineError> {
        let entries = self.entries.lock().await;
        Ok(entries.contains_key(url))
    }

    async fn get(&self, url: &str) -> Result<Option<CachedAsset>, OfflineError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(url).cloned())
    }

    async fn put(&self, asset: CachedAsset) -> Result<(), OfflineError> {
        let mut entries = self.entries.lock().await;
        entries.insert(asset.url.clone(), asset);
        Ok(())
    }
}
