//! Offline asset cache for running the app with no network at all.
//!
//! A versioned manifest lists every asset the app needs; caching a
//! manifest populates a bucket named after its version with bounded
//! fetch fanout. Because the version doubles as the bucket name, a
//! content change always lands in a fresh, disjoint bucket. Old buckets
//! are superseded, never mutated, and reclaimed with
//! [`purge_stale_buckets`].

mod bucket;
mod disk;
mod generate;
mod manifest;
mod runner;
mod state;

pub use bucket::{AssetCache, CacheBucket, CachedAsset, MemoryAssetCache, purge_stale_buckets};
pub use disk::DiskAssetCache;
pub use generate::{GenerateOptions, generate_manifest, write_manifest};
pub use manifest::{AssetManifest, MANIFEST_FILE_NAME, fetch_manifest};
pub use runner::{
    CacheProgress, CacheRunOptions, CacheRunReport, DEFAULT_CONCURRENCY, FailedAsset, ProgressFn,
    ensure_offline_assets,
};
pub use state::OfflineStateStore;

/// Failures of the offline cache layer.
///
/// `Aborted` is caller-initiated cancellation, kept distinct from real
/// failures so a user-triggered stop is not reported as an error.
#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error("failed to fetch asset manifest (status: {status})")]
    ManifestStatus { status: u16 },

    #[error("invalid asset manifest received")]
    InvalidManifest,

    #[error("failed to fetch {url} (status: {status})")]
    AssetStatus { url: String, status: u16 },

    #[error("asset caching aborted")]
    Aborted,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("cache worker failed: {0}")]
    Worker(String),
}
