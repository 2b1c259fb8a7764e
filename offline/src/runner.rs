//! The caching run: manifest fetch, then bounded fanout over the assets.
//!
//! A fixed pool of workers pulls indices from a shared cursor, so no two
//! workers ever touch the same asset and no more than the pool width is
//! in flight at once. Per-asset failures land in the report's `failed`
//! list without disturbing sibling workers; cancellation propagates out
//! of the whole call as [`OfflineError::Aborted`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::OfflineError;
use crate::bucket::{AssetCache, CacheBucket, CachedAsset};
use crate::manifest::{AssetManifest, fetch_manifest};

/// Default worker-pool width; always clamped to the asset count.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Progress callback type: fired once the manifest is known and after
/// every asset completes (fetched, skipped, or failed).
pub type ProgressFn = dyn Fn(CacheProgress) + Send + Sync;

/// Running totals handed to the progress callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheProgress {
    pub total: usize,
    pub completed: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed_count: usize,
    pub manifest_version: String,
}

/// One asset the run could not cache, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub url: String,
    pub error: String,
}

/// Outcome of a completed run. `fetched + skipped + failed.len()` always
/// equals `total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRunReport {
    pub manifest_version: String,
    pub total: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: Vec<FailedAsset>,
}

/// Inputs for [`ensure_offline_assets`].
pub struct CacheRunOptions {
    /// Where the manifest lives.
    pub manifest_url: Url,
    /// Base location relative manifest entries resolve against.
    pub base_url: Url,
    /// Re-fetch and overwrite entries that are already cached.
    pub force_reload: bool,
    pub concurrency: usize,
    pub cancel: CancellationToken,
    pub on_progress: Option<Arc<ProgressFn>>,
}

impl CacheRunOptions {
    pub fn new(manifest_url: Url, base_url: Url) -> Self {
        Self {
            manifest_url,
            base_url,
            force_reload: false,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn with_progress(
        mut self,
        on_progress: impl Fn(CacheProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }
}

struct RunState {
    manifest_version: String,
    total: usize,
    completed: usize,
    fetched: usize,
    skipped: usize,
    failed: Vec<FailedAsset>,
}

impl RunState {
    fn progress(&self) -> CacheProgress {
        CacheProgress {
            total: self.total,
            completed: self.completed,
            fetched: self.fetched,
            skipped: self.skipped,
            failed_count: self.failed.len(),
            manifest_version: self.manifest_version.clone(),
        }
    }

    fn report(&self) -> CacheRunReport {
        CacheRunReport {
            manifest_version: self.manifest_version.clone(),
            total: self.total,
            fetched: self.fetched,
            skipped: self.skipped,
            failed: self.failed.clone(),
        }
    }
}

/// Resolve manifest entries against the base location and de-duplicate
/// by resolved URL. Entries that refuse to resolve are kept verbatim so
/// the fetch records them as failures instead of dropping them silently.
fn resolve_unique_urls(manifest: &AssetManifest, base: &Url) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for asset in &manifest.assets {
        let trimmed = asset.trim();
        if trimmed.is_empty() {
            continue;
        }
        let resolved = match base.join(trimmed) {
            Ok(url) => url.to_string(),
            Err(_) => trimmed.to_string(),
        };
        if seen.insert(resolved.clone()) {
            urls.push(resolved);
        }
    }
    urls
}

/// Fetch the manifest and populate the bucket named after its version.
///
/// Completes with partial success: per-asset failures are reported, not
/// raised. The only error outcomes are a bad manifest, cancellation, and
/// cache-backend faults.
pub async fn ensure_offline_assets(
    client: &Client,
    cache: &dyn AssetCache,
    options: &CacheRunOptions,
) -> Result<CacheRunReport, OfflineError> {
    let manifest = fetch_manifest(
        client,
        &options.manifest_url,
        options.force_reload,
        &options.cancel,
    )
    .await?;
    let urls = resolve_unique_urls(&manifest, &options.base_url);
    let total = urls.len();
    debug!(version = %manifest.version, total, "caching run starting");

    let bucket = cache.open(&manifest.version).await?;
    let state = Arc::new(Mutex::new(RunState {
        manifest_version: manifest.version.clone(),
        total,
        completed: 0,
        fetched: 0,
        skipped: 0,
        failed: Vec::new(),
    }));

    if let Some(on_progress) = &options.on_progress {
        on_progress(state.lock().await.progress());
    }
    if total == 0 {
        return Ok(state.lock().await.report());
    }

    let urls = Arc::new(urls);
    let cursor = Arc::new(AtomicUsize::new(0));
    let width = options.concurrency.clamp(1, total);

    let mut workers = JoinSet::new();
    for _ in 0..width {
        let client = client.clone();
        let bucket = Arc::clone(&bucket);
        let urls = Arc::clone(&urls);
        let cursor = Arc::clone(&cursor);
        let state = Arc::clone(&state);
        let cancel = options.cancel.clone();
        let on_progress = options.on_progress.clone();
        let force_reload = options.force_reload;
        workers.spawn(async move {
            run_worker(
                &client,
                bucket.as_ref(),
                &urls,
                &cursor,
                &state,
                &cancel,
                on_progress.as_deref(),
                force_reload,
            )
            .await
        });
    }

    let mut aborted = false;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(OfflineError::Aborted)) => aborted = true,
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(OfflineError::Worker(err.to_string())),
        }
    }
    if aborted {
        return Err(OfflineError::Aborted);
    }

    let report = state.lock().await.report();
    debug!(
        version = %report.manifest_version,
        fetched = report.fetched,
        skipped = report.skipped,
        failed = report.failed.len(),
        "caching run complete"
    );
    Ok(report)
}

enum Disposition {
    Fetched,
    Skipped,
}

#[expect(clippy::too_many_arguments)]
async fn run_worker(
    client: &Client,
    bucket: &dyn CacheBucket,
    urls: &[String],
    cursor: &AtomicUsize,
    state: &Mutex<RunState>,
    cancel: &CancellationToken,
    on_progress: Option<&ProgressFn>,
    force_reload: bool,
) -> Result<(), OfflineError> {
    loop {
        if cancel.is_cancelled() {
            return Err(OfflineError::Aborted);
        }
        let index = cursor.fetch_add(1, Ordering::SeqCst);
        let Some(url) = urls.get(index) else {
            return Ok(());
        };

        let disposition = cache_one(client, bucket, url, force_reload, cancel).await;
        if matches!(disposition, Err(OfflineError::Aborted)) {
            return Err(OfflineError::Aborted);
        }
        let mut guard = state.lock().await;
        guard.completed += 1;
        match disposition {
            Ok(Disposition::Fetched) => guard.fetched += 1,
            Ok(Disposition::Skipped) => guard.skipped += 1,
            Err(err) => {
                warn!(url = %url, error = %err, "offline asset fetch failed");
                guard.failed.push(FailedAsset {
                    url: url.clone(),
                    error: err.to_string(),
                });
            }
        }
        let progress = guard.progress();
        // Callback fires under the lock so observers see snapshots in
        // counter order even with several workers completing at once.
        if let Some(on_progress) = on_progress {
            on_progress(progress);
        }
    }
}

async fn cache_one(
    client: &Client,
    bucket: &dyn CacheBucket,
    url: &str,
    force_reload: bool,
    cancel: &CancellationToken,
) -> Result<Disposition, OfflineError> {
    if !force_reload && bucket.contains(url).await? {
        return Ok(Disposition::Skipped);
    }
    if cancel.is_cancelled() {
        return Err(OfflineError::Aborted);
    }

    let mut request = client.get(url);
    if force_reload {
        request = request.header(CACHE_CONTROL, "no-cache");
    }
    let fetch = async move {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OfflineError::AssetStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(CachedAsset {
            url: url.to_string(),
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    };
    let asset = tokio::select! {
        _ = cancel.cancelled() => return Err(OfflineError::Aborted),
        asset = fetch => asset?,
    };

    bucket.put(asset).await?;
    Ok(Disposition::Fetched)
}
