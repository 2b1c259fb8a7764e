//! Asset manifest: the versioned list of URLs the app needs offline.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::OfflineError;

/// Conventional manifest file name at the site root.
pub const MANIFEST_FILE_NAME: &str = "asset-manifest.json";

/// Wire shape: `{ "version": "...", "generatedAt": "...", "assets": [...] }`.
///
/// `version` doubles as the cache bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetManifest {
    pub version: String,
    /// ISO-8601 instant the manifest was generated; informational only.
    pub generated_at: String,
    pub assets: Vec<String>,
}

impl AssetManifest {
    /// Shape check beyond what deserialization enforces: the version must
    /// be non-empty because it names the cache bucket.
    pub fn is_valid(&self) -> bool {
        !self.version.is_empty()
    }
}

/// Fetch and validate the manifest.
///
/// An unreachable, non-success, or malformed manifest fails the whole
/// caching run here, before any asset work starts; there is no partial
/// manifest state. `force_reload` asks intermediaries to revalidate.
pub async fn fetch_manifest(
    client: &Client,
    manifest_url: &Url,
    force_reload: bool,
    cancel: &CancellationToken,
) -> Result<AssetManifest, OfflineError> {
    if cancel.is_cancelled() {
        return Err(OfflineError::Aborted);
    }

    let mut request = client.get(manifest_url.clone());
    if force_reload {
        request = request.header(reqwest::header::CACHE_CONTROL, "no-cache");
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(OfflineError::Aborted),
        response = request.send() => response?,
    };
    let status = response.status();
    if !status.is_success() {
        return Err(OfflineError::ManifestStatus {
            status: status.as_u16(),
        });
    }

    let body = tokio::select! {
        _ = cancel.cancelled() => return Err(OfflineError::Aborted),
        body = response.text() => body?,
    };
    let manifest: AssetManifest =
        serde_json::from_str(&body).map_err(|_| OfflineError::InvalidManifest)?;
    if !manifest.is_valid() {
        return Err(OfflineError::InvalidManifest);
    }
    Ok(manifest)
}
