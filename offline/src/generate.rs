//! Manifest generation: walk a site root, collect cacheable files, and
//! derive a content-addressed version so any byte change yields a new
//! bucket name.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::manifest::{AssetManifest, MANIFEST_FILE_NAME};
use crate::OfflineError;

/// What the walk should pick up.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// File extensions (with leading dot, lowercase) worth caching.
    pub allowed_extensions: BTreeSet<String>,
    /// Relative paths included regardless of extension.
    pub always_include: BTreeSet<String>,
    /// Relative paths excluded regardless of extension.
    pub excluded_files: BTreeSet<String>,
    /// Top-level directories that never contain shippable assets.
    pub excluded_directories: BTreeSet<String>,
    /// Prefix of the derived version string.
    pub version_prefix: String,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        let ext = |s: &str| s.to_string();
        Self {
            allowed_extensions: [
                ".html", ".css", ".js", ".json", ".txt", ".pdf", ".png", ".jpg", ".jpeg",
                ".gif", ".svg", ".webp", ".ico", ".csv", ".ttf", ".woff", ".woff2", ".otf",
                ".mp3", ".mp4", ".wav", ".webm",
            ]
            .into_iter()
            .map(ext)
            .collect(),
            always_include: [MANIFEST_FILE_NAME, "index.html"].into_iter().map(ext).collect(),
            excluded_files: ["package.json", "package-lock.json"]
                .into_iter()
                .map(ext)
                .collect(),
            excluded_directories: ["node_modules", ".git", ".github", "__tests__", "tools"]
                .into_iter()
                .map(ext)
                .collect(),
            version_prefix: "satchel-cache-".to_string(),
        }
    }
}

fn extension_of(relative: &str) -> String {
    let name = relative.rsplit('/').next().unwrap_or(relative);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!(".{}", ext.to_ascii_lowercase()),
        _ => String::new(),
    }
}

fn collect_files(root: &Path, options: &GenerateOptions) -> Result<Vec<String>, OfflineError> {
    let mut files = BTreeSet::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 0 {
            return true;
        }
        // Dot-entries stay out, apart from the well-known directory.
        if name.starts_with('.') && name != ".well-known" {
            return false;
        }
        if entry.depth() == 1
            && entry.file_type().is_dir()
            && options.excluded_directories.contains(name.as_ref())
        {
            return false;
        }
        true
    });

    for entry in walker {
        let entry = entry.map_err(|err| OfflineError::Worker(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| OfflineError::Worker(err.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if options.excluded_files.contains(&relative) {
            continue;
        }
        if options.always_include.contains(&relative)
            || options.allowed_extensions.contains(&extension_of(&relative))
        {
            files.insert(relative);
        }
    }
    Ok(files.into_iter().collect())
}

/// Walk `root` and build a manifest for it.
///
/// The version is the prefix plus the first 16 hex characters of a
/// SHA-256 over every collected file's path and contents (the manifest
/// file itself excluded, since it is the output). The asset list is
/// sorted and duplicate-free, and always carries the site root (`./`)
/// and the manifest itself.
pub fn generate_manifest(
    root: &Path,
    options: &GenerateOptions,
) -> Result<AssetManifest, OfflineError> {
    let files = collect_files(root, options)?;

    let mut hasher = Sha256::new();
    for relative in &files {
        if relative == MANIFEST_FILE_NAME {
            continue;
        }
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(root.join(relative))?);
    }
    let digest = hasher.finalize();
    let short: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

    let mut assets = BTreeSet::new();
    assets.insert("./".to_string());
    assets.insert(format!("./{MANIFEST_FILE_NAME}"));
    for relative in &files {
        if relative != MANIFEST_FILE_NAME {
            assets.insert(format!("./{relative}"));
        }
    }

    Ok(AssetManifest {
        version: format!("{}{short}", options.version_prefix),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        assets: assets.into_iter().collect(),
    })
}

/// Write a manifest to `<root>/asset-manifest.json`, pretty-printed with
/// a trailing newline.
pub fn write_manifest(root: &Path, manifest: &AssetManifest) -> Result<(), OfflineError> {
    let mut body = serde_json::to_string_pretty(manifest)?;
    body.push('\n');
    fs::write(root.join(MANIFEST_FILE_NAME), body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        fs::write(root.join("index.html"), "<html></html>").expect("write");
        fs::create_dir_all(root.join("styles")).expect("mkdir");
        fs::write(root.join("styles/main.css"), "body {}").expect("write");
        fs::write(root.join("notes.md"), "not cacheable").expect("write");
        fs::write(root.join("package.json"), "{}").expect("write");
        fs::create_dir_all(root.join("node_modules/dep")).expect("mkdir");
        fs::write(root.join("node_modules/dep/index.js"), "x").expect("write");
        fs::create_dir_all(root.join(".git")).expect("mkdir");
        fs::write(root.join(".git/config"), "x").expect("write");
        dir
    }

    #[test]
    fn collects_only_cacheable_files() {
        let dir = site();
        let manifest =
            generate_manifest(dir.path(), &GenerateOptions::default()).expect("generate");

        assert_eq!(
            vec![
                "./".to_string(),
                "./asset-manifest.json".to_string(),
                "./index.html".to_string(),
                "./styles/main.css".to_string(),
            ],
            manifest.assets
        );
        assert!(manifest.version.starts_with("satchel-cache-"));
        assert_eq!("satchel-cache-".len() + 16, manifest.version.len());
    }

    #[test]
    fn assets_are_duplicate_free() {
        let dir = site();
        let manifest =
            generate_manifest(dir.path(), &GenerateOptions::default()).expect("generate");
        let unique: HashSet<&String> = manifest.assets.iter().collect();
        assert_eq!(unique.len(), manifest.assets.len());
    }

    #[test]
    fn version_tracks_content() {
        let dir = site();
        let options = GenerateOptions::default();
        let before = generate_manifest(dir.path(), &options).expect("generate");

        // Same bytes, same version.
        let again = generate_manifest(dir.path(), &options).expect("generate");
        assert_eq!(before.version, again.version);

        fs::write(dir.path().join("styles/main.css"), "body { margin: 0 }").expect("write");
        let after = generate_manifest(dir.path(), &options).expect("generate");
        assert_ne!(before.version, after.version);
    }

    #[test]
    fn writing_the_manifest_does_not_change_the_version() {
        let dir = site();
        let options = GenerateOptions::default();
        let manifest = generate_manifest(dir.path(), &options).expect("generate");
        write_manifest(dir.path(), &manifest).expect("write");

        let regenerated = generate_manifest(dir.path(), &options).expect("regenerate");
        assert_eq!(manifest.version, regenerated.version);
        assert_eq!(manifest.assets, regenerated.assets);
    }
}
