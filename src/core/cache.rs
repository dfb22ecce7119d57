//! Artifact cache for expensive build outputs.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<tool>-<version>-<arch>/payload.tar.gz
//! <root>/<tool>-<version>-<arch>/manifest.json
//! ```
//!
//! The manifest is written last and carries the payload's SHA-256, so an
//! entry is either absent, complete, or detectably corrupt. A missing root
//! directory means the cache is unavailable for the whole run.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

const PAYLOAD_FILE: &str = "payload.tar.gz";
const MANIFEST_FILE: &str = "manifest.json";

/// Semantic identity of a cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub tool: String,
    pub version: String,
    pub arch: String,
}

impl CacheKey {
    pub fn new(
        tool: impl Into<String>,
        version: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            version: version.into(),
            arch: arch.into(),
        }
    }

    /// Key for the machine we are running on
    pub fn for_host(tool: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(tool, version, host_arch())
    }

    /// Check each component is safe to use in a directory name
    pub fn validate(&self) -> Result<(), CacheError> {
        for part in [&self.tool, &self.version, &self.arch] {
            let valid = !part.is_empty()
                && !part.starts_with('.')
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
            if !valid {
                return Err(CacheError::InvalidKey(part.to_string()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.tool, self.version, self.arch)
    }
}

/// Host architecture in the naming used for cache keys
pub fn host_arch() -> String {
    normalize_arch(std::env::consts::ARCH)
}

/// Map Rust target arch names to distro-style names
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "aarch64" => "arm64".to_string(),
        "x86_64" => "amd64".to_string(),
        other => other.to_string(),
    }
}

/// Cache failures. None of these fail a step.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache entry not found: {0}")]
    Miss(String),

    #[error("Cache entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Failed to restore {key} into place: {reason}")]
    RestoreFailed { key: String, reason: String },

    #[error("Failed to store cache entry {key}: {reason}")]
    StoreFailed { key: String, reason: String },

    #[error("Invalid cache key component: '{0}'")]
    InvalidKey(String),
}

/// Optional store of prebuilt artifacts
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Whether the cache exists at all
    async fn available(&self) -> bool;

    /// Whether a complete entry exists for `key`
    async fn has(&self, key: &CacheKey) -> bool;

    /// Replace `destination` with the cached artifact
    async fn restore(&self, key: &CacheKey, destination: &Path) -> Result<(), CacheError>;

    /// Capture `source` as the artifact for `key`
    async fn store(&self, key: &CacheKey, source: &Path) -> Result<(), CacheError>;
}

/// Manifest stored next to each payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub key: CacheKey,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Directory-backed artifact cache
#[derive(Debug, Clone)]
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory dedicated to one key
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_string())
    }

    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(PAYLOAD_FILE)
    }

    pub fn manifest_path(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(MANIFEST_FILE)
    }

    /// List complete entries (unreadable manifests are skipped)
    pub async fn entries(&self) -> Result<Vec<CacheManifest>> {
        let mut manifests = Vec::new();

        if !self.root.is_dir() {
            return Ok(manifests);
        }

        let mut dirs = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read cache root: {}", self.root.display()))?;

        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let manifest_path = entry.path().join(MANIFEST_FILE);
            let Ok(content) = fs::read_to_string(&manifest_path).await else {
                continue;
            };
            match serde_json::from_str::<CacheManifest>(&content) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "Skipping unreadable cache manifest")
                }
            }
        }

        manifests.sort_by_key(|m| m.key.to_string());
        Ok(manifests)
    }
}

#[async_trait]
impl ArtifactCache for DirCache {
    async fn available(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    async fn has(&self, key: &CacheKey) -> bool {
        if key.validate().is_err() {
            return false;
        }
        is_file(&self.manifest_path(key)).await && is_file(&self.payload_path(key)).await
    }

    async fn restore(&self, key: &CacheKey, destination: &Path) -> Result<(), CacheError> {
        key.validate()?;

        let name = key.to_string();
        let key = key.clone();
        let payload = self.payload_path(&key);
        let manifest = self.manifest_path(&key);
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || {
            restore_blocking(&key, &payload, &manifest, &destination)
        })
        .await
        .map_err(|e| CacheError::RestoreFailed {
            key: name,
            reason: e.to_string(),
        })?
    }

    async fn store(&self, key: &CacheKey, source: &Path) -> Result<(), CacheError> {
        key.validate()?;

        let name = key.to_string();
        let key = key.clone();
        let entry_dir = self.entry_dir(&key);
        let payload = self.payload_path(&key);
        let manifest = self.manifest_path(&key);
        let source = source.to_path_buf();

        tokio::task::spawn_blocking(move || {
            match verify_entry(&key, &payload, &manifest) {
                Ok(_) => {
                    debug!(%key, "Valid cache entry already present, not overwriting");
                    return Ok(());
                }
                Err(CacheError::Miss(_)) => {}
                Err(e) => warn!(%key, error = %e, "Replacing corrupt cache entry"),
            }
            store_blocking(&key, &entry_dir, &source)
        })
        .await
        .map_err(|e| CacheError::StoreFailed {
            key: name,
            reason: e.to_string(),
        })?
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Check that the manifest matches `key` and the payload digest
fn verify_entry(
    key: &CacheKey,
    payload: &Path,
    manifest_path: &Path,
) -> Result<CacheManifest, CacheError> {
    let name = key.to_string();
    let corrupt = |reason: String| CacheError::Corrupt {
        key: name.clone(),
        reason,
    };

    let content = match std::fs::read_to_string(manifest_path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CacheError::Miss(name.clone()))
        }
        Err(e) => return Err(corrupt(format!("unreadable manifest: {}", e))),
    };
    let manifest: CacheManifest = serde_json::from_str(&content)
        .map_err(|e| corrupt(format!("invalid manifest: {}", e)))?;

    if manifest.key != *key {
        return Err(corrupt(format!("manifest is for {}", manifest.key)));
    }

    let (digest, _) = file_digest(payload).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            corrupt("payload missing".to_string())
        } else {
            corrupt(format!("unreadable payload: {}", e))
        }
    })?;
    if digest != manifest.sha256 {
        return Err(corrupt(format!(
            "checksum mismatch (expected {}, found {})",
            manifest.sha256, digest
        )));
    }

    Ok(manifest)
}

fn restore_blocking(
    key: &CacheKey,
    payload: &Path,
    manifest_path: &Path,
    destination: &Path,
) -> Result<(), CacheError> {
    let name = key.to_string();
    let corrupt = |reason: String| CacheError::Corrupt {
        key: name.clone(),
        reason,
    };
    let failed = |reason: String| CacheError::RestoreFailed {
        key: name.clone(),
        reason,
    };

    verify_entry(key, payload, manifest_path)?;

    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .map_err(|e| failed(format!("cannot create {}: {}", parent.display(), e)))?;

    // Unpack beside the destination so the final rename stays on one filesystem
    let staging = tempfile::Builder::new()
        .prefix(".vmsetup-restore-")
        .tempdir_in(&parent)
        .map_err(|e| failed(format!("cannot create staging dir: {}", e)))?;

    let file = File::open(payload).map_err(|e| corrupt(format!("unreadable payload: {}", e)))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive
        .unpack(staging.path())
        .map_err(|e| corrupt(format!("unpack failed: {}", e)))?;

    // Whatever a crashed build left at the destination is replaced wholesale
    match std::fs::symlink_metadata(destination) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(destination),
        Ok(_) => std::fs::remove_file(destination),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
    .map_err(|e| failed(format!("cannot clear {}: {}", destination.display(), e)))?;

    std::fs::rename(staging.path(), destination)
        .map_err(|e| failed(format!("cannot move into {}: {}", destination.display(), e)))?;

    info!(key = %name, destination = %destination.display(), "Restored artifact from cache");
    Ok(())
}

fn store_blocking(key: &CacheKey, entry_dir: &Path, source: &Path) -> Result<(), CacheError> {
    let name = key.to_string();
    let failed = |reason: String| CacheError::StoreFailed {
        key: name.clone(),
        reason,
    };

    let meta = std::fs::metadata(source)
        .map_err(|e| failed(format!("cannot read source {}: {}", source.display(), e)))?;
    if !meta.is_dir() {
        return Err(failed(format!("source {} is not a directory", source.display())));
    }

    std::fs::create_dir_all(entry_dir).map_err(|e| failed(e.to_string()))?;

    let mut payload = tempfile::Builder::new()
        .prefix(".payload-")
        .tempfile_in(entry_dir)
        .map_err(|e| failed(e.to_string()))?;

    {
        let encoder = GzEncoder::new(payload.as_file_mut(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", source)
            .map_err(|e| failed(format!("archive failed: {}", e)))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| failed(format!("archive failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| failed(format!("compression failed: {}", e)))?;
    }
    payload
        .as_file()
        .sync_all()
        .map_err(|e| failed(e.to_string()))?;

    let (sha256, size_bytes) = file_digest(payload.path()).map_err(|e| failed(e.to_string()))?;

    // Drop any stale manifest first so a reader never pairs it with the new payload
    match std::fs::remove_file(entry_dir.join(MANIFEST_FILE)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(failed(format!("cannot clear old manifest: {}", e))),
    }

    payload
        .persist(entry_dir.join(PAYLOAD_FILE))
        .map_err(|e| failed(e.error.to_string()))?;

    let manifest = CacheManifest {
        key: key.clone(),
        sha256,
        size_bytes,
        created_at: Utc::now(),
    };
    let body = serde_json::to_vec_pretty(&manifest).map_err(|e| failed(e.to_string()))?;

    let mut manifest_tmp = tempfile::Builder::new()
        .prefix(".manifest-")
        .tempfile_in(entry_dir)
        .map_err(|e| failed(e.to_string()))?;
    manifest_tmp
        .write_all(&body)
        .map_err(|e| failed(e.to_string()))?;
    manifest_tmp
        .as_file()
        .sync_all()
        .map_err(|e| failed(e.to_string()))?;
    manifest_tmp
        .persist(entry_dir.join(MANIFEST_FILE))
        .map_err(|e| failed(e.error.to_string()))?;

    info!(key = %name, size_bytes, "Stored artifact in cache");
    Ok(())
}

/// SHA-256 (hex) and size of a file
fn file_digest(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> CacheKey {
        CacheKey::new("ruby", "3.3.0", "arm64")
    }

    fn build_artifact(dir: &Path) {
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("bin/ruby"), b"#!/bin/sh\necho ruby 3.3.0\n").unwrap();
        std::fs::write(dir.join("VERSION"), b"3.3.0").unwrap();
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key().to_string(), "ruby-3.3.0-arm64");
    }

    #[test]
    fn test_key_validation() {
        assert!(key().validate().is_ok());
        assert!(CacheKey::new("ruby", "../x", "arm64").validate().is_err());
        assert!(CacheKey::new("", "1", "arm64").validate().is_err());
        assert!(CacheKey::new("node", "20.1.0", "a/b").validate().is_err());
    }

    #[test]
    fn test_arch_normalization() {
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[tokio::test]
    async fn test_missing_root_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("nope"));

        assert!(!cache.available().await);
        assert!(!cache.has(&key()).await);
        assert!(cache.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_then_restore() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("cache"));
        std::fs::create_dir_all(cache.root()).unwrap();

        let built = temp.path().join("build/3.3.0");
        build_artifact(&built);

        cache.store(&key(), &built).await.unwrap();
        assert!(cache.has(&key()).await);

        let dest = temp.path().join("home/.rbenv/versions/3.3.0");
        cache.restore(&key(), &dest).await.unwrap();

        assert_eq!(std::fs::read(dest.join("VERSION")).unwrap(), b"3.3.0");
        assert!(dest.join("bin/ruby").is_file());

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key());
    }

    #[tokio::test]
    async fn test_restore_replaces_partial_destination() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("cache"));
        let built = temp.path().join("build");
        build_artifact(&built);
        cache.store(&key(), &built).await.unwrap();

        let dest = temp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("half-extracted.tmp"), b"junk").unwrap();

        cache.restore(&key(), &dest).await.unwrap();

        assert!(!dest.join("half-extracted.tmp").exists());
        assert!(dest.join("VERSION").is_file());
    }

    #[tokio::test]
    async fn test_tampered_payload_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("cache"));
        let built = temp.path().join("build");
        build_artifact(&built);
        cache.store(&key(), &built).await.unwrap();

        std::fs::write(cache.payload_path(&key()), b"not a tarball").unwrap();

        let dest = temp.path().join("dest");
        let err = cache.restore(&key(), &dest).await.unwrap_err();

        assert!(matches!(err, CacheError::Corrupt { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_restore_missing_entry_is_miss() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path());

        let err = cache
            .restore(&key(), &temp.path().join("dest"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Miss(_)));
    }

    #[tokio::test]
    async fn test_store_existing_key_is_noop() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("cache"));
        let built = temp.path().join("build");
        build_artifact(&built);

        cache.store(&key(), &built).await.unwrap();
        let first = std::fs::read_to_string(cache.manifest_path(&key())).unwrap();

        std::fs::write(built.join("VERSION"), b"changed").unwrap();
        cache.store(&key(), &built).await.unwrap();
        let second = std::fs::read_to_string(cache.manifest_path(&key())).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_store_replaces_corrupt_entry() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("cache"));
        let built = temp.path().join("build");
        build_artifact(&built);
        cache.store(&key(), &built).await.unwrap();

        std::fs::write(cache.payload_path(&key()), b"not a tarball").unwrap();
        cache.store(&key(), &built).await.unwrap();

        let dest = temp.path().join("dest");
        cache.restore(&key(), &dest).await.unwrap();
        assert_eq!(std::fs::read(dest.join("VERSION")).unwrap(), b"3.3.0");
    }

    #[tokio::test]
    async fn test_store_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let cache = DirCache::new(temp.path().join("cache"));

        let err = cache
            .store(&key(), &temp.path().join("never-built"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StoreFailed { .. }));
        assert!(!cache.has(&key()).await);
    }
}
