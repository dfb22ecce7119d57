//! Completion ledger: durable markers for finished steps.
//!
//! One marker file per completed step, `<dir>/<name>.done`. Markers are
//! written to a temp file in the same directory, synced, then renamed into
//! place, so a crash never leaves a half-written marker that reads as
//! complete.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

const MARKER_EXTENSION: &str = "done";
const MAX_NAME_LEN: usize = 128;

/// Errors from ledger storage
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid step name '{0}': use letters, digits, '.', '-' or '_'")]
    InvalidName(String),

    #[error("Ledger IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ledger task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable record of completed steps
#[async_trait]
pub trait Ledger: Send + Sync {
    /// True iff a marker exists for `name`. Never errors.
    async fn is_complete(&self, name: &str) -> bool;

    /// Durably record that `name` completed
    async fn mark_complete(&self, name: &str) -> Result<(), LedgerError>;

    /// Forget one step so the next run executes it again
    async fn reset(&self, name: &str) -> Result<(), LedgerError>;

    /// Forget every step
    async fn reset_all(&self) -> Result<(), LedgerError>;

    /// Names of all completed steps, sorted
    async fn completed(&self) -> Result<Vec<String>, LedgerError>;
}

/// Contents of a marker file (informational; presence is what counts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub step: String,
    pub completed_at: DateTime<Utc>,
}

/// Check that a step name can be used as a marker file name
pub fn validate_step_name(name: &str) -> Result<(), LedgerError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidName(name.to_string()))
    }
}

/// Ledger backed by a directory of marker files
#[derive(Debug, Clone)]
pub struct MarkerLedger {
    dir: PathBuf,
}

impl MarkerLedger {
    /// Create a ledger rooted at `dir` (created lazily on first mark)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the markers
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the marker for `name`
    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, MARKER_EXTENSION))
    }

    /// Read a marker's contents, if present
    pub async fn marker(&self, name: &str) -> Result<Option<Marker>, LedgerError> {
        validate_step_name(name)?;
        let path = self.marker_path(name);

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LedgerError::io(&path, e)),
        }
    }
}

#[async_trait]
impl Ledger for MarkerLedger {
    async fn is_complete(&self, name: &str) -> bool {
        if let Err(e) = validate_step_name(name) {
            warn!(step = %name, error = %e, "Treating invalid step name as incomplete");
            return false;
        }

        let path = self.marker_path(name);
        match fs::metadata(&path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(step = %name, path = %path.display(), error = %e, "Cannot read ledger marker");
                false
            }
        }
    }

    async fn mark_complete(&self, name: &str) -> Result<(), LedgerError> {
        validate_step_name(name)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LedgerError::io(&self.dir, e))?;

        let marker = Marker {
            step: name.to_string(),
            completed_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&marker)?;
        let dir = self.dir.clone();
        let path = self.marker_path(name);

        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &body)).await??;

        debug!(step = %name, "Ledger marker written");
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<(), LedgerError> {
        validate_step_name(name)?;
        let path = self.marker_path(name);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LedgerError::io(&path, e)),
        }
    }

    async fn reset_all(&self) -> Result<(), LedgerError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LedgerError::io(&self.dir, e)),
        }
    }

    async fn completed(&self) -> Result<Vec<String>, LedgerError> {
        let mut names = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(LedgerError::io(&self.dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LedgerError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_step_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// temp file in `dir` -> write -> fsync -> rename over `path` -> fsync dir
fn write_atomically(dir: &Path, path: &Path, body: &[u8]) -> Result<(), LedgerError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".marker-")
        .tempfile_in(dir)
        .map_err(|e| LedgerError::io(dir, e))?;

    tmp.write_all(body).map_err(|e| LedgerError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| LedgerError::io(path, e))?;
    tmp.persist(path).map_err(|e| LedgerError::io(path, e.error))?;

    #[cfg(unix)]
    {
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }

    Ok(())
}
