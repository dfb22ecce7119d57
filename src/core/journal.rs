//! Append-only run journal with file-based persistence.
//!
//! Each run gets `<runs_dir>/<run_id>/events.jsonl`, one JSON event per
//! line, for later inspection with `vmsetup runs` and `vmsetup show`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, RunRecord};

/// File-based journal for one run
#[derive(Debug, Clone)]
pub struct RunJournal {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl RunJournal {
    /// Create or open the journal for a run
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            // A line cut short by a crash is dropped rather than failing the replay
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable journal line"),
            }
        }

        Ok(events)
    }

    /// Reconstruct the run recorded in this journal
    pub async fn record(&self) -> Result<Option<RunRecord>> {
        let events = self.replay().await?;
        Ok(RunRecord::from_events(&events))
    }
}

/// List all run IDs in the runs directory
pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs = Vec::new();
    let mut entries = fs::read_dir(runs_dir)
        .await
        .with_context(|| format!("Failed to read runs directory: {}", runs_dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(uuid) = Uuid::parse_str(name) {
                    runs.push(uuid);
                }
            }
        }
    }

    Ok(runs)
}

/// Load recorded runs, most recent first
pub async fn recent_runs(runs_dir: &Path, limit: usize) -> Result<Vec<RunRecord>> {
    let mut records = Vec::new();

    for run_id in list_runs(runs_dir).await? {
        let journal = RunJournal::open(runs_dir, run_id).await?;
        if let Some(record) = journal.record().await? {
            records.push(record);
        }
    }

    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    records.truncate(limit);

    Ok(records)
}
