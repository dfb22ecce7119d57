//! Run results and run reconstruction from journal events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::environment::DiscoveredEnv;
use super::events::{Event, EventType, StepStatus};

/// Why a step ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum FailureKind {
    /// The step's action returned an error
    #[error("action failed: {0}")]
    ActionFailed(String),

    /// The action succeeded but the ledger marker could not be written
    #[error("ledger write failed: {0}")]
    LedgerWriteFailed(String),
}

/// The step that halted a run, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub kind: FailureKind,
}

/// Terminal outcome of one step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Ledger already had it
    Skipped,
    /// Action ran and the ledger was marked
    Completed,
    /// Satisfied from the artifact cache and the ledger was marked
    Restored,
    /// Action or ledger write failed
    Failed,
    /// An earlier step failed
    NotAttempted,
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Completed => "completed",
            Self::Restored => "restored from cache",
            Self::Failed => "FAILED",
            Self::NotAttempted => "not attempted",
        }
    }
}

/// Per-step line of a run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

/// Result of one `PipelineRunner::run` invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Identifier of this run (journal directory name)
    pub run_id: Uuid,

    /// Steps that reached COMPLETED in this run, including cache restores
    pub completed: Vec<String>,

    /// Subset of `completed` that was restored from the artifact cache
    pub restored: Vec<String>,

    /// Steps the ledger already had
    pub skipped: Vec<String>,

    /// The step that halted the run
    pub failed: Option<StepFailure>,

    /// Steps after the failed one
    pub not_attempted: Vec<String>,

    /// Every step in registration order
    pub reports: Vec<StepReport>,

    /// Environment accumulated from skipped and completed steps
    pub env: DiscoveredEnv,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    pub(crate) fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            completed: Vec::new(),
            restored: Vec::new(),
            skipped: Vec::new(),
            failed: None,
            not_attempted: Vec::new(),
            reports: Vec::new(),
            env: DiscoveredEnv::default(),
            started_at: now,
            finished_at: now,
        }
    }

    /// True if no step failed
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Name of the failed step, if any
    pub fn failed_step(&self) -> Option<&str> {
        self.failed.as_ref().map(|f| f.step.as_str())
    }

    /// Process exit code: non-zero iff a step failed
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub(crate) fn record(&mut self, name: &str, outcome: StepOutcome, duration_ms: u64) {
        match outcome {
            StepOutcome::Skipped => self.skipped.push(name.to_string()),
            StepOutcome::Completed => self.completed.push(name.to_string()),
            StepOutcome::Restored => {
                self.completed.push(name.to_string());
                self.restored.push(name.to_string());
            }
            StepOutcome::NotAttempted => self.not_attempted.push(name.to_string()),
            StepOutcome::Failed => {}
        }
        self.reports.push(StepReport {
            name: name.to_string(),
            outcome,
            duration_ms,
        });
    }
}

/// A past run reconstructed from its journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub pipeline_name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Step statuses in the order steps were first seen
    pub steps: Vec<(String, StepStatus)>,
}

impl RunRecord {
    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut record = Self {
            id: first_event.run_id,
            pipeline_name: String::new(),
            state: RunState::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            steps: Vec::new(),
        };

        for event in events {
            record.apply_event(event);
        }

        Some(record)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(ref pipeline) = event.pipeline {
                    self.pipeline_name = pipeline.clone();
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepSkipped
            | EventType::StepStarted
            | EventType::StepRetrying
            | EventType::StepRestored
            | EventType::StepCompleted
            | EventType::StepFailed => {
                if let Some(ref step_id) = event.step_id {
                    self.set_step_status(step_id, event.status);
                }
            }
            // Cache bookkeeping does not change step status
            EventType::CacheRestoreFailed
            | EventType::CacheStored
            | EventType::CacheStoreFailed => {}
        }
    }

    fn set_step_status(&mut self, step: &str, status: StepStatus) {
        match self.steps.iter_mut().find(|(name, _)| name == step) {
            Some(entry) => entry.1 = status,
            None => self.steps.push((step.to_string(), status)),
        }
    }

    /// Status of a step in this run
    pub fn step_status(&self, step: &str) -> Option<StepStatus> {
        self.steps
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, status)| *status)
    }

    /// Check if the run is still in progress (or was killed mid-run)
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }
}

/// State of a recorded run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Started, no terminal event (still running or interrupted)
    Running,

    /// Every step skipped or completed
    Completed,

    /// Halted on a failed step
    Failed { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { .. } => f.write_str("failed"),
        }
    }
}
