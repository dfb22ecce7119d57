//! Journal events recorded while a pipeline runs.
//!
//! The completion ledger is the source of truth for what is installed;
//! these events only record what a particular run did, for `vmsetup runs`
//! and `vmsetup show`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a run's journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Step name (if applicable)
    pub step_id: Option<String>,

    /// Pipeline name (set on run-level events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub payload_summary: String,

    /// Status of the step/run after this event
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Error message if something failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step_id: Option<String>,
        event_type: EventType,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step_id,
            pipeline: None,
            event_type,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    /// Attach the pipeline name
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// Every step ended skipped or completed
    RunCompleted,

    /// A step failed and the run halted
    RunFailed,

    /// The ledger already had the step
    StepSkipped,

    /// The step's action is about to run
    StepStarted,

    /// An attempt failed and another one follows
    StepRetrying,

    /// The step was satisfied from the artifact cache
    StepRestored,

    /// The step's action succeeded and the ledger was marked
    StepCompleted,

    /// The step failed; the ledger was not marked
    StepFailed,

    /// A cache restore failed and the step fell back to a full build
    CacheRestoreFailed,

    /// A freshly built artifact was stored in the cache
    CacheStored,

    /// Storing a freshly built artifact failed (non-fatal)
    CacheStoreFailed,
}

/// Status of a step or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet evaluated
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully (action ran or cache restored)
    Completed,

    /// Failed (with error)
    Failed,

    /// Skipped (ledger marker present)
    Skipped,

    /// Never evaluated because an earlier step failed
    NotAttempted,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::NotAttempted => "not attempted",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("docker".to_string()),
            EventType::StepStarted,
            "Starting docker step".to_string(),
            StepStatus::Running,
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"step_started\""));
        assert!(!json.contains("pipeline"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.status, StepStatus::Running);
    }

    #[test]
    fn test_event_with_duration_and_error() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("ruby".to_string()),
            EventType::StepFailed,
            "Step 'ruby' failed".to_string(),
            StepStatus::Failed,
        )
        .with_duration(1500)
        .with_error("exit code 1".to_string());

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error, Some("exit code 1".to_string()));
    }
}
