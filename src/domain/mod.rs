//! Domain types for the vmsetup pipeline.
//!
//! - Environment: exports accumulated across steps
//! - Events: journal records of what a run did
//! - Run: per-run results and reconstructed history

pub mod environment;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use environment::{expand_home, DiscoveredEnv};
pub use events::{Event, EventType, StepStatus};
pub use run::{
    FailureKind, PipelineResult, RunRecord, RunState, StepFailure, StepOutcome, StepReport,
};
