//! Core orchestration logic.
//!
//! This module contains:
//! - Ledger: durable completion markers
//! - Cache: optional artifact cache
//! - Step: units of work and retry policy
//! - Pipeline: YAML pipeline definitions and loading
//! - Journal: append-only record of each run
//! - Runner: main execution engine

pub mod cache;
pub mod journal;
pub mod ledger;
pub mod pipeline;
pub mod runner;
pub mod step;

// Re-export commonly used types
pub use cache::{host_arch, ArtifactCache, CacheError, CacheKey, CacheManifest, DirCache};
pub use journal::{list_runs, recent_runs, RunJournal};
pub use ledger::{validate_step_name, Ledger, LedgerError, MarkerLedger};
pub use pipeline::{load_pipeline, Pipeline, StepDef};
pub use runner::PipelineRunner;
pub use step::{validate_step_names, CacheSpec, RetryPolicy, Step, StepAction};
