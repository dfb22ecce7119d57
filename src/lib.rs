//! vmsetup - Resumable, idempotent machine provisioning
//!
//! Runs an ordered list of provisioning steps (install a toolchain, clone
//! a repository, configure a service) so that re-running after a partial
//! failure resumes at the first incomplete step.
//!
//! # Architecture
//!
//! - A completion ledger records each finished step as a durable marker;
//!   the marker is the last write of a successful step
//! - An optional artifact cache restores expensive build outputs keyed by
//!   (tool, version, arch) instead of rebuilding them
//! - The runner halts on the first failure and reports the remaining
//!   steps as not attempted
//! - Every run is journaled as JSONL events for later inspection
//!
//! # Modules
//!
//! - `adapters`: Shell step actions and the tool version probe
//! - `core`: Ledger, cache, steps, pipelines, journal and runner
//! - `domain`: Data structures (Event, PipelineResult, DiscoveredEnv)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Provision using pipelines/provision.yaml
//! vmsetup run
//!
//! # See which steps are done
//! vmsetup status
//!
//! # Force a step to run again
//! vmsetup reset ruby
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{EnvironmentProbe, ShellAction};
pub use core::{
    ArtifactCache, CacheKey, DirCache, Ledger, MarkerLedger, Pipeline, PipelineRunner, Step,
    StepAction,
};
pub use domain::{DiscoveredEnv, FailureKind, PipelineResult, StepOutcome};
