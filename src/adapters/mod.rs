//! Adapters to the machine being provisioned.
//!
//! - `shell`: step actions that run shell scripts
//! - `probe`: read-only tool version queries for the run summary

pub mod probe;
pub mod shell;

pub use probe::{EnvironmentProbe, ToolProbe, ToolVersion, DEFAULT_TOOLS};
pub use shell::{ShellAction, DEFAULT_SHELL};
