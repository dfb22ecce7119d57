//! Discovered environment threaded through a pipeline run.
//!
//! Steps that install tools (a version manager, a language runtime) make
//! them visible to later steps by exporting PATH entries and variables.
//! Instead of mutating the process environment, the runner accumulates
//! those exports into a `DiscoveredEnv` and hands it to every action.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment contributions accumulated from completed steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEnv {
    /// Extra search path entries, highest priority first
    #[serde(default)]
    pub path: Vec<PathBuf>,

    /// Variables to set for subsequent actions
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl DiscoveredEnv {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a search path entry
    pub fn with_path(mut self, entry: impl Into<PathBuf>) -> Self {
        self.path.push(entry.into());
        self
    }

    /// Add a variable
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// True if nothing has been discovered
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.vars.is_empty()
    }

    /// Merge the exports of a later step into this environment.
    ///
    /// Path entries from `other` take priority over entries already
    /// present; variables from `other` override existing ones.
    pub fn merge(&mut self, other: &DiscoveredEnv) {
        if !other.path.is_empty() {
            let mut merged: Vec<PathBuf> = other.path.clone();
            for entry in self.path.drain(..) {
                if !merged.contains(&entry) {
                    merged.push(entry);
                }
            }
            self.path = merged;
        }

        for (key, value) in &other.vars {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    /// Build a PATH value: discovered entries first, then `base`
    pub fn search_path(&self, base: Option<OsString>) -> OsString {
        let mut entries: Vec<PathBuf> = self.path.clone();
        if let Some(ref base) = base {
            entries.extend(std::env::split_paths(base));
        }
        // Joining only fails when an entry itself contains a separator
        std::env::join_paths(entries).unwrap_or_else(|_| base.unwrap_or_default())
    }

    /// Apply this environment to a command about to be spawned
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        if !self.path.is_empty() {
            cmd.env("PATH", self.search_path(std::env::var_os("PATH")));
        }
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

/// Expand a leading `~` or `~/` to the user's home directory
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Expand `~/` inside a variable value (only at the start)
pub fn expand_home_str(raw: &str) -> String {
    if raw == "~" || raw.starts_with("~/") {
        expand_home(raw).to_string_lossy().into_owned()
    } else {
        raw.to_string()
    }
}
