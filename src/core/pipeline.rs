//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as an ordered list of shell steps. Each
//! step may declare an artifact cache entry, environment exports for the
//! steps after it, a retry policy and a timeout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::{ShellAction, ToolProbe};
use crate::domain::environment::{expand_home, expand_home_str};
use crate::domain::DiscoveredEnv;

use super::cache::CacheKey;
use super::step::{validate_step_names, CacheSpec, RetryPolicy, Step};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI and the journal)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tools to report in the summary (defaults apply when empty)
    #[serde(default)]
    pub tools: Vec<ToolProbe>,

    /// Ordered list of steps to execute
    pub steps: Vec<StepDef>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Pipeline must have at least one step");
        }

        validate_step_names(self.steps.iter().map(|s| s.name.as_str()))?;

        for step in &self.steps {
            if step.run.trim().is_empty() {
                anyhow::bail!("Step '{}' has an empty run script", step.name);
            }

            if let Some(ref cache) = step.cache {
                if cache.path.trim().is_empty() {
                    anyhow::bail!("Step '{}' declares a cache without a path", step.name);
                }
                // Arch is filled in at run time; check the declared parts only
                CacheKey::new(&cache.tool, &cache.version, "any")
                    .validate()
                    .with_context(|| format!("Step '{}' has an invalid cache key", step.name))?;
            }

            if step.retry_policy.max_attempts == 0 {
                anyhow::bail!("Step '{}' must allow at least one attempt", step.name);
            }
        }

        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Get the index of a step by name
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Build runnable steps
    pub fn build_steps(&self, shell: &str, arch: &str) -> Vec<Step> {
        self.steps
            .iter()
            .map(|def| def.build(shell, arch))
            .collect()
    }
}

/// A single step in a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name (unique within pipeline, never renamed)
    pub name: String,

    /// Shell script to run
    pub run: String,

    /// Artifact cache declaration
    #[serde(default)]
    pub cache: Option<CacheDef>,

    /// Environment made visible to later steps
    #[serde(default)]
    pub exports: ExportsDef,

    /// Retry policy for this step
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Kill the script after this many seconds (no limit if unset)
    pub timeout_seconds: Option<u64>,
}

impl StepDef {
    /// Environment exported by this step, with `~` expanded
    pub fn exports_env(&self) -> DiscoveredEnv {
        DiscoveredEnv {
            path: self.exports.path.iter().map(|p| expand_home(p)).collect(),
            vars: self
                .exports
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand_home_str(v)))
                .collect(),
        }
    }

    /// Cache declaration for the given host architecture
    pub fn cache_spec(&self, arch: &str) -> Option<CacheSpec> {
        self.cache.as_ref().map(|cache| CacheSpec {
            key: CacheKey::new(&cache.tool, &cache.version, arch),
            path: expand_home(&cache.path),
        })
    }

    fn build(&self, shell: &str, arch: &str) -> Step {
        let mut action = ShellAction::new(&self.run).with_shell(shell);
        if let Some(seconds) = self.timeout_seconds {
            action = action.with_timeout(Duration::from_secs(seconds));
        }

        let mut step = Step::new(&self.name, Arc::new(action))
            .with_exports(self.exports_env())
            .with_retry_policy(self.retry_policy.clone());
        step.cache = self.cache_spec(arch);
        step
    }
}

/// Cache declaration in a pipeline file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDef {
    pub tool: String,
    pub version: String,

    /// Installed artifact directory (`~/` allowed)
    pub path: String,
}

/// Environment exports in a pipeline file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportsDef {
    /// PATH entries, highest priority first
    #[serde(default)]
    pub path: Vec<String>,

    /// Variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Resolve a pipeline argument to a file.
///
/// Accepts a path to a YAML file, or a name looked up as
/// `<pipelines_dir>/<name>.yaml` and then `./<name>.yaml`.
pub fn resolve_pipeline_path(name_or_path: &str, pipelines_dir: &Path) -> Result<PathBuf> {
    let direct = PathBuf::from(name_or_path);
    if direct.is_file() {
        return Ok(direct);
    }

    let in_dir = pipelines_dir.join(format!("{}.yaml", name_or_path));
    if in_dir.is_file() {
        return Ok(in_dir);
    }

    let alt_path = PathBuf::from(format!("{}.yaml", name_or_path));
    if alt_path.is_file() {
        return Ok(alt_path);
    }

    anyhow::bail!(
        "Pipeline '{}' not found. Looked for:\n  - {}\n  - {}",
        name_or_path,
        in_dir.display(),
        alt_path.display()
    )
}

/// Load and validate a pipeline by name or path
pub fn load_pipeline(name_or_path: &str, pipelines_dir: &Path) -> Result<Pipeline> {
    let path = resolve_pipeline_path(name_or_path, pipelines_dir)?;
    let pipeline = Pipeline::from_file(&path)?;
    pipeline.validate()?;
    Ok(pipeline)
}
