//! Steps: named, idempotent units of provisioning work.
//!
//! A step's position in the list it is registered in is its only ordering
//! constraint. The name is the ledger key and must stay stable across
//! releases of a pipeline.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::DiscoveredEnv;

use super::cache::CacheKey;
use super::ledger::validate_step_name;

/// The side-effecting work of a step.
///
/// Actions may be invoked again after a crash left their effects partially
/// applied, so they must tolerate a partially prepared target.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Perform the work with the environment discovered so far
    async fn execute(&self, env: &DiscoveredEnv) -> Result<()>;

    /// Short description for logs
    fn describe(&self) -> String {
        "action".to_string()
    }
}

/// Artifact cache declaration for a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSpec {
    /// Identity of the cached artifact
    pub key: CacheKey,

    /// Where the built artifact lives (store source, restore destination)
    pub path: PathBuf,
}

/// A single step in a pipeline
#[derive(Clone)]
pub struct Step {
    /// Step name (unique within pipeline, ledger key)
    pub name: String,

    /// Work to perform
    pub action: Arc<dyn StepAction>,

    /// Optional artifact cache entry
    pub cache: Option<CacheSpec>,

    /// Environment made visible to later steps once this one is done
    pub exports: DiscoveredEnv,

    /// Attempts made before the step is reported failed
    pub retry_policy: RetryPolicy,
}

impl Step {
    pub fn new(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            action,
            cache: None,
            exports: DiscoveredEnv::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Declare an artifact cache entry for this step
    pub fn with_cache(mut self, key: CacheKey, path: impl Into<PathBuf>) -> Self {
        self.cache = Some(CacheSpec {
            key,
            path: path.into(),
        });
        self
    }

    /// Declare environment exports
    pub fn with_exports(mut self, exports: DiscoveredEnv) -> Self {
        self.exports = exports;
        self
    }

    /// Override the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("action", &self.action.describe())
            .field("cache", &self.cache)
            .field("exports", &self.exports)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Check names are valid ledger keys and unique within the list
pub fn validate_step_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();

    for (i, name) in names.into_iter().enumerate() {
        validate_step_name(name).with_context(|| format!("Step {} has an invalid name", i))?;
        if !seen.insert(name) {
            anyhow::bail!("Duplicate step name '{}'", name);
        }
    }

    Ok(())
}

/// Retry policy for a failing action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy making `max_attempts` attempts with no delay in between
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
