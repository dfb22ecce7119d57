//! Pipeline runner.
//!
//! Evaluates steps strictly in registration order against the completion
//! ledger and the optional artifact cache:
//!
//! ```text
//! PENDING --(ledger says complete)--> SKIPPED
//! PENDING --(cache hit, restore ok)--> COMPLETED (via cache)
//! PENDING --(cache miss or no cache)--> RUNNING
//! RUNNING --(action succeeds)--> COMPLETED (mark ledger)
//! RUNNING --(action fails)--> FAILED (ledger NOT marked)
//! ```
//!
//! The first FAILED step halts the run. The ledger marker is always the
//! last write of a successful step, so re-running resumes at the failed
//! step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    DiscoveredEnv, Event, EventType, FailureKind, PipelineResult, StepFailure, StepOutcome,
    StepStatus,
};

use super::cache::ArtifactCache;
use super::journal::RunJournal;
use super::ledger::Ledger;
use super::step::{validate_step_names, Step};

/// Executes ordered steps with skip / restore / run / fail-fast semantics
pub struct PipelineRunner {
    /// Pipeline name (for logs and the journal)
    name: String,

    /// Completion ledger
    ledger: Arc<dyn Ledger>,

    /// Artifact cache, if configured
    cache: Option<Arc<dyn ArtifactCache>>,

    /// Directory for run journals, if journaling is enabled
    runs_dir: Option<PathBuf>,

    /// Environment visible to the first step
    initial_env: DiscoveredEnv,
}

/// Per-run state shared by step evaluation
struct RunContext {
    run_id: Uuid,
    journal: Option<RunJournal>,

    /// Cache usable for this run (availability checked once, up front)
    cache: Option<Arc<dyn ArtifactCache>>,
}

impl PipelineRunner {
    /// Create a runner with a ledger and no cache
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            name: "pipeline".to_string(),
            ledger,
            cache: None,
            runs_dir: None,
            initial_env: DiscoveredEnv::default(),
        }
    }

    /// Set the pipeline name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Consult an artifact cache before running cacheable steps
    pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record each run under `runs_dir/<run_id>/events.jsonl`
    pub fn with_journal(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Environment handed to the first step
    pub fn with_env(mut self, env: DiscoveredEnv) -> Self {
        self.initial_env = env;
        self
    }

    /// Run the steps in order.
    ///
    /// Returns `Err` only when the step list itself is invalid (bad or
    /// duplicate names); step failures are reported in the result.
    #[instrument(skip(self, steps), fields(pipeline = %self.name))]
    pub async fn run(&self, steps: &[Step]) -> Result<PipelineResult> {
        validate_step_names(steps.iter().map(|s| s.name.as_str()))?;

        let run_id = Uuid::new_v4();
        info!(%run_id, steps = steps.len(), "Starting pipeline run");

        let ctx = RunContext {
            run_id,
            journal: self.open_journal(run_id).await,
            cache: self.usable_cache().await,
        };

        let mut result = PipelineResult::new(run_id);
        let mut env = self.initial_env.clone();

        self.record(
            &ctx,
            Event::new(
                run_id,
                None,
                EventType::RunStarted,
                format!("Pipeline '{}' started", self.name),
                StepStatus::Running,
            )
            .with_pipeline(&self.name),
        )
        .await;

        for (idx, step) in steps.iter().enumerate() {
            let step_start = Instant::now();
            let evaluated = self.evaluate_step(&ctx, step, &env).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match evaluated {
                Ok(outcome) => {
                    env.merge(&step.exports);
                    result.record(&step.name, outcome, duration_ms);
                }
                Err(kind) => {
                    result.record(&step.name, StepOutcome::Failed, duration_ms);
                    result.failed = Some(StepFailure {
                        step: step.name.clone(),
                        kind,
                    });
                    for later in &steps[idx + 1..] {
                        result.record(&later.name, StepOutcome::NotAttempted, 0);
                    }
                    break;
                }
            }
        }

        result.env = env;
        result.finished_at = Utc::now();

        match &result.failed {
            None => {
                info!(
                    skipped = result.skipped.len(),
                    completed = result.completed.len(),
                    restored = result.restored.len(),
                    "Pipeline completed"
                );
                self.record(
                    &ctx,
                    Event::new(
                        run_id,
                        None,
                        EventType::RunCompleted,
                        format!("Pipeline '{}' completed", self.name),
                        StepStatus::Completed,
                    ),
                )
                .await;
            }
            Some(failure) => {
                error!(
                    step = %failure.step,
                    not_attempted = result.not_attempted.len(),
                    "Pipeline halted; re-run to resume from the failed step"
                );
                self.record(
                    &ctx,
                    Event::new(
                        run_id,
                        Some(failure.step.clone()),
                        EventType::RunFailed,
                        format!("Run halted at step '{}'", failure.step),
                        StepStatus::Failed,
                    )
                    .with_error(failure.kind.to_string()),
                )
                .await;
            }
        }

        Ok(result)
    }

    /// Drive one step to a terminal outcome
    async fn evaluate_step(
        &self,
        ctx: &RunContext,
        step: &Step,
        env: &DiscoveredEnv,
    ) -> Result<StepOutcome, FailureKind> {
        if self.ledger.is_complete(&step.name).await {
            info!(step = %step.name, "Step already complete, skipping");
            self.record(
                ctx,
                Event::new(
                    ctx.run_id,
                    Some(step.name.clone()),
                    EventType::StepSkipped,
                    format!("Step '{}' already complete", step.name),
                    StepStatus::Skipped,
                ),
            )
            .await;
            return Ok(StepOutcome::Skipped);
        }

        let restored = self.try_restore(ctx, step).await;

        if !restored {
            let action_start = Instant::now();
            self.execute_with_retry(ctx, step, env).await?;
            let duration_ms = action_start.elapsed().as_millis() as u64;
            debug!(step = %step.name, duration_ms, "Action succeeded");

            self.try_store(ctx, step).await;
        }

        // Marker last: nothing of this step happens after it
        if let Err(e) = self.ledger.mark_complete(&step.name).await {
            error!(step = %step.name, error = %e, "Failed to record step completion");
            self.record(
                ctx,
                Event::new(
                    ctx.run_id,
                    Some(step.name.clone()),
                    EventType::StepFailed,
                    format!("Step '{}' succeeded but could not be recorded", step.name),
                    StepStatus::Failed,
                )
                .with_error(e.to_string()),
            )
            .await;
            return Err(FailureKind::LedgerWriteFailed(e.to_string()));
        }

        let (event_type, summary, outcome) = if restored {
            (
                EventType::StepRestored,
                format!("Step '{}' restored from cache", step.name),
                StepOutcome::Restored,
            )
        } else {
            (
                EventType::StepCompleted,
                format!("Step '{}' completed", step.name),
                StepOutcome::Completed,
            )
        };
        info!(step = %step.name, outcome = outcome.label(), "Step done");
        self.record(
            ctx,
            Event::new(
                ctx.run_id,
                Some(step.name.clone()),
                event_type,
                summary,
                StepStatus::Completed,
            ),
        )
        .await;

        Ok(outcome)
    }

    /// Attempt a cache restore; any failure means "build it"
    async fn try_restore(&self, ctx: &RunContext, step: &Step) -> bool {
        let (Some(spec), Some(cache)) = (&step.cache, &ctx.cache) else {
            return false;
        };

        if !cache.has(&spec.key).await {
            debug!(step = %step.name, key = %spec.key, "Cache miss");
            return false;
        }

        match cache.restore(&spec.key, &spec.path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    step = %step.name,
                    key = %spec.key,
                    error = %e,
                    "Cache restore failed, falling back to full install"
                );
                self.record(
                    ctx,
                    Event::new(
                        ctx.run_id,
                        Some(step.name.clone()),
                        EventType::CacheRestoreFailed,
                        format!("Restore of {} failed", spec.key),
                        StepStatus::Running,
                    )
                    .with_error(e.to_string()),
                )
                .await;
                false
            }
        }
    }

    /// Best-effort capture of a freshly built artifact
    async fn try_store(&self, ctx: &RunContext, step: &Step) {
        let (Some(spec), Some(cache)) = (&step.cache, &ctx.cache) else {
            return;
        };

        let event = match cache.store(&spec.key, &spec.path).await {
            Ok(()) => Event::new(
                ctx.run_id,
                Some(step.name.clone()),
                EventType::CacheStored,
                format!("Stored {} in cache", spec.key),
                StepStatus::Running,
            ),
            Err(e) => {
                warn!(step = %step.name, key = %spec.key, error = %e, "Failed to store artifact in cache");
                Event::new(
                    ctx.run_id,
                    Some(step.name.clone()),
                    EventType::CacheStoreFailed,
                    format!("Could not store {} in cache", spec.key),
                    StepStatus::Running,
                )
                .with_error(e.to_string())
            }
        };
        self.record(ctx, event).await;
    }

    /// Run the action, retrying per the step's policy
    async fn execute_with_retry(
        &self,
        ctx: &RunContext,
        step: &Step,
        env: &DiscoveredEnv,
    ) -> Result<(), FailureKind> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_start = Instant::now();

            info!(step = %step.name, attempt, action = %step.action.describe(), "Running step");
            self.record(
                ctx,
                Event::new(
                    ctx.run_id,
                    Some(step.name.clone()),
                    EventType::StepStarted,
                    format!("Step '{}' attempt {}", step.name, attempt),
                    StepStatus::Running,
                ),
            )
            .await;

            let err = match step.action.execute(env).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            if step.retry_policy.should_retry(attempt) {
                let delay = step.retry_policy.delay_for_attempt(attempt);

                warn!(
                    step = %step.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Step failed, retrying"
                );
                self.record(
                    ctx,
                    Event::new(
                        ctx.run_id,
                        Some(step.name.clone()),
                        EventType::StepRetrying,
                        format!("Step '{}' failed, retrying in {:?}", step.name, delay),
                        StepStatus::Running,
                    )
                    .with_duration(duration_ms)
                    .with_error(format!("{:#}", err)),
                )
                .await;

                tokio::time::sleep(delay).await;
                continue;
            }

            error!(
                step = %step.name,
                attempt,
                error = %err,
                "Step failed permanently"
            );
            self.record(
                ctx,
                Event::new(
                    ctx.run_id,
                    Some(step.name.clone()),
                    EventType::StepFailed,
                    format!("Step '{}' failed after {} attempt(s)", step.name, attempt),
                    StepStatus::Failed,
                )
                .with_duration(duration_ms)
                .with_error(format!("{:#}", err)),
            )
            .await;

            return Err(FailureKind::ActionFailed(format!("{:#}", err)));
        }
    }

    /// The cache to use for this run, decided once
    async fn usable_cache(&self) -> Option<Arc<dyn ArtifactCache>> {
        let cache = self.cache.as_ref()?;
        if cache.available().await {
            debug!("Artifact cache available");
            Some(Arc::clone(cache))
        } else {
            info!("Artifact cache not available; cacheable steps will build from scratch");
            None
        }
    }

    async fn open_journal(&self, run_id: Uuid) -> Option<RunJournal> {
        let runs_dir = self.runs_dir.as_ref()?;
        match RunJournal::open(runs_dir, run_id).await {
            Ok(journal) => Some(journal),
            Err(e) => {
                warn!(error = %e, "Run journal unavailable; continuing without it");
                None
            }
        }
    }

    /// Journal writes never affect the run
    async fn record(&self, ctx: &RunContext, event: Event) {
        if let Some(journal) = &ctx.journal {
            if let Err(e) = journal.append(&event).await {
                warn!(error = %e, "Failed to write journal event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::MarkerLedger;
    use crate::core::step::StepAction;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Exports;

    #[async_trait]
    impl StepAction for Exports {
        async fn execute(&self, _env: &DiscoveredEnv) -> Result<()> {
            Ok(())
        }
    }

    /// Fails unless the discovered env carries the variable
    struct NeedsVar(&'static str);

    #[async_trait]
    impl StepAction for NeedsVar {
        async fn execute(&self, env: &DiscoveredEnv) -> Result<()> {
            if env.vars.contains_key(self.0) {
                Ok(())
            } else {
                anyhow::bail!("{} not set", self.0)
            }
        }
    }

    #[tokio::test]
    async fn test_exports_flow_to_later_steps_even_when_skipped() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(MarkerLedger::new(temp.path().join("ledger")));
        let runner = PipelineRunner::new(ledger.clone());

        let steps = vec![
            Step::new("rbenv", Arc::new(Exports))
                .with_exports(DiscoveredEnv::new().with_var("RBENV_ROOT", "/opt/rbenv")),
            Step::new("ruby", Arc::new(NeedsVar("RBENV_ROOT"))),
        ];

        let first = runner.run(&steps).await.unwrap();
        assert!(first.is_success());

        ledger.reset("ruby").await.unwrap();
        let second = runner.run(&steps).await.unwrap();

        assert_eq!(second.skipped, vec!["rbenv"]);
        assert_eq!(second.completed, vec!["ruby"]);
        assert_eq!(
            second.env.vars.get("RBENV_ROOT"),
            Some(&"/opt/rbenv".to_string())
        );
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected_before_running() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(MarkerLedger::new(temp.path().join("ledger")));
        let runner = PipelineRunner::new(ledger.clone());

        let steps = vec![
            Step::new("git", Arc::new(Exports)),
            Step::new("git", Arc::new(Exports)),
        ];

        assert!(runner.run(&steps).await.is_err());
        assert!(!ledger.is_complete("git").await);
    }

    #[tokio::test]
    async fn test_journal_records_run() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(MarkerLedger::new(temp.path().join("ledger")));
        let runs_dir = temp.path().join("runs");
        let runner = PipelineRunner::new(ledger)
            .named("devbox")
            .with_journal(&runs_dir);

        let steps = vec![
            Step::new("git", Arc::new(Exports)),
            Step::new("ruby", Arc::new(NeedsVar("MISSING"))),
        ];

        let result = runner.run(&steps).await.unwrap();
        assert_eq!(result.failed_step(), Some("ruby"));

        let journal = RunJournal::open(&runs_dir, result.run_id).await.unwrap();
        let record = journal.record().await.unwrap().unwrap();

        assert_eq!(record.pipeline_name, "devbox");
        assert_eq!(record.step_status("git"), Some(StepStatus::Completed));
        assert_eq!(record.step_status("ruby"), Some(StepStatus::Failed));
        assert!(!record.is_running());
    }
}
