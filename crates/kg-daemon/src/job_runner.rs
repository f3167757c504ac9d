//! Per-`JobType` execution registry (spec §4.1–§4.3, §4.2, §6.9).
//!
//! The background dispatch loop used to hand every `approved` job to the
//! ingestion pipeline regardless of `job_type`. That only works for
//! `JobType::Ingestion`: the counter-gated scheduled launchers in
//! `kg_scheduler` enqueue `ProjectionRefresh`/`VocabConsolidation`/
//! `Other("epistemic_remeasurement")`/`Other("ontology_annealing")` jobs
//! with no `content_hash` and a launcher-shaped `job_data`, and
//! `POST /admin/restore` enqueues `JobType::Restore` jobs — none of which
//! `IngestionPipeline::run` can make sense of. This module gives each job
//! type its own [`JobRunner`], looked up from a [`JobRunnerRegistry`] keyed
//! on the job's type, the same name-keyed-registry shape
//! [`kg_scheduler::LauncherRegistry`] already uses for launchers.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kg_checkpoint::{import_backup, BackupContainer, CheckpointGuard, RestoreJobData};
use kg_core::{Job, JobResult, JobType};
use kg_error::{ErrorCode, KgError};
use kg_ingest::IngestionPipeline;

use crate::state::AppState;

/// Executes one dispatched job to completion and returns its terminal
/// [`JobResult`] payload. A runner never calls `JobQueue::complete` or
/// `Broker::publish_completed`/`publish_failed` itself — the dispatch loop
/// does that uniformly for every job type once the runner returns.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion.
    async fn run(&self, state: &AppState, job: &Job) -> Result<JobResult, KgError>;
}

/// The registry key a [`JobType`] maps to. `Other(tag)` uses `tag` itself,
/// so a launcher and its runner agree on a name without either side naming
/// the other.
fn job_type_key(job_type: &JobType) -> &str {
    match job_type {
        JobType::Ingestion => "ingestion",
        JobType::Restore => "restore",
        JobType::Backup => "backup",
        JobType::ProjectionRefresh => "projection_refresh",
        JobType::EmbeddingRegeneration => "embedding_regeneration",
        JobType::VocabConsolidation => "vocab_consolidation",
        JobType::Other(tag) => tag,
    }
}

/// `JobType -> JobRunner` registry.
#[derive(Clone, Default)]
pub struct JobRunnerRegistry {
    runners: BTreeMap<String, Arc<dyn JobRunner>>,
}

impl JobRunnerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `runner` to handle every job of type `job_type`.
    pub fn register(&mut self, job_type: JobType, runner: Arc<dyn JobRunner>) {
        self.runners.insert(job_type_key(&job_type).to_string(), runner);
    }

    /// Look up the runner registered for `job_type`, if any.
    #[must_use]
    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(job_type_key(job_type)).cloned()
    }
}

/// Runs `JobType::Ingestion` jobs through the chunk/extract/embed/match/
/// upsert pipeline (spec §4.3).
pub struct IngestionJobRunner {
    pipeline: Arc<IngestionPipeline>,
}

impl IngestionJobRunner {
    /// Wrap `pipeline`.
    #[must_use]
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobRunner for IngestionJobRunner {
    async fn run(&self, _state: &AppState, job: &Job) -> Result<JobResult, KgError> {
        self.pipeline.run(job).await
    }
}

/// Runs `JobType::Restore` jobs (spec §6.1 `POST /admin/restore`, spec §5
/// "Checkpoint guard"). `POST /admin/restore` only stages the upload and
/// verifies its integrity before enqueueing; the actual import — and the
/// temp-blob cleanup, in a `finally` path that runs whether the import
/// succeeds or fails — happens here, off the HTTP request task.
pub struct RestoreJobRunner;

#[async_trait]
impl JobRunner for RestoreJobRunner {
    async fn run(&self, state: &AppState, job: &Job) -> Result<JobResult, KgError> {
        let job_data: RestoreJobData = serde_json::from_value(job.job_data.clone()).map_err(|e| {
            KgError::new(ErrorCode::ValidationMalformedInput, "restore job_data does not match the expected shape").with_source(e)
        })?;

        let outcome = async {
            let bytes = state.blob.get(&job_data.temp_blob_key).await?;
            let container: BackupContainer = serde_json::from_slice(&bytes).map_err(|e| {
                KgError::new(ErrorCode::ValidationMalformedInput, "staged backup is not valid JSON").with_source(e)
            })?;
            container.verify_integrity()?;
            let statistics = container.statistics;

            let guard = CheckpointGuard::new(state.blob.as_ref(), state.clock.as_ref());
            guard
                .run_with_checkpoint(
                    state.graph.as_ref(),
                    job_data.ontology.as_deref(),
                    false,
                    || import_backup(state.graph.as_ref(), container, true),
                    |_: &()| Ok(()),
                )
                .await?;

            let counts = state.graph.object_counts().await?;
            state.telemetry.refresh_from_counts(&counts);

            Ok::<_, KgError>(serde_json::json!({ "statistics": statistics }))
        }
        .await;

        let _ = state.blob.delete(&job_data.temp_blob_key).await;
        outcome
    }
}

/// Runs the counter-gated scheduled-launcher job types (spec §4.2, §4.7):
/// `ProjectionRefresh`, `VocabConsolidation`, and the
/// `Other("epistemic_remeasurement")`/`Other("ontology_annealing")` tags
/// `kg_scheduler::CounterGatedLauncher` enqueues. The subsystems these name
/// — projection rebuilds, vocabulary consolidation, epistemic
/// re-measurement, ontology annealing — are external collaborators out of
/// scope here (spec §1); this runner's only job is to resolve the
/// placeholder the launcher enqueued by reconciling the epoch counters
/// from live graph state, the same "nothing more to do but acknowledge"
/// shape [`kg_scheduler::ArtifactCleanupLauncher`] already runs directly
/// instead of going through the job queue at all.
pub struct CounterGatedJobRunner;

#[async_trait]
impl JobRunner for CounterGatedJobRunner {
    async fn run(&self, state: &AppState, job: &Job) -> Result<JobResult, KgError> {
        let counts = state.graph.object_counts().await?;
        state.telemetry.refresh_from_counts(&counts);
        Ok(job.job_data.clone())
    }
}

/// Build the registry `main.rs` wires every runnable job type through.
#[must_use]
pub fn default_registry(pipeline: Arc<IngestionPipeline>) -> JobRunnerRegistry {
    let mut registry = JobRunnerRegistry::new();
    registry.register(JobType::Ingestion, Arc::new(IngestionJobRunner::new(pipeline)));
    registry.register(JobType::Restore, Arc::new(RestoreJobRunner));
    registry.register(JobType::ProjectionRefresh, Arc::new(CounterGatedJobRunner));
    registry.register(JobType::VocabConsolidation, Arc::new(CounterGatedJobRunner));
    registry.register(JobType::Other("epistemic_remeasurement".to_string()), Arc::new(CounterGatedJobRunner));
    registry.register(JobType::Other("ontology_annealing".to_string()), Arc::new(CounterGatedJobRunner));
    registry
}
