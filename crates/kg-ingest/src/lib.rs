//! Document ingestion pipeline (spec §4.3): chunk a document, extract
//! candidate concepts/relationships per chunk, embed and match them
//! against the existing graph, then upsert, using a short ordered chain
//! of stages sharing one mutable per-chunk accumulator.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Paragraph-aware document chunking.
pub mod chunk;
/// Deterministic id derivation for idempotent re-ingestion.
pub mod ids;
/// The chunk stage chain and its shared context.
pub mod pipeline;
/// Injection point for dropped relationships.
pub mod sink;
/// The four concrete pipeline stages.
pub mod stages;
/// Relationship-type vocabulary enforcement.
pub mod vocabulary;

use std::sync::Arc;

use kg_artifacts::ArtifactStore;
use kg_broker::Broker;
use kg_clock::Clock;
use kg_config::IngestionConfig;
use kg_core::{ArtifactType, DocumentMeta, Job, JobResult, ProgressSnapshot};
use kg_error::{ErrorCode, KgError};
use kg_graph::GraphFacade;
use kg_llm::{EmbeddingService, LlmExtractor};
use kg_queue::JobQueue;
use kg_retry::{ProviderLimiter, RetryPolicy};
use kg_telemetry::GraphMetrics;
use serde::{Deserialize, Serialize};

use chunk::chunk_document;
use pipeline::{ChunkWork, Pipeline, PipelineContext};
use sink::{Sink, SkippedRelationship};
use stages::{EmbedStage, ExtractStage, MatchStage, UpsertStage};
use vocabulary::RelationshipVocabulary;

/// The `job_data` shape an ingestion [`Job`] carries (spec §4.3 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJobData {
    /// The document's full text.
    pub document_text: String,
    /// Original filename, if known.
    #[serde(default)]
    pub filename: Option<String>,
    /// Source type tag (e.g. `"pdf"`, `"text"`).
    #[serde(default = "default_source_type")]
    pub source_type: String,
    /// Original file path, if known.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Originating hostname, if known.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Re-ingest even if this `(content_hash, ontology)` was already
    /// ingested. Mirrors [`kg_core::JobSpec::force`] for the pipeline's own
    /// pre-flight dedup check, since `force` itself is not carried on
    /// [`Job`].
    #[serde(default)]
    pub force: bool,
}

fn default_source_type() -> String {
    "text".to_string()
}

fn malformed_job_data(err: serde_json::Error) -> KgError {
    KgError::new(ErrorCode::ValidationMalformedInput, "ingestion job_data does not match the expected shape").with_source(err)
}

/// Wires together every service an ingestion run touches: the graph,
/// providers, vocabulary, queue, broker, artifact store, and metrics.
pub struct IngestionPipeline {
    graph: Arc<dyn GraphFacade>,
    extractor: Arc<dyn LlmExtractor>,
    embedder: Arc<dyn EmbeddingService>,
    vocabulary: Arc<RelationshipVocabulary>,
    skipped_sink: Arc<dyn Sink<SkippedRelationship>>,
    retry_policy: RetryPolicy,
    extractor_limiter: Arc<ProviderLimiter>,
    embedder_limiter: Arc<ProviderLimiter>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
    queue: Arc<JobQueue>,
    broker: Arc<Broker>,
    artifacts: Arc<ArtifactStore>,
    telemetry: Arc<GraphMetrics>,
}

impl IngestionPipeline {
    /// Wire together one ingestion pipeline from its services.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        graph: Arc<dyn GraphFacade>,
        extractor: Arc<dyn LlmExtractor>,
        embedder: Arc<dyn EmbeddingService>,
        vocabulary: Arc<RelationshipVocabulary>,
        skipped_sink: Arc<dyn Sink<SkippedRelationship>>,
        retry_policy: RetryPolicy,
        extractor_limiter: Arc<ProviderLimiter>,
        embedder_limiter: Arc<ProviderLimiter>,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
        queue: Arc<JobQueue>,
        broker: Arc<Broker>,
        artifacts: Arc<ArtifactStore>,
        telemetry: Arc<GraphMetrics>,
    ) -> Self {
        Self {
            graph,
            extractor,
            embedder,
            vocabulary,
            skipped_sink,
            retry_policy,
            extractor_limiter,
            embedder_limiter,
            clock,
            config,
            queue,
            broker,
            artifacts,
            telemetry,
        }
    }

    async fn publish_progress(
        &self,
        job_id: &str,
        stage: &str,
        percent: u8,
        chunks_processed: u64,
        chunks_total: u64,
        concepts_created: u64,
    ) -> Result<(), KgError> {
        let snapshot = ProgressSnapshot {
            stage: stage.to_string(),
            percent,
            items_processed: chunks_processed,
            items_total: Some(chunks_total),
            message: format!("{stage}: {chunks_processed}/{chunks_total} chunks"),
            chunks_processed,
            chunks_total: Some(chunks_total),
            concepts_created,
            extra: Default::default(),
        };
        self.queue.update_progress(job_id, snapshot.clone())?;
        self.broker.publish_progress(job_id, snapshot).await;
        Ok(())
    }

    /// Run the full ingestion sequence for `job` (spec §4.3): pre-flight
    /// dedup, chunk, per-chunk extract/embed/match/upsert with idempotent
    /// resume, finalise document metadata and metrics, then register an
    /// `ingestion_report` artifact and link it to the job.
    ///
    /// Expects `job` to already be `running` (a prior [`JobQueue::start`]
    /// call); this only drives the work and reports progress, the caller
    /// still calls [`JobQueue::complete`] with the returned result.
    pub async fn run(&self, job: &Job) -> Result<JobResult, KgError> {
        let job_data: IngestionJobData = serde_json::from_value(job.job_data.clone()).map_err(malformed_job_data)?;

        let document_id = job.content_hash.clone().ok_or_else(|| {
            KgError::new(ErrorCode::ValidationMissingField, "ingestion job is missing content_hash")
        })?;

        if !job_data.force {
            if let Some(existing) = self.graph.get_document_meta(&document_id, &job.ontology).await? {
                return Ok(serde_json::json!({
                    "status": "already_ingested",
                    "document_id": existing.document_id,
                    "source_count": existing.source_count,
                }));
            }
        }

        let chunks = chunk_document(&job_data.document_text, self.config.chunk_size_chars, self.config.chunk_overlap_chars);
        let chunks_total = chunks.len() as u64;
        self.publish_progress(&job.job_id, "chunking", 0, 0, chunks_total, 0).await?;

        let resume_from = job.progress.as_ref().map(|p| p.chunks_processed).unwrap_or(0) as usize;

        let stage_chain = Pipeline::new()
            .stage(Box::new(ExtractStage))
            .stage(Box::new(EmbedStage))
            .stage(Box::new(MatchStage))
            .stage(Box::new(UpsertStage));

        let ctx = PipelineContext {
            job_id: job.job_id.clone(),
            ontology: job.ontology.clone(),
            document_id: document_id.clone(),
            created_by: job.user_id,
            graph: self.graph.clone(),
            extractor: self.extractor.clone(),
            embedder: self.embedder.clone(),
            vocabulary: self.vocabulary.clone(),
            skipped_sink: self.skipped_sink.clone(),
            retry_policy: self.retry_policy.clone(),
            extractor_limiter: self.extractor_limiter.clone(),
            embedder_limiter: self.embedder_limiter.clone(),
            clock: self.clock.clone(),
            min_concept_similarity: self.config.min_concept_similarity as f32,
        };

        let mut concepts_created = 0u64;
        let mut relationships_created = 0u64;

        for candidate_chunk in chunks {
            if candidate_chunk.index < resume_from {
                continue;
            }
            let chunk_index = candidate_chunk.index;
            let mut work = ChunkWork::new(candidate_chunk);
            stage_chain.execute(&ctx, &mut work).await?;
            concepts_created += work.concepts_created;
            relationships_created += work.relationships_created;

            let chunks_processed = chunk_index as u64 + 1;
            let percent = ((chunks_processed * 100) / chunks_total.max(1)).min(100) as u8;
            self.publish_progress(&job.job_id, "ingesting", percent, chunks_processed, chunks_total, concepts_created).await?;
        }

        self.graph
            .upsert_document_meta(DocumentMeta {
                document_id: document_id.clone(),
                ontology: job.ontology.clone(),
                source_count: chunks_total,
                filename: job_data.filename,
                source_type: job_data.source_type,
                file_path: job_data.file_path,
                hostname: job_data.hostname,
                ingested_at: self.clock.now(),
                ingested_by: job.user_id,
                job_id: job.job_id.clone(),
            })
            .await?;
        self.graph.get_or_create_ontology(&job.ontology).await?;

        let counts = self.graph.object_counts().await?;
        self.telemetry.refresh_from_counts(&counts);
        self.telemetry.record_document_ingested();

        let report = serde_json::json!({
            "document_id": document_id,
            "ontology": job.ontology,
            "chunks_total": chunks_total,
            "concepts_created": concepts_created,
            "relationships_created": relationships_created,
        });

        let artifact = self
            .artifacts
            .persist(
                ArtifactType::IngestionReport,
                "ingestion_report".to_string(),
                format!("Ingestion report for {document_id}"),
                Some(job.user_id),
                serde_json::json!({"document_id": document_id}),
                report.clone(),
                job.ontology.clone(),
                Vec::new(),
                None,
                self.telemetry.graph_change_counter(),
            )
            .await?;
        self.queue.link_artifact(&job.job_id, artifact.id)?;

        self.publish_progress(&job.job_id, "complete", 100, chunks_total, chunks_total, concepts_created).await?;

        Ok(report)
    }
}
