//! Per-chunk processing pipeline (spec §4.3 step 3): a short,
//! short-circuiting, ordered chain of stages sharing one
//! [`PipelineContext`] and mutating one [`ChunkWork`] accumulator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kg_clock::Clock;
use kg_error::KgError;
use kg_graph::GraphFacade;
use kg_llm::{EmbeddingService, ExtractionResult, LlmExtractor};
use kg_retry::{ProviderLimiter, RetryPolicy};

use crate::chunk::Chunk;
use crate::sink::{Sink, SkippedRelationship};
use crate::vocabulary::RelationshipVocabulary;

/// Shared, immutable services and parameters for processing every chunk of
/// one ingestion job.
pub struct PipelineContext {
    /// The ingestion job driving this run.
    pub job_id: String,
    /// Ontology scope for every graph write.
    pub ontology: String,
    /// Content-hash id of the document being ingested.
    pub document_id: String,
    /// Identity recorded as the asserting principal on new edges.
    pub created_by: i64,
    /// Graph store.
    pub graph: Arc<dyn GraphFacade>,
    /// Concept/relationship extractor.
    pub extractor: Arc<dyn LlmExtractor>,
    /// Embedding provider.
    pub embedder: Arc<dyn EmbeddingService>,
    /// Controlled relationship-type vocabulary for this ontology.
    pub vocabulary: Arc<RelationshipVocabulary>,
    /// Where dropped relationships are logged.
    pub skipped_sink: Arc<dyn Sink<SkippedRelationship>>,
    /// Backoff policy wrapping every provider call.
    pub retry_policy: RetryPolicy,
    /// Bounds concurrent in-flight extractor calls.
    pub extractor_limiter: Arc<ProviderLimiter>,
    /// Bounds concurrent in-flight embedding calls.
    pub embedder_limiter: Arc<ProviderLimiter>,
    /// Clock used for both retry timing and provenance timestamps.
    pub clock: Arc<dyn Clock>,
    /// Minimum cosine similarity for reusing an existing concept (spec
    /// §4.3 step 3c).
    pub min_concept_similarity: f32,
}

/// A concept candidate resolved to either a reused or newly-minted graph
/// node, after [`crate::stages::MatchStage`] runs.
#[derive(Debug, Clone)]
pub struct ResolvedConcept {
    /// The id to upsert the concept/instance/relationship under.
    pub concept_id: String,
    /// The embedding recorded for the concept (the match, if reused; the
    /// candidate's own embedding, if newly created).
    pub embedding: Vec<f32>,
    /// `true` if no existing concept matched closely enough and this
    /// pipeline run is the one minting it.
    pub newly_created: bool,
}

/// Mutable state threaded through a chunk's stage chain: the extraction
/// result and everything derived from it.
pub struct ChunkWork {
    /// The chunk being processed.
    pub chunk: Chunk,
    /// Raw extractor output, populated by [`crate::stages::ExtractStage`].
    pub extraction: ExtractionResult,
    /// Embedding of the chunk's full text, for `SourceRecord::embedding`.
    pub chunk_embedding: Vec<f32>,
    /// Embedding of each candidate concept's label+description, keyed by
    /// label.
    pub concept_embeddings: BTreeMap<String, Vec<f32>>,
    /// Each candidate concept's resolution, keyed by label.
    pub resolved_concepts: BTreeMap<String, ResolvedConcept>,
    /// Embedding of each non-canonical proposed relationship type seen in
    /// this chunk, keyed by the proposed type string.
    pub relationship_type_embeddings: BTreeMap<String, Vec<f32>>,
    /// New concepts upserted while processing this chunk.
    pub concepts_created: u64,
    /// New relationship edges upserted while processing this chunk.
    pub relationships_created: u64,
}

impl ChunkWork {
    /// Start a fresh accumulator for `chunk`.
    #[must_use]
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            extraction: ExtractionResult::default(),
            chunk_embedding: Vec::new(),
            concept_embeddings: BTreeMap::new(),
            resolved_concepts: BTreeMap::new(),
            relationship_type_embeddings: BTreeMap::new(),
            concepts_created: 0,
            relationships_created: 0,
        }
    }
}

/// One step of the per-chunk pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Advance `work` using the services in `ctx`. Short-circuits the
    /// enclosing [`Pipeline`] on `Err`.
    async fn process(&self, ctx: &PipelineContext, work: &mut ChunkWork) -> Result<(), KgError>;

    /// Stage name, used in tracing spans and progress messages.
    fn name(&self) -> &str;
}

/// An ordered chain of [`PipelineStage`]s run against one chunk.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    /// Start an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage, consuming and returning `self` for chaining.
    #[must_use]
    pub fn stage(mut self, stage: Box<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run every stage in order, stopping at the first error.
    pub async fn execute(&self, ctx: &PipelineContext, work: &mut ChunkWork) -> Result<(), KgError> {
        for stage in &self.stages {
            tracing::debug!(job_id = %ctx.job_id, chunk = work.chunk.index, stage = stage.name(), "running ingestion stage");
            stage.process(ctx, work).await?;
        }
        Ok(())
    }

    /// Number of stages in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// `true` if no stages have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
