//! The four per-chunk stages (spec §4.3 step 3, §4.4): extract candidate
//! concepts/relationships, embed them, match against existing concepts,
//! then upsert everything into the graph.

use std::collections::BTreeSet;

use async_trait::async_trait;
use kg_core::{Concept, Instance, Provenance, ProvenanceSource, RelationshipEdge, SourceRecord};
use kg_error::KgError;
use kg_llm::EmbeddingPurpose;
use kg_retry::retry;

use crate::ids::{concept_id_for, instance_id_for, source_id_for};
use crate::pipeline::{ChunkWork, PipelineContext, PipelineStage, ResolvedConcept};
use crate::sink::SkippedRelationship;
use crate::vocabulary::VocabResolution;

/// Calls [`kg_llm::LlmExtractor::extract_concepts`] on the chunk text,
/// wrapped in the context's retry policy and extractor limiter.
pub struct ExtractStage;

#[async_trait]
impl PipelineStage for ExtractStage {
    fn name(&self) -> &str {
        "extract"
    }

    async fn process(&self, ctx: &PipelineContext, work: &mut ChunkWork) -> Result<(), KgError> {
        let _permit = ctx.extractor_limiter.acquire().await;
        let extractor = ctx.extractor.clone();
        let ontology = ctx.ontology.clone();
        let chunk_text = work.chunk.text.clone();

        let outcome = retry(&ctx.retry_policy, ctx.clock.as_ref(), || {
            let extractor = extractor.clone();
            let ontology = ontology.clone();
            let chunk_text = chunk_text.clone();
            async move { extractor.extract_concepts(&chunk_text, &ontology).await }
        })
        .await?;

        work.extraction = outcome.value;
        Ok(())
    }
}

/// Embeds the chunk's full text, each candidate concept's label+description,
/// and each non-canonical proposed relationship type, all via
/// [`kg_llm::EmbeddingService`] wrapped in retry and the embedder limiter.
pub struct EmbedStage;

#[async_trait]
impl PipelineStage for EmbedStage {
    fn name(&self) -> &str {
        "embed"
    }

    async fn process(&self, ctx: &PipelineContext, work: &mut ChunkWork) -> Result<(), KgError> {
        work.chunk_embedding = embed_batch(ctx, vec![work.chunk.text.clone()]).await?.remove(0);

        if !work.extraction.concepts.is_empty() {
            let texts: Vec<String> = work
                .extraction
                .concepts
                .iter()
                .map(|c| format!("{} — {}", c.label, c.description))
                .collect();
            let embeddings = embed_batch(ctx, texts).await?;
            for (concept, embedding) in work.extraction.concepts.iter().zip(embeddings) {
                work.concept_embeddings.insert(concept.label.clone(), embedding);
            }
        }

        let unresolved_types: Vec<String> = work
            .extraction
            .relationships
            .iter()
            .map(|r| r.relationship_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|t| !ctx.vocabulary.is_canonical(t))
            .collect();

        if !unresolved_types.is_empty() {
            let embeddings = embed_batch(ctx, unresolved_types.clone()).await?;
            for (proposed_type, embedding) in unresolved_types.into_iter().zip(embeddings) {
                work.relationship_type_embeddings.insert(proposed_type, embedding);
            }
        }

        Ok(())
    }
}

async fn embed_batch(ctx: &PipelineContext, texts: Vec<String>) -> Result<Vec<Vec<f32>>, KgError> {
    let _permit = ctx.embedder_limiter.acquire().await;
    let embedder = ctx.embedder.clone();
    let outcome = retry(&ctx.retry_policy, ctx.clock.as_ref(), || {
        let embedder = embedder.clone();
        let texts = texts.clone();
        async move { embedder.embed(&texts, EmbeddingPurpose::Document).await }
    })
    .await?;
    Ok(outcome.value)
}

/// Resolves each candidate concept against the existing graph by cosine
/// similarity (spec §4.3 step 3c), reusing the closest match at or above
/// `min_concept_similarity` or minting a deterministic id otherwise.
pub struct MatchStage;

#[async_trait]
impl PipelineStage for MatchStage {
    fn name(&self) -> &str {
        "match"
    }

    async fn process(&self, ctx: &PipelineContext, work: &mut ChunkWork) -> Result<(), KgError> {
        let candidates = work.extraction.concepts.clone();
        for candidate in &candidates {
            if work.resolved_concepts.contains_key(&candidate.label) {
                continue;
            }
            let embedding = work.concept_embeddings.get(&candidate.label).cloned().unwrap_or_default();
            let matches = ctx.graph.find_similar_concepts(&ctx.ontology, &embedding, ctx.min_concept_similarity).await?;

            let resolved = match matches.into_iter().next() {
                Some((existing, _similarity)) => {
                    ResolvedConcept { concept_id: existing.concept_id, embedding: existing.embedding, newly_created: false }
                }
                None => ResolvedConcept {
                    concept_id: concept_id_for(&ctx.ontology, &candidate.label),
                    embedding,
                    newly_created: true,
                },
            };
            work.resolved_concepts.insert(candidate.label.clone(), resolved);
        }
        Ok(())
    }
}

/// Writes the chunk's source record, resolved concepts, evidence instances,
/// and vocabulary-resolved relationship edges (spec §4.3 step 3d-e, §4.4).
pub struct UpsertStage;

#[async_trait]
impl PipelineStage for UpsertStage {
    fn name(&self) -> &str {
        "upsert"
    }

    async fn process(&self, ctx: &PipelineContext, work: &mut ChunkWork) -> Result<(), KgError> {
        let now = ctx.clock.now();
        let source_id = source_id_for(&ctx.document_id, work.chunk.index);

        ctx.graph
            .upsert_source(SourceRecord {
                source_id: source_id.clone(),
                document: ctx.document_id.clone(),
                paragraph: Some(work.chunk.index as u32),
                full_text: work.chunk.text.clone(),
                content_hash: kg_core::content_hash(work.chunk.text.as_bytes()),
                content_type: "text".to_string(),
                storage_key: None,
                embedding: work.chunk_embedding.clone(),
                visual_embedding: None,
            })
            .await?;

        for candidate in work.extraction.concepts.clone() {
            let resolved = work
                .resolved_concepts
                .get(&candidate.label)
                .cloned()
                .expect("match stage resolves every candidate concept before upsert runs");

            if resolved.newly_created {
                ctx.graph
                    .upsert_concept(Concept {
                        concept_id: resolved.concept_id.clone(),
                        label: candidate.label.clone(),
                        description: candidate.description.clone(),
                        embedding: resolved.embedding.clone(),
                        ontology: ctx.ontology.clone(),
                        created_at: now,
                    })
                    .await?;
                work.concepts_created += 1;
            }

            ctx.graph
                .upsert_instance(Instance {
                    instance_id: instance_id_for(&resolved.concept_id, &source_id),
                    concept_id: resolved.concept_id,
                    source_id: source_id.clone(),
                    evidence_quote: candidate.evidence_quote,
                })
                .await?;
        }

        for relationship in work.extraction.relationships.clone() {
            let embedding = work.relationship_type_embeddings.get(&relationship.relationship_type);
            let resolution = ctx.vocabulary.resolve(&relationship.relationship_type, embedding.map(Vec::as_slice));

            let (relationship_type, direction) = match resolution {
                VocabResolution::Canonical { relationship_type, direction } => (relationship_type, direction),
                VocabResolution::Substituted { relationship_type, direction, .. } => (relationship_type, direction),
                VocabResolution::Skipped { proposed_type } => {
                    ctx.skipped_sink.record(SkippedRelationship {
                        proposed_type,
                        from_label: relationship.from_label,
                        to_label: relationship.to_label,
                        job_id: ctx.job_id.clone(),
                        at: now,
                    });
                    continue;
                }
            };

            let (Some(from), Some(to)) =
                (work.resolved_concepts.get(&relationship.from_label), work.resolved_concepts.get(&relationship.to_label))
            else {
                tracing::warn!(
                    job_id = %ctx.job_id,
                    from = %relationship.from_label,
                    to = %relationship.to_label,
                    "relationship endpoints missing from extracted concepts, dropping edge"
                );
                continue;
            };

            ctx.graph
                .upsert_relationship(RelationshipEdge {
                    from_concept_id: from.concept_id.clone(),
                    to_concept_id: to.concept_id.clone(),
                    relationship_type,
                    direction,
                    provenance: Provenance {
                        created_at: now,
                        created_by: ctx.created_by,
                        source: ProvenanceSource::LlmExtraction,
                        job_id: Some(ctx.job_id.clone()),
                        document_id: Some(ctx.document_id.clone()),
                        confidence: Some(relationship.confidence),
                    },
                })
                .await?;
            work.relationships_created += 1;
        }

        Ok(())
    }
}
