//! LLM concept extraction, embedding, and vision traits consumed by the
//! ingestion pipeline (spec §6.4–§6.6, deliberately external collaborators).
//!
//! Every provider call is wrapped by the caller in [`kg_retry::retry`] plus
//! a [`kg_retry::ProviderLimiter`] — this crate only defines the narrow
//! trait boundary and the request/response shapes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use kg_error::{ErrorCode, KgError};
use serde::{Deserialize, Serialize};

/// A candidate concept proposed by the extractor for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateConcept {
    /// Proposed canonical label.
    pub label: String,
    /// Proposed description.
    pub description: String,
    /// The verbatim text the extractor grounded this concept in.
    pub evidence_quote: String,
}

/// A candidate relationship proposed by the extractor for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRelationship {
    /// Label of the source concept, matched against `concepts` by `label`.
    pub from_label: String,
    /// Label of the target concept.
    pub to_label: String,
    /// Proposed relationship type; may not be in the canonical vocabulary.
    pub relationship_type: String,
    /// Extractor-reported confidence, `0.0..=1.0`.
    pub confidence: f32,
}

/// Result of one [`LlmExtractor::extract_concepts`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Candidate concepts found in the chunk.
    pub concepts: Vec<CandidateConcept>,
    /// Candidate relationships found in the chunk.
    pub relationships: Vec<CandidateRelationship>,
}

/// Extracts candidate concepts and relationships from a chunk of document
/// text (spec §6.4).
///
/// Implementations fail with [`ErrorCode::ProviderRateLimited`],
/// [`ErrorCode::ProviderUnavailable`], or
/// [`ErrorCode::ProviderMalformedResponse`]; all three are caller-retryable
/// except the last.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    /// Extract concepts and relationships from `chunk_text` within `ontology`.
    async fn extract_concepts(
        &self,
        chunk_text: &str,
        ontology: &str,
    ) -> Result<ExtractionResult, KgError>;
}

/// Which side of a query/document pair a text is being embedded for,
/// determining which configured prefix (if any) is applied (spec §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingPurpose {
    /// Embedding a search query.
    Query,
    /// Embedding document content (a concept label+description, a chunk).
    Document,
}

/// Produces dense embedding vectors for a batch of texts (spec §6.5).
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed `texts`, applying the active profile's purpose-specific prefix
    /// and normalisation. The returned vector has one entry per input text,
    /// in order.
    async fn embed(
        &self,
        texts: &[String],
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, KgError>;

    /// Dimensionality of vectors this service produces.
    fn dimensions(&self) -> usize;
}

/// Produces a visual embedding for an image payload, used for
/// image-derived [`kg_core::SourceRecord`]s.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// Embed the image in `bytes` (format implied by `content_type`).
    async fn embed_image(&self, bytes: &[u8], content_type: &str) -> Result<Vec<f32>, KgError>;
}

fn malformed(reason: impl Into<String>) -> KgError {
    KgError::new(ErrorCode::ProviderMalformedResponse, reason.into())
}

/// Apply a configured prefix to `text` for the given `purpose`, per the
/// active embedding profile (spec §3 `EmbeddingConfig`).
#[must_use]
pub fn apply_prefix(text: &str, purpose: EmbeddingPurpose, query_prefix: &str, document_prefix: &str) -> String {
    let prefix = match purpose {
        EmbeddingPurpose::Query => query_prefix,
        EmbeddingPurpose::Document => document_prefix,
    };
    if prefix.is_empty() {
        text.to_string()
    } else {
        format!("{prefix}{text}")
    }
}

/// L2-normalise `vector` in place. No-op on a zero vector.
pub fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for component in vector.iter_mut() {
            *component /= magnitude;
        }
    }
}

/// Deterministic in-memory test double for [`LlmExtractor`], configured
/// with a fixed response keyed by chunk text prefix. Used by the ingestion
/// pipeline's own unit tests.
#[derive(Debug, Clone, Default)]
pub struct MockExtractor {
    responses: Vec<(String, ExtractionResult)>,
    fallback: ExtractionResult,
}

impl MockExtractor {
    /// Create an extractor that always returns `fallback` unless a chunk
    /// starts with a registered prefix.
    #[must_use]
    pub fn new(fallback: ExtractionResult) -> Self {
        Self { responses: Vec::new(), fallback }
    }

    /// Register a canned response for chunks starting with `prefix`.
    #[must_use]
    pub fn with_response(mut self, prefix: impl Into<String>, result: ExtractionResult) -> Self {
        self.responses.push((prefix.into(), result));
        self
    }
}

#[async_trait]
impl LlmExtractor for MockExtractor {
    async fn extract_concepts(
        &self,
        chunk_text: &str,
        _ontology: &str,
    ) -> Result<ExtractionResult, KgError> {
        for (prefix, result) in &self.responses {
            if chunk_text.starts_with(prefix.as_str()) {
                return Ok(result.clone());
            }
        }
        Ok(self.fallback.clone())
    }
}

/// Deterministic in-memory test double for [`EmbeddingService`]: derives a
/// pseudo-embedding from each text's byte sum so that identical texts
/// always produce identical (and comparable) vectors.
#[derive(Debug, Clone, Copy)]
pub struct MockEmbeddingService {
    dims: usize,
}

impl MockEmbeddingService {
    /// Create a mock producing `dims`-dimensional vectors.
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dims] += f32::from(byte);
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingService for MockEmbeddingService {
    async fn embed(
        &self,
        texts: &[String],
        _purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, KgError> {
        if texts.is_empty() {
            return Err(malformed("embed called with an empty batch"));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
