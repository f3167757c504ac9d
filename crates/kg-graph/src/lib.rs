//! Typed facade over the property-graph store (spec §1 "deliberately out of
//! scope... abstracted behind narrow interfaces").
//!
//! [`GraphFacade`] is the only way the rest of the control plane touches
//! graph entities. Concrete backends (a Cypher-dialect store, in particular)
//! live outside this workspace; [`InMemoryGraph`] is a test double used by
//! the ingestion pipeline's own test suite and by integration tests that
//! don't want a live graph database.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use kg_core::{Concept, DocumentMeta, Instance, Ontology, RelationshipEdge, SourceRecord};
use kg_error::{ErrorCode, KgError};
use tokio::sync::RwLock;

/// Raw per-category object counts, reported to [`kg_telemetry`] for
/// derivation of the `graph_change_counter` epoch (spec §4.7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphObjectCounts {
    /// Number of distinct concepts.
    pub concept_count: u64,
    /// Number of relationship edges.
    pub total_edges: u64,
    /// Number of source (chunk/image) records.
    pub source_count: u64,
    /// Number of evidence instances.
    pub instance_count: u64,
    /// Number of distinct documents ingested.
    pub document_count: u64,
    /// Number of distinct relationship type labels in use.
    pub vocabulary_type_count: u64,
}

/// Typed interface over a property-graph store with Cypher-like
/// traversals, narrowed to the operations the control plane's core needs.
#[async_trait]
pub trait GraphFacade: Send + Sync {
    /// Fetch a concept by id.
    async fn get_concept(&self, concept_id: &str) -> Result<Option<Concept>, KgError>;

    /// Find concepts in `ontology` whose embedding has cosine similarity
    /// `>= min_similarity` against `embedding`, most similar first, ties
    /// broken by oldest `created_at` (spec §4.3 step 3c).
    async fn find_similar_concepts(
        &self,
        ontology: &str,
        embedding: &[f32],
        min_similarity: f32,
    ) -> Result<Vec<(Concept, f32)>, KgError>;

    /// Create or replace a concept by `concept_id`.
    async fn upsert_concept(&self, concept: Concept) -> Result<Concept, KgError>;

    /// Create a source record if `source_id` is not already present.
    async fn upsert_source(&self, source: SourceRecord) -> Result<SourceRecord, KgError>;

    /// Create an evidence instance linking a concept to a source.
    async fn upsert_instance(&self, instance: Instance) -> Result<(), KgError>;

    /// Create or reassert a relationship edge, keyed by
    /// `(from_concept_id, to_concept_id, relationship_type)` (spec §4.4).
    async fn upsert_relationship(&self, edge: RelationshipEdge) -> Result<(), KgError>;

    /// Fetch document provenance by its content-hash id, scoped to `ontology`.
    async fn get_document_meta(
        &self,
        document_id: &str,
        ontology: &str,
    ) -> Result<Option<DocumentMeta>, KgError>;

    /// Create or update a document provenance record.
    async fn upsert_document_meta(&self, meta: DocumentMeta) -> Result<(), KgError>;

    /// Fetch an ontology scope node by id.
    async fn get_ontology(&self, ontology_id: &str) -> Result<Option<Ontology>, KgError>;

    /// Create an ontology scope node if absent, or return the existing one.
    async fn get_or_create_ontology(&self, ontology_id: &str) -> Result<Ontology, KgError>;

    /// Current raw object counts, used to derive the change epoch.
    async fn object_counts(&self) -> Result<GraphObjectCounts, KgError>;

    /// Export graph content for backup (spec §6.6, §6.9). `Some(ontology)`
    /// yields a partial export scoped to that ontology; `None` exports
    /// everything.
    async fn export_all(&self, ontology: Option<&str>) -> Result<GraphExport, KgError>;

    /// Import previously exported content (spec §6.6, §6.9 restore). When
    /// `replace` is `true`, matching existing content is cleared first
    /// (scoped to the ontologies present in `export`, or everything when
    /// `export` carries no ontology rows); otherwise entities are upserted
    /// alongside what is already present.
    async fn import_all(&self, export: GraphExport, replace: bool) -> Result<(), KgError>;

    /// Remove all graph content. Used by the checkpoint guard's rollback
    /// path and by [`Self::import_all`]'s full-replace mode.
    async fn clear_all(&self) -> Result<(), KgError>;
}

/// A full or partial snapshot of graph content, keyed by the six entity
/// kinds a backup container persists (spec §6.9).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GraphExport {
    /// Concept nodes.
    pub concepts: Vec<Concept>,
    /// Source (chunk/image) records.
    pub sources: Vec<SourceRecord>,
    /// Evidence instances linking concepts to sources.
    pub instances: Vec<Instance>,
    /// Relationship edges.
    pub relationships: Vec<RelationshipEdge>,
    /// Document provenance records.
    pub document_meta: Vec<DocumentMeta>,
    /// Ontology scope nodes.
    pub ontologies: Vec<Ontology>,
}

/// Cosine similarity between two equal-length embedding vectors. Returns
/// `0.0` for mismatched lengths or zero-magnitude vectors rather than
/// erroring, since callers treat "no similarity" the same as "not
/// comparable".
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[derive(Default)]
struct GraphState {
    concepts: BTreeMap<String, Concept>,
    sources: BTreeMap<String, SourceRecord>,
    instances: BTreeMap<String, Instance>,
    edges: BTreeMap<(String, String, String), RelationshipEdge>,
    documents: BTreeMap<(String, String), DocumentMeta>,
    ontologies: BTreeMap<String, Ontology>,
}

/// In-memory [`GraphFacade`] test double, grounded on the workspace's
/// `Backend`-trait mock pattern. Not suitable for production use: state is
/// lost on process exit and similarity search is a linear scan.
#[derive(Default)]
pub struct InMemoryGraph {
    state: RwLock<GraphState>,
}

impl InMemoryGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphFacade for InMemoryGraph {
    async fn get_concept(&self, concept_id: &str) -> Result<Option<Concept>, KgError> {
        Ok(self.state.read().await.concepts.get(concept_id).cloned())
    }

    async fn find_similar_concepts(
        &self,
        ontology: &str,
        embedding: &[f32],
        min_similarity: f32,
    ) -> Result<Vec<(Concept, f32)>, KgError> {
        let state = self.state.read().await;
        let mut matches: Vec<(Concept, f32)> = state
            .concepts
            .values()
            .filter(|c| c.ontology == ontology)
            .map(|c| (c.clone(), cosine_similarity(&c.embedding, embedding)))
            .filter(|(_, sim)| *sim >= min_similarity)
            .collect();
        matches.sort_by(|(a, sim_a), (b, sim_b)| {
            sim_b
                .partial_cmp(sim_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(matches)
    }

    async fn upsert_concept(&self, concept: Concept) -> Result<Concept, KgError> {
        let mut state = self.state.write().await;
        state.concepts.insert(concept.concept_id.clone(), concept.clone());
        Ok(concept)
    }

    async fn upsert_source(&self, source: SourceRecord) -> Result<SourceRecord, KgError> {
        let mut state = self.state.write().await;
        state
            .sources
            .entry(source.source_id.clone())
            .or_insert_with(|| source.clone());
        Ok(source)
    }

    async fn upsert_instance(&self, instance: Instance) -> Result<(), KgError> {
        let mut state = self.state.write().await;
        state.instances.insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    async fn upsert_relationship(&self, edge: RelationshipEdge) -> Result<(), KgError> {
        let mut state = self.state.write().await;
        let key = (
            edge.from_concept_id.clone(),
            edge.to_concept_id.clone(),
            edge.relationship_type.clone(),
        );
        state.edges.insert(key, edge);
        Ok(())
    }

    async fn get_document_meta(
        &self,
        document_id: &str,
        ontology: &str,
    ) -> Result<Option<DocumentMeta>, KgError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .get(&(document_id.to_string(), ontology.to_string()))
            .cloned())
    }

    async fn upsert_document_meta(&self, meta: DocumentMeta) -> Result<(), KgError> {
        let mut state = self.state.write().await;
        let key = (meta.document_id.clone(), meta.ontology.clone());
        state.documents.insert(key, meta);
        Ok(())
    }

    async fn get_ontology(&self, ontology_id: &str) -> Result<Option<Ontology>, KgError> {
        Ok(self.state.read().await.ontologies.get(ontology_id).cloned())
    }

    async fn get_or_create_ontology(&self, ontology_id: &str) -> Result<Ontology, KgError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.ontologies.get(ontology_id) {
            return Ok(existing.clone());
        }
        let epoch = (state.concepts.len() + state.edges.len()) as u64;
        let created = Ontology {
            ontology_id: ontology_id.to_string(),
            name: ontology_id.to_string(),
            lifecycle_state: kg_core::OntologyLifecycleState::Active,
            creation_epoch: epoch,
        };
        state.ontologies.insert(ontology_id.to_string(), created.clone());
        Ok(created)
    }

    async fn object_counts(&self) -> Result<GraphObjectCounts, KgError> {
        let state = self.state.read().await;
        let vocabulary_type_count = state
            .edges
            .values()
            .map(|e| e.relationship_type.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .len() as u64;
        Ok(GraphObjectCounts {
            concept_count: state.concepts.len() as u64,
            total_edges: state.edges.len() as u64,
            source_count: state.sources.len() as u64,
            instance_count: state.instances.len() as u64,
            document_count: state.documents.len() as u64,
            vocabulary_type_count,
        })
    }

    async fn export_all(&self, ontology: Option<&str>) -> Result<GraphExport, KgError> {
        let state = self.state.read().await;
        let in_scope = |ont: &str| ontology.is_none_or(|want| want == ont);
        Ok(GraphExport {
            concepts: state.concepts.values().filter(|c| in_scope(&c.ontology)).cloned().collect(),
            sources: state.sources.values().cloned().collect(),
            instances: state.instances.values().cloned().collect(),
            relationships: state.edges.values().cloned().collect(),
            document_meta: state.documents.values().filter(|d| in_scope(&d.ontology)).cloned().collect(),
            ontologies: state.ontologies.values().filter(|o| in_scope(&o.ontology_id)).cloned().collect(),
        })
    }

    async fn import_all(&self, export: GraphExport, replace: bool) -> Result<(), KgError> {
        let mut state = self.state.write().await;
        if replace {
            let ontologies: std::collections::BTreeSet<String> =
                export.ontologies.iter().map(|o| o.ontology_id.clone()).collect();
            if ontologies.is_empty() {
                *state = GraphState::default();
            } else {
                state.concepts.retain(|_, c| !ontologies.contains(&c.ontology));
                state.documents.retain(|(_, ont), _| !ontologies.contains(ont));
                state.ontologies.retain(|id, _| !ontologies.contains(id));
            }
        }
        for concept in export.concepts {
            state.concepts.insert(concept.concept_id.clone(), concept);
        }
        for source in export.sources {
            state.sources.entry(source.source_id.clone()).or_insert(source);
        }
        for instance in export.instances {
            state.instances.insert(instance.instance_id.clone(), instance);
        }
        for edge in export.relationships {
            let key = (edge.from_concept_id.clone(), edge.to_concept_id.clone(), edge.relationship_type.clone());
            state.edges.insert(key, edge);
        }
        for meta in export.document_meta {
            let key = (meta.document_id.clone(), meta.ontology.clone());
            state.documents.insert(key, meta);
        }
        for ontology in export.ontologies {
            state.ontologies.insert(ontology.ontology_id.clone(), ontology);
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), KgError> {
        *self.state.write().await = GraphState::default();
        Ok(())
    }
}

/// Helper for callers that need a generic "not found" [`KgError`] for a
/// graph lookup that is expected to exist.
#[must_use]
pub fn not_found(resource: &str, id: &str) -> KgError {
    KgError::new(ErrorCode::NotFoundResource, format!("{resource} {id} not found"))
        .with_context("resource", resource)
        .with_context("id", id)
}
