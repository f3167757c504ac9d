//! Deterministic identifiers for graph objects the pipeline mints.
//!
//! Re-running the same chunk of the same document must write the same
//! `concept_id`/`source_id`/`instance_id` every time (spec §4.3
//! "Idempotence"), so none of these are drawn from [`kg_clock::new_id`] —
//! that generator is random by design and would mint a fresh row on every
//! retry.

use kg_core::content_hash;

fn hash_suffix(hash: &str) -> &str {
    hash.strip_prefix("sha256:").unwrap_or(hash)
}

/// Deterministic id for a concept newly minted by this ontology+label pair.
/// Stable across re-ingestion so a retried chunk reuses the same node
/// instead of creating a duplicate.
#[must_use]
pub fn concept_id_for(ontology: &str, label: &str) -> String {
    let key = format!("{ontology}\u{0}{}", label.trim().to_lowercase());
    format!("concept_{}", hash_suffix(&content_hash(key.as_bytes())))
}

/// Id for a chunk's [`kg_core::SourceRecord`]: the document's content hash
/// plus the chunk's position, so a resumed ingestion addresses the same
/// chunk it already wrote.
#[must_use]
pub fn source_id_for(document_id: &str, chunk_index: usize) -> String {
    format!("{document_id}:{chunk_index}")
}

/// Id for an evidence [`kg_core::Instance`] linking a concept to a source.
#[must_use]
pub fn instance_id_for(concept_id: &str, source_id: &str) -> String {
    let key = format!("{concept_id}\u{0}{source_id}");
    format!("instance_{}", hash_suffix(&content_hash(key.as_bytes())))
}
