//! Relationship-type vocabulary enforcement (spec §4.4): an extracted
//! relationship's proposed type is accepted only if it is a canonical type
//! for the ontology, or can be substituted for one by embedding similarity;
//! otherwise the relationship is dropped and logged.

use kg_core::RelationshipDirection;
use kg_graph::cosine_similarity;
use kg_rule_engine::{facts_from_pairs, Condition, Effect, Rule, RuleEngine};
use serde_json::json;

/// A relationship type the ontology recognises, with a cached embedding
/// used for similarity-based substitution of near-miss proposed types.
#[derive(Debug, Clone)]
pub struct CanonicalRelationshipType {
    /// The canonical wire value, e.g. `"causes"`.
    pub relationship_type: String,
    /// Declared direction, or `None` to fall back to
    /// [`RelationshipDirection::Outward`] (spec §4.4).
    pub direction: Option<RelationshipDirection>,
    /// Embedding of the type's label/description, used for the similarity
    /// fallback.
    pub embedding: Vec<f32>,
}

/// The outcome of resolving a proposed relationship type against the
/// vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum VocabResolution {
    /// The proposed type is itself canonical.
    Canonical {
        /// The canonical type.
        relationship_type: String,
        /// Edge direction to record.
        direction: RelationshipDirection,
    },
    /// The proposed type was substituted for the nearest canonical type by
    /// embedding similarity.
    Substituted {
        /// The canonical type substituted in.
        relationship_type: String,
        /// Edge direction to record.
        direction: RelationshipDirection,
        /// Cosine similarity that earned the substitution.
        similarity: f32,
    },
    /// No canonical type matched or came close enough; the relationship is
    /// dropped.
    Skipped {
        /// The proposed type as extracted, preserved for the skip log.
        proposed_type: String,
    },
}

const SUBSTITUTION_THRESHOLD: f32 = 0.70;

/// Enforces a fixed relationship-type vocabulary per ontology, built on
/// [`RuleEngine`] for the exact-match path with an embedding-similarity
/// fallback for near-miss proposed types (spec §4.4).
pub struct RelationshipVocabulary {
    engine: RuleEngine,
    canonical: Vec<CanonicalRelationshipType>,
    similarity_threshold: f32,
}

impl RelationshipVocabulary {
    /// Build a vocabulary from a fixed set of canonical types, one
    /// exact-match [`Rule`] per type.
    #[must_use]
    pub fn new(canonical: Vec<CanonicalRelationshipType>) -> Self {
        let mut engine = RuleEngine::new();
        for c in &canonical {
            engine.add_rule(Rule {
                id: format!("canonical:{}", c.relationship_type),
                condition: Condition::Eq { key: "proposed_type".to_string(), value: json!(c.relationship_type) },
                effect: Effect::Allow,
                priority: 100,
            });
        }
        Self { engine, canonical, similarity_threshold: SUBSTITUTION_THRESHOLD }
    }

    /// `true` when `proposed_type` is itself a canonical type, with no
    /// embedding needed to decide. Used by the embed stage to skip
    /// embedding types that will resolve for free.
    #[must_use]
    pub fn is_canonical(&self, proposed_type: &str) -> bool {
        let facts = facts_from_pairs([("proposed_type", json!(proposed_type))]);
        matches!(self.engine.evaluate(&facts), Some(Effect::Allow))
    }

    /// Resolve a proposed relationship type. `proposed_embedding` is
    /// required for the substitution fallback; pass `None` when the
    /// embedding was not computed (the resolution then degrades straight
    /// to `Skipped` on a non-exact match).
    #[must_use]
    pub fn resolve(&self, proposed_type: &str, proposed_embedding: Option<&[f32]>) -> VocabResolution {
        let facts = facts_from_pairs([("proposed_type", json!(proposed_type))]);
        if matches!(self.engine.evaluate(&facts), Some(Effect::Allow)) {
            let canonical = self
                .canonical
                .iter()
                .find(|c| c.relationship_type == proposed_type)
                .expect("rule table and canonical list must stay in sync");
            return VocabResolution::Canonical {
                relationship_type: canonical.relationship_type.clone(),
                direction: canonical.direction.unwrap_or(RelationshipDirection::Outward),
            };
        }

        if let Some(embedding) = proposed_embedding {
            let best = self
                .canonical
                .iter()
                .map(|c| (c, cosine_similarity(embedding, &c.embedding)))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((canonical, similarity)) = best {
                if similarity >= self.similarity_threshold {
                    return VocabResolution::Substituted {
                        relationship_type: canonical.relationship_type.clone(),
                        direction: canonical.direction.unwrap_or(RelationshipDirection::Outward),
                        similarity,
                    };
                }
            }
        }

        VocabResolution::Skipped { proposed_type: proposed_type.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> RelationshipVocabulary {
        RelationshipVocabulary::new(vec![
            CanonicalRelationshipType {
                relationship_type: "causes".to_string(),
                direction: Some(RelationshipDirection::Outward),
                embedding: vec![1.0, 0.0],
            },
            CanonicalRelationshipType {
                relationship_type: "part_of".to_string(),
                direction: None,
                embedding: vec![0.0, 1.0],
            },
        ])
    }

    #[test]
    fn exact_match_resolves_canonical() {
        let resolution = vocab().resolve("causes", None);
        assert_eq!(
            resolution,
            VocabResolution::Canonical { relationship_type: "causes".to_string(), direction: RelationshipDirection::Outward }
        );
    }

    #[test]
    fn undeclared_direction_defaults_to_outward() {
        let resolution = vocab().resolve("part_of", None);
        assert_eq!(
            resolution,
            VocabResolution::Canonical { relationship_type: "part_of".to_string(), direction: RelationshipDirection::Outward }
        );
    }

    #[test]
    fn near_miss_embedding_is_substituted_above_threshold() {
        let resolution = vocab().resolve("triggers", Some(&[0.95, 0.05]));
        match resolution {
            VocabResolution::Substituted { relationship_type, similarity, .. } => {
                assert_eq!(relationship_type, "causes");
                assert!(similarity >= 0.70);
            }
            other => panic!("expected substitution, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_embedding_below_threshold_is_skipped() {
        let resolution = vocab().resolve("unrelated_thing", Some(&[-1.0, -1.0]));
        assert_eq!(resolution, VocabResolution::Skipped { proposed_type: "unrelated_thing".to_string() });
    }

    #[test]
    fn no_embedding_and_no_exact_match_is_skipped() {
        let resolution = vocab().resolve("mystery", None);
        assert_eq!(resolution, VocabResolution::Skipped { proposed_type: "mystery".to_string() });
    }
}
