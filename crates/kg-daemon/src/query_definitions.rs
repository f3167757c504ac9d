//! In-memory store for [`QueryDefinition`] rows (spec §3 "Query
//! Definition", §6.1 `/query-definitions`).
//!
//! No dedicated crate owns this type's persistence — it is a thin,
//! daemon-local index, grounded on [`kg_artifacts::ArtifactStore`]'s own
//! `RwLock<BTreeMap<..>>` index shape.

use std::collections::{BTreeMap, HashSet};

use kg_clock::{Clock, IdKind};
use kg_core::{DefinitionType, QueryDefinition};
use kg_error::{ErrorCode, KgError};
use tokio::sync::RwLock;

fn not_found(id: &str) -> KgError {
    KgError::new(ErrorCode::NotFoundResource, format!("no query definition with id {id}")).with_context("id", id)
}

/// The daemon-local registry of reusable query recipes.
pub struct QueryDefinitionStore {
    index: RwLock<BTreeMap<String, QueryDefinition>>,
}

impl QueryDefinitionStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { index: RwLock::new(BTreeMap::new()) }
    }

    /// Register a new recipe, minting its id from the clock.
    pub async fn create(
        &self,
        clock: &dyn Clock,
        name: String,
        owner_id: i64,
        definition_type: DefinitionType,
        definition: serde_json::Value,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> QueryDefinition {
        let now = clock.now();
        let definition = QueryDefinition {
            id: kg_clock::new_id(IdKind::QueryDefinition),
            name,
            owner_id,
            definition_type,
            definition,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.index.write().await.insert(definition.id.clone(), definition.clone());
        definition
    }

    /// Fetch one recipe by id.
    pub async fn get(&self, id: &str) -> Result<QueryDefinition, KgError> {
        self.index.read().await.get(id).cloned().ok_or_else(|| not_found(id))
    }

    /// List every recipe, optionally restricted to one owner.
    pub async fn list(&self, owner_id: Option<i64>) -> Vec<QueryDefinition> {
        self.index
            .read()
            .await
            .values()
            .filter(|d| owner_id.is_none_or(|owner| d.owner_id == owner))
            .cloned()
            .collect()
    }

    /// Delete a recipe by id.
    pub async fn delete(&self, id: &str) -> Result<(), KgError> {
        self.index.write().await.remove(id).map(|_| ()).ok_or_else(|| not_found(id))
    }

    /// The set of ids currently live, consulted by the artifact
    /// cleanup sweep to detect orphaned query-result artifacts.
    pub async fn live_ids(&self) -> HashSet<String> {
        self.index.read().await.keys().cloned().collect()
    }
}

impl Default for QueryDefinitionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_clock::{FixedClock, UtcTime};

    #[tokio::test]
    async fn create_get_list_delete_round_trip() {
        let store = QueryDefinitionStore::new();
        let clock = FixedClock::new(UtcTime::epoch());
        let def = store
            .create(&clock, "acme-search".into(), 1000, DefinitionType::Search, serde_json::json!({"query": "acme"}), BTreeMap::new())
            .await;

        assert_eq!(store.get(&def.id).await.unwrap().name, "acme-search");
        assert_eq!(store.list(Some(1000)).await.len(), 1);
        assert!(store.list(Some(7)).await.is_empty());
        assert!(store.live_ids().await.contains(&def.id));

        store.delete(&def.id).await.unwrap();
        assert!(store.get(&def.id).await.is_err());
    }
}
