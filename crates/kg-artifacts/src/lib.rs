//! Content-addressed artifact metadata store (spec §4.5).
//!
//! Metadata is always resident in an in-memory index; payloads above
//! `inline_threshold_bytes` are written to the [`kg_blob::BlobStore`] under
//! a type-prefixed key and only the key is kept inline. The index can be
//! snapshotted to the blob store itself so a restarted daemon doesn't lose
//! metadata for artifacts whose payload already lives in durable storage.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use kg_blob::BlobStore;
use kg_clock::Clock;
use kg_config::ArtifactsConfig;
use kg_core::{Artifact, ArtifactRepresentation, ArtifactType};
use kg_error::{ErrorCode, KgError};
use tokio::sync::RwLock;

const SNAPSHOT_KEY: &str = "artifacts/_index_snapshot.json";

fn not_found(id: &str) -> KgError {
    KgError::new(ErrorCode::NotFoundArtifact, format!("no artifact with id {id}")).with_context("artifact_id", id)
}

fn artifact_type_key(artifact_type: &ArtifactType) -> String {
    match artifact_type {
        ArtifactType::Projection => "projection".to_string(),
        ArtifactType::PolarityAnalysis => "polarity_analysis".to_string(),
        ArtifactType::QueryResult => "query_result".to_string(),
        ArtifactType::Report => "report".to_string(),
        ArtifactType::StatsSnapshot => "stats_snapshot".to_string(),
        ArtifactType::IngestionReport => "ingestion_report".to_string(),
        ArtifactType::Other(name) => name.clone(),
    }
}

/// An artifact row plus its computed freshness relative to the graph epoch
/// at read time (spec §4.5 `GetMeta`).
#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    /// The artifact row.
    pub artifact: Artifact,
    /// `true` iff `artifact.graph_epoch` matches the epoch passed to
    /// [`ArtifactStore::get_meta`].
    pub is_fresh: bool,
}

/// Ids removed by a [`ArtifactStore::cleanup`] pass, grouped by reason.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Removed because `expires_at` had passed.
    pub expired: Vec<String>,
    /// Removed because the `query_definition_id` they reference no longer exists.
    pub orphaned: Vec<String>,
    /// Removed because a newer artifact with the same type/representation/
    /// ontology/query-definition already supersedes them.
    pub superseded: Vec<String>,
}

/// The artifact store: metadata index plus inline/blob payload tiering
/// (spec §4.5).
pub struct ArtifactStore {
    blob: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: ArtifactsConfig,
    index: RwLock<BTreeMap<String, Artifact>>,
}

impl ArtifactStore {
    /// Construct an empty store backed by `blob`.
    #[must_use]
    pub fn new(blob: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, config: ArtifactsConfig) -> Self {
        Self { blob, clock, config, index: RwLock::new(BTreeMap::new()) }
    }

    /// Write path (spec §4.5 `Persist`). Inlines the payload when it fits
    /// under `inline_threshold_bytes`; otherwise writes it to the blob
    /// store under a type-prefixed key and keeps only the key.
    #[allow(clippy::too_many_arguments)]
    pub async fn persist(
        &self,
        artifact_type: ArtifactType,
        representation: ArtifactRepresentation,
        name: impl Into<String>,
        owner_id: Option<i64>,
        parameters: serde_json::Value,
        payload: serde_json::Value,
        ontology: impl Into<String>,
        concept_ids: Vec<String>,
        query_definition_id: Option<String>,
        graph_epoch: u64,
    ) -> Result<Artifact, KgError> {
        let ontology = ontology.into();
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| KgError::new(ErrorCode::Internal, "serialize artifact payload").with_source(e))?;
        let id = kg_clock::new_id(kg_clock::IdKind::Artifact);

        let (inline_result, garage_key) = if bytes.len() as u64 <= self.config.inline_threshold_bytes {
            (Some(payload), None)
        } else {
            let key = kg_blob::artifact_key(&artifact_type_key(&artifact_type), Some(ontology.as_str()), &id);
            self.blob.put(&key, bytes).await?;
            (None, Some(key))
        };

        let artifact = Artifact {
            id: id.clone(),
            artifact_type,
            representation,
            name: name.into(),
            owner_id,
            parameters,
            metadata: BTreeMap::new(),
            graph_epoch,
            inline_result,
            garage_key,
            created_at: self.clock.now(),
            expires_at: None,
            concept_ids,
            ontology,
            query_definition_id,
        };
        self.index.write().await.insert(id, artifact.clone());
        Ok(artifact)
    }

    /// Read path: metadata plus freshness (spec §4.5 `GetMeta`).
    pub async fn get_meta(&self, id: &str, current_graph_epoch: u64) -> Result<ArtifactMeta, KgError> {
        let artifact = self.index.read().await.get(id).cloned().ok_or_else(|| not_found(id))?;
        let is_fresh = artifact.is_fresh(current_graph_epoch);
        Ok(ArtifactMeta { artifact, is_fresh })
    }

    /// Read path: payload, inline or fetched from the blob store (spec §4.5
    /// `GetPayload`). A missing blob leaves the metadata row untouched and
    /// fails with [`ErrorCode::NotFoundArtifactPayload`].
    pub async fn get_payload(&self, id: &str) -> Result<serde_json::Value, KgError> {
        let artifact = self.index.read().await.get(id).cloned().ok_or_else(|| not_found(id))?;
        if let Some(inline) = artifact.inline_result {
            return Ok(inline);
        }
        let key = artifact.garage_key.ok_or_else(|| {
            KgError::new(ErrorCode::Internal, format!("artifact {id} has neither inline_result nor garage_key"))
        })?;
        let bytes = self.blob.get(&key).await.map_err(|_| {
            KgError::new(ErrorCode::NotFoundArtifactPayload, format!("blob payload missing for artifact {id}"))
                .with_context("artifact_id", id)
                .with_context("garage_key", key.clone())
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| KgError::new(ErrorCode::Internal, "deserialize artifact payload").with_source(e))
    }

    /// Regeneration primitive (spec §4.5 `Regenerate`): re-tier and replace
    /// an existing artifact's payload in place, bumping `graph_epoch`. The
    /// caller is responsible for re-running the job/query that produced the
    /// original payload; this only handles the storage-tier mechanics and
    /// updates `job.artifact_id` linkage is left to the caller.
    pub async fn replace_payload(
        &self,
        id: &str,
        payload: serde_json::Value,
        graph_epoch: u64,
    ) -> Result<Artifact, KgError> {
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| KgError::new(ErrorCode::Internal, "serialize artifact payload").with_source(e))?;
        let (artifact_type, ontology, old_garage_key) = {
            let index = self.index.read().await;
            let artifact = index.get(id).ok_or_else(|| not_found(id))?;
            (artifact.artifact_type.clone(), artifact.ontology.clone(), artifact.garage_key.clone())
        };

        let (inline_result, garage_key) = if bytes.len() as u64 <= self.config.inline_threshold_bytes {
            (Some(payload), None)
        } else {
            let key = kg_blob::artifact_key(&artifact_type_key(&artifact_type), Some(ontology.as_str()), id);
            self.blob.put(&key, bytes).await?;
            (None, Some(key))
        };

        let result = {
            let mut index = self.index.write().await;
            let artifact = index.get_mut(id).ok_or_else(|| not_found(id))?;
            artifact.inline_result = inline_result;
            artifact.garage_key = garage_key.clone();
            artifact.graph_epoch = graph_epoch;
            artifact.clone()
        };

        if let Some(old_key) = old_garage_key {
            if garage_key.as_deref() != Some(old_key.as_str()) {
                let _ = self.blob.delete(&old_key).await;
            }
        }
        Ok(result)
    }

    /// Delete an artifact's metadata row and its blob payload, if any.
    pub async fn delete(&self, id: &str) -> Result<(), KgError> {
        let removed = self.index.write().await.remove(id).ok_or_else(|| not_found(id))?;
        if let Some(key) = removed.garage_key {
            self.blob.delete(&key).await?;
        }
        Ok(())
    }

    /// List artifacts, optionally filtered by owner and/or ontology.
    pub async fn list(&self, owner_id: Option<i64>, ontology: Option<&str>) -> Vec<Artifact> {
        self.index
            .read()
            .await
            .values()
            .filter(|a| owner_id.is_none_or(|owner| a.owner_id == Some(owner)))
            .filter(|a| ontology.is_none_or(|ont| a.ontology == ont))
            .cloned()
            .collect()
    }

    /// Persist the metadata index to the blob store so a restarted daemon
    /// can repopulate it without losing artifact rows whose payload
    /// already lives in durable storage.
    pub async fn save_snapshot(&self) -> Result<(), KgError> {
        let rows: Vec<Artifact> = self.index.read().await.values().cloned().collect();
        let bytes = serde_json::to_vec(&rows)
            .map_err(|e| KgError::new(ErrorCode::Internal, "serialize artifact snapshot").with_source(e))?;
        self.blob.put(SNAPSHOT_KEY, bytes).await
    }

    /// Repopulate the metadata index from a prior [`Self::save_snapshot`].
    /// Returns the number of rows loaded; `0` if no snapshot exists yet.
    pub async fn load_snapshot(&self) -> Result<usize, KgError> {
        let bytes = match self.blob.get(SNAPSHOT_KEY).await {
            Ok(bytes) => bytes,
            Err(e) if e.code == ErrorCode::NotFoundResource => return Ok(0),
            Err(e) => return Err(e),
        };
        let rows: Vec<Artifact> = serde_json::from_slice(&bytes)
            .map_err(|e| KgError::new(ErrorCode::Internal, "deserialize artifact snapshot").with_source(e))?;
        let count = rows.len();
        let mut index = self.index.write().await;
        for artifact in rows {
            index.insert(artifact.id.clone(), artifact);
        }
        Ok(count)
    }

    /// The daily cleanup job (spec §4.5, §4.2 `artifact-cleanup`): removes
    /// expired artifacts, artifacts orphaned by a deleted query definition
    /// (`live_query_definition_ids` is the current surviving set), and
    /// artifacts superseded by a newer one sharing the same type,
    /// representation, ontology, and query definition.
    pub async fn cleanup(&self, live_query_definition_ids: &HashSet<String>) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();
        let mut to_remove: Vec<(String, Option<String>)> = Vec::new();

        {
            let index = self.index.read().await;
            let mut remaining: Vec<&Artifact> = Vec::new();
            for artifact in index.values() {
                if artifact.expires_at.is_some_and(|exp| now.seconds_since(exp) >= 0) {
                    report.expired.push(artifact.id.clone());
                } else if artifact
                    .query_definition_id
                    .as_ref()
                    .is_some_and(|qid| !live_query_definition_ids.contains(qid))
                {
                    report.orphaned.push(artifact.id.clone());
                } else {
                    remaining.push(artifact);
                }
            }

            let mut groups: BTreeMap<(String, String, String, Option<String>), Vec<&Artifact>> = BTreeMap::new();
            for artifact in remaining {
                let key = (
                    artifact_type_key(&artifact.artifact_type),
                    artifact.representation.clone(),
                    artifact.ontology.clone(),
                    artifact.query_definition_id.clone(),
                );
                groups.entry(key).or_default().push(artifact);
            }
            for mut group in groups.into_values() {
                if group.len() <= 1 {
                    continue;
                }
                // graph_epoch is the authoritative recency signal (bumped on every
                // regenerate); created_at only breaks ties within the same epoch,
                // since ids are random and timestamps can coincide.
                group.sort_by_key(|a| Reverse((a.graph_epoch, a.created_at)));
                for stale in &group[1..] {
                    report.superseded.push(stale.id.clone());
                }
            }

            for id in report.expired.iter().chain(&report.orphaned).chain(&report.superseded) {
                if let Some(artifact) = index.get(id) {
                    to_remove.push((id.clone(), artifact.garage_key.clone()));
                }
            }
        }

        if !to_remove.is_empty() {
            let mut index = self.index.write().await;
            for (id, _) in &to_remove {
                index.remove(id);
            }
        }
        for (_, garage_key) in &to_remove {
            if let Some(key) = garage_key {
                let _ = self.blob.delete(key).await;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_blob::InMemoryBlobStore;
    use kg_clock::{FixedClock, UtcTime};

    fn store() -> ArtifactStore {
        ArtifactStore::new(
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(FixedClock::new(UtcTime::epoch())),
            ArtifactsConfig { inline_threshold_bytes: 64, localstorage_cache_mb: 10 },
        )
    }

    #[tokio::test]
    async fn small_payload_is_inlined_large_payload_goes_to_blob() {
        let store = store();
        let small = store
            .persist(
                ArtifactType::Report,
                "table".into(),
                "small",
                Some(1),
                serde_json::json!({}),
                serde_json::json!({"n": 1}),
                "default",
                vec![],
                None,
                5,
            )
            .await
            .unwrap();
        assert!(small.inline_result.is_some());
        assert!(small.garage_key.is_none());

        let big_payload = serde_json::json!({"data": "x".repeat(200)});
        let big = store
            .persist(
                ArtifactType::Report,
                "table".into(),
                "big",
                Some(1),
                serde_json::json!({}),
                big_payload.clone(),
                "default",
                vec![],
                None,
                5,
            )
            .await
            .unwrap();
        assert!(big.inline_result.is_none());
        assert!(big.garage_key.is_some());

        let fetched = store.get_payload(&big.id).await.unwrap();
        assert_eq!(fetched, big_payload);
    }

    #[tokio::test]
    async fn freshness_tracks_graph_epoch() {
        let store = store();
        let artifact = store
            .persist(
                ArtifactType::StatsSnapshot,
                "summary".into(),
                "stats",
                None,
                serde_json::json!({}),
                serde_json::json!({}),
                "default",
                vec![],
                None,
                10,
            )
            .await
            .unwrap();
        let fresh = store.get_meta(&artifact.id, 10).await.unwrap();
        assert!(fresh.is_fresh);
        let stale = store.get_meta(&artifact.id, 11).await.unwrap();
        assert!(!stale.is_fresh);
    }

    #[tokio::test]
    async fn missing_blob_payload_is_reported_without_dropping_metadata() {
        let store = store();
        let artifact = store
            .persist(
                ArtifactType::Report,
                "table".into(),
                "big",
                None,
                serde_json::json!({}),
                serde_json::json!({"data": "x".repeat(200)}),
                "default",
                vec![],
                None,
                1,
            )
            .await
            .unwrap();
        let key = artifact.garage_key.clone().unwrap();
        store.blob.delete(&key).await.unwrap();

        let err = store.get_payload(&artifact.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFoundArtifactPayload);
        assert!(store.get_meta(&artifact.id, 1).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_the_blob_store() {
        let store = store();
        store
            .persist(
                ArtifactType::Projection,
                "graph".into(),
                "p1",
                None,
                serde_json::json!({}),
                serde_json::json!({"x": 1}),
                "default",
                vec![],
                None,
                1,
            )
            .await
            .unwrap();
        store.save_snapshot().await.unwrap();

        // Reconstruct with the same blob store instance to simulate a restart.
        let shared_blob = store.blob.clone();
        let reloaded = ArtifactStore::new(shared_blob, Arc::new(FixedClock::new(UtcTime::epoch())), store.config);
        let count = reloaded.load_snapshot().await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(reloaded.list(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_orphaned_and_superseded() {
        let store = store();
        let clock = FixedClock::new(UtcTime::epoch());
        let store = ArtifactStore::new(Arc::new(InMemoryBlobStore::new()), Arc::new(clock), store.config);

        let mut expired = store
            .persist(
                ArtifactType::Report,
                "r".into(),
                "expired",
                None,
                serde_json::json!({}),
                serde_json::json!({}),
                "default",
                vec![],
                None,
                1,
            )
            .await
            .unwrap();
        expired.expires_at = Some(UtcTime::epoch());
        store.index.write().await.insert(expired.id.clone(), expired.clone());

        let orphaned = store
            .persist(
                ArtifactType::QueryResult,
                "r".into(),
                "orphaned",
                None,
                serde_json::json!({}),
                serde_json::json!({}),
                "default",
                vec![],
                Some("qdef_gone".into()),
                1,
            )
            .await
            .unwrap();

        let older = store
            .persist(
                ArtifactType::Report,
                "table".into(),
                "older",
                None,
                serde_json::json!({}),
                serde_json::json!({}),
                "default",
                vec![],
                None,
                1,
            )
            .await
            .unwrap();
        let newer = store
            .persist(
                ArtifactType::Report,
                "table".into(),
                "newer",
                None,
                serde_json::json!({}),
                serde_json::json!({}),
                "default",
                vec![],
                None,
                2,
            )
            .await
            .unwrap();

        let report = store.cleanup(&HashSet::new()).await;
        assert_eq!(report.expired, vec![expired.id.clone()]);
        assert_eq!(report.orphaned, vec![orphaned.id.clone()]);
        assert_eq!(report.superseded, vec![older.id.clone()]);
        let remaining = store.list(None, None).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newer.id);
    }
}
