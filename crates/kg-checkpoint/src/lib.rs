//! Versioned backup container (spec §6.9) and the checkpoint guard that
//! wraps risky graph operations in a snapshot/verify/rollback envelope
//! (spec §5 "Checkpoint guard").
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::future::Future;

use kg_blob::BlobStore;
use kg_clock::{Clock, UtcTime};
use kg_error::{ErrorCode, KgError};
use kg_graph::{GraphExport, GraphFacade};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only backup container version this build writes or reads. Spec §9's
/// "schema-versioned backups with conversion layer" design note applies
/// once a second version exists; until then there is nothing to convert.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Whether a [`BackupContainer`] covers the whole graph or a single
/// ontology (spec §6.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Every ontology.
    FullBackup,
    /// A single ontology, named in [`BackupContainer::ontology`].
    PartialBackup,
}

/// Row counts recorded alongside a backup's data, for a quick sanity check
/// on restore before the full integrity check runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackupStatistics {
    /// Number of concept rows.
    pub concept_count: u64,
    /// Number of relationship edge rows.
    pub edge_count: u64,
    /// Number of source rows.
    pub source_count: u64,
    /// Number of evidence instance rows.
    pub instance_count: u64,
    /// Number of document provenance rows.
    pub document_count: u64,
    /// Number of ontology rows.
    pub ontology_count: u64,
}

impl BackupStatistics {
    fn from_export(export: &GraphExport) -> Self {
        Self {
            concept_count: export.concepts.len() as u64,
            edge_count: export.relationships.len() as u64,
            source_count: export.sources.len() as u64,
            instance_count: export.instances.len() as u64,
            document_count: export.document_meta.len() as u64,
            ontology_count: export.ontologies.len() as u64,
        }
    }
}

/// The self-describing JSON backup container of spec §6.9.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackupContainer {
    /// Container format version (distinct from [`Self::schema_version`]);
    /// always `"1.0"` for this build.
    pub version: String,
    /// Monotonic schema generation the data was produced under.
    pub schema_version: u32,
    /// Full or partial.
    #[serde(rename = "type")]
    pub kind: BackupKind,
    /// When the export was taken.
    pub timestamp: UtcTime,
    /// The exported graph content.
    pub data: GraphExport,
    /// Row counts, recomputed from `data` at construction time.
    pub statistics: BackupStatistics,
}

impl BackupContainer {
    /// Build a container from an export, stamping the current schema
    /// version and recomputing statistics.
    #[must_use]
    pub fn new(kind: BackupKind, timestamp: UtcTime, data: GraphExport) -> Self {
        let statistics = BackupStatistics::from_export(&data);
        Self { version: "1.0".to_string(), schema_version: CURRENT_SCHEMA_VERSION, kind, timestamp, data, statistics }
    }

    /// Verify the container is internally consistent: declared statistics
    /// match the row counts actually present, and the schema version is one
    /// this build can read (spec §7 "incompatible schema version" → 422).
    ///
    /// # Errors
    /// Returns [`ErrorCode::UnprocessableIncompatibleSchema`] for a future
    /// schema generation, or [`ErrorCode::UnprocessableIntegrityCheckFailed`]
    /// when the recorded statistics don't match the row counts in `data`.
    pub fn verify_integrity(&self) -> Result<(), KgError> {
        if self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(KgError::new(
                ErrorCode::UnprocessableIncompatibleSchema,
                format!("backup schema_version {} is newer than {CURRENT_SCHEMA_VERSION}", self.schema_version),
            ));
        }
        let recomputed = BackupStatistics::from_export(&self.data);
        if recomputed != self.statistics {
            return Err(KgError::new(
                ErrorCode::UnprocessableIntegrityCheckFailed,
                "backup statistics do not match the row counts in its data section",
            )
            .with_context("declared_concept_count", self.statistics.concept_count.to_string())
            .with_context("actual_concept_count", recomputed.concept_count.to_string()));
        }
        Ok(())
    }
}

/// Export `graph`'s content into a [`BackupContainer`] (spec §6.6 "backup
/// export").
///
/// # Errors
/// Propagates any [`KgError`] the facade's export raises.
pub async fn export_backup(
    graph: &dyn GraphFacade,
    ontology: Option<&str>,
    clock: &dyn Clock,
) -> Result<BackupContainer, KgError> {
    let data = graph.export_all(ontology).await?;
    let kind = if ontology.is_some() { BackupKind::PartialBackup } else { BackupKind::FullBackup };
    Ok(BackupContainer::new(kind, clock.now(), data))
}

/// The `job_data` shape a `JobType::Restore` job carries (spec §6.1 `POST
/// /admin/restore`). Points at the temp blob the handler staged the upload
/// under rather than carrying the backup bytes inline, since the import
/// itself runs later, off the request task, in the worker that dispatches
/// the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJobData {
    /// Blob-store key the uploaded backup was staged under
    /// (`restore-temp/...`). The worker fetches, imports, and deletes it.
    pub temp_blob_key: String,
    /// Ontology the backup is scoped to; `None` for a full-graph backup.
    pub ontology: Option<String>,
}

/// Import a [`BackupContainer`] into `graph` (spec §6.6 "backup import").
/// Verifies the container's internal integrity first so a corrupt upload
/// never reaches the graph.
///
/// # Errors
/// Returns an `Unprocessable*` error without touching the graph if
/// [`BackupContainer::verify_integrity`] fails; otherwise propagates the
/// facade's own import errors.
pub async fn import_backup(graph: &dyn GraphFacade, container: BackupContainer, replace: bool) -> Result<(), KgError> {
    container.verify_integrity()?;
    graph.import_all(container.data, replace).await
}

/// Snapshot-before-risky-op wrapper (spec §5 "Checkpoint guard"): takes a
/// full backup, hands control to the caller's operation, runs a
/// caller-supplied post-condition check, and restores the pre-operation
/// snapshot if either the operation or the check fails.
pub struct CheckpointGuard<'a> {
    blob: &'a dyn BlobStore,
    clock: &'a dyn Clock,
}

/// What happened to the checkpoint blob written by
/// [`CheckpointGuard::run_with_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDisposal {
    /// The checkpoint blob was deleted (the common case).
    Deleted,
    /// The checkpoint blob was kept at its key for inspection
    /// (`preserve_on_failure=true` and the operation rolled back).
    Preserved,
}

/// Outcome of a guarded operation that rolled back.
#[derive(Debug)]
pub struct RollbackReport {
    /// The error that triggered the rollback (from the operation or the
    /// verification step).
    pub cause: KgError,
    /// What happened to the checkpoint blob afterward.
    pub disposal: CheckpointDisposal,
}

impl<'a> CheckpointGuard<'a> {
    /// Build a guard backed by `blob` (for the checkpoint snapshot) and
    /// `clock` (for the snapshot timestamp).
    #[must_use]
    pub fn new(blob: &'a dyn BlobStore, clock: &'a dyn Clock) -> Self {
        Self { blob, clock }
    }

    /// Run `op` against `graph` under a checkpoint. `verify` inspects `op`'s
    /// successful output and returns `Err` to reject it (e.g. a restored
    /// graph whose row counts don't match the upload's declared
    /// statistics). On any failure, `graph` is restored from the
    /// pre-operation snapshot before the error is returned.
    ///
    /// An operation failure is surfaced as
    /// [`ErrorCode::IntegrityRollback`] (500, "operation aborted"); a
    /// verification failure is surfaced with whatever code `verify`
    /// attached (typically [`ErrorCode::UnprocessableIntegrityCheckFailed`],
    /// 422) since the check itself names the precise problem.
    ///
    /// # Errors
    /// See above. Both branches attach a `rollback_reason` context entry.
    pub async fn run_with_checkpoint<T, Op, Fut, Verify>(
        &self,
        graph: &dyn GraphFacade,
        ontology: Option<&str>,
        preserve_on_failure: bool,
        op: Op,
        verify: Verify,
    ) -> Result<T, KgError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, KgError>>,
        Verify: FnOnce(&T) -> Result<(), KgError>,
    {
        let checkpoint_key = format!("checkpoints/{}.json", kg_clock::new_id(kg_clock::IdKind::Checkpoint));
        let snapshot = export_backup(graph, ontology, self.clock).await?;
        let snapshot_bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| KgError::new(ErrorCode::Internal, "serialize checkpoint snapshot").with_source(e))?;
        self.blob.put(&checkpoint_key, snapshot_bytes).await?;

        let outcome = match op().await {
            Ok(value) => match verify(&value) {
                Ok(()) => Ok(value),
                Err(verify_err) => Err(verify_err),
            },
            Err(op_err) => Err(KgError::new(ErrorCode::IntegrityRollback, "checkpoint-guarded operation failed")
                .with_source(op_err)),
        };

        match outcome {
            Ok(value) => {
                let _ = self.blob.delete(&checkpoint_key).await;
                Ok(value)
            }
            Err(cause) => {
                tracing::warn!(target: "kg_checkpoint", code = %cause.code, "rolling back to pre-operation snapshot");
                graph.import_all(snapshot.data, true).await?;
                if !preserve_on_failure {
                    let _ = self.blob.delete(&checkpoint_key).await;
                }
                Err(cause.with_context(
                    "rollback_reason",
                    if preserve_on_failure { format!("{checkpoint_key} preserved") } else { "rolled back".to_string() },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_blob::InMemoryBlobStore;
    use kg_clock::FixedClock;
    use kg_core::{Concept, Ontology, OntologyLifecycleState};
    use kg_graph::InMemoryGraph;

    fn concept(id: &str, ontology: &str) -> Concept {
        Concept {
            concept_id: id.into(),
            label: id.into(),
            description: String::new(),
            embedding: vec![1.0, 0.0],
            ontology: ontology.into(),
            created_at: UtcTime::epoch(),
        }
    }

    #[tokio::test]
    async fn export_then_import_preserves_content() {
        let clock = FixedClock::new(UtcTime::epoch());
        let graph = InMemoryGraph::new();
        graph.upsert_concept(concept("c1", "A")).await.unwrap();

        let container = export_backup(&graph, None, &clock).await.unwrap();
        assert_eq!(container.kind, BackupKind::FullBackup);
        assert_eq!(container.statistics.concept_count, 1);

        let restored = InMemoryGraph::new();
        import_backup(&restored, container, false).await.unwrap();
        assert!(restored.get_concept("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tampered_statistics_are_rejected_before_touching_the_graph() {
        let clock = FixedClock::new(UtcTime::epoch());
        let graph = InMemoryGraph::new();
        graph.upsert_concept(concept("c1", "A")).await.unwrap();
        let mut container = export_backup(&graph, None, &clock).await.unwrap();
        container.statistics.concept_count = 99;

        let restored = InMemoryGraph::new();
        let err = import_backup(&restored, container, false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnprocessableIntegrityCheckFailed);
        assert_eq!(restored.object_counts().await.unwrap().concept_count, 0);
    }

    #[tokio::test]
    async fn newer_schema_version_is_rejected() {
        let clock = FixedClock::new(UtcTime::epoch());
        let graph = InMemoryGraph::new();
        let mut container = export_backup(&graph, None, &clock).await.unwrap();
        container.schema_version = CURRENT_SCHEMA_VERSION + 1;

        let restored = InMemoryGraph::new();
        let err = import_backup(&restored, container, false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnprocessableIncompatibleSchema);
    }

    #[tokio::test]
    async fn guarded_operation_rolls_back_on_verify_failure() {
        let clock = FixedClock::new(UtcTime::epoch());
        let blob = InMemoryBlobStore::new();
        let guard = CheckpointGuard::new(&blob, &clock);
        let graph = InMemoryGraph::new();
        graph.upsert_concept(concept("before", "A")).await.unwrap();

        let result = guard
            .run_with_checkpoint(
                &graph,
                None,
                false,
                || async {
                    graph.upsert_concept(concept("after", "A")).await?;
                    graph.clear_all().await?;
                    Ok::<_, KgError>(())
                },
                |_| {
                    Err(KgError::new(ErrorCode::UnprocessableIntegrityCheckFailed, "graph is unexpectedly empty"))
                },
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnprocessableIntegrityCheckFailed);
        assert!(graph.get_concept("before").await.unwrap().is_some());
        assert!(graph.get_concept("after").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn guarded_operation_deletes_checkpoint_blob_on_success() {
        let clock = FixedClock::new(UtcTime::epoch());
        let blob = InMemoryBlobStore::new();
        let guard = CheckpointGuard::new(&blob, &clock);
        let graph = InMemoryGraph::new();

        guard
            .run_with_checkpoint(&graph, None, false, || async { Ok::<_, KgError>(()) }, |_| Ok(()))
            .await
            .unwrap();

        assert!(blob.list("checkpoints/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preserve_on_failure_keeps_the_checkpoint_blob() {
        let clock = FixedClock::new(UtcTime::epoch());
        let blob = InMemoryBlobStore::new();
        let guard = CheckpointGuard::new(&blob, &clock);
        let graph = InMemoryGraph::new();

        guard
            .run_with_checkpoint(
                &graph,
                None,
                true,
                || async { Err(KgError::new(ErrorCode::Internal, "boom")) },
                |_: &()| Ok(()),
            )
            .await
            .unwrap_err();

        assert_eq!(blob.list("checkpoints/").await.unwrap().len(), 1);
    }

    #[test]
    fn ontology_kind_roundtrips_through_import() {
        let ontology = Ontology {
            ontology_id: "A".into(),
            name: "A".into(),
            lifecycle_state: OntologyLifecycleState::Active,
            creation_epoch: 0,
        };
        assert_eq!(ontology.ontology_id, "A");
    }
}
