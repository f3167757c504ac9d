//! Backup/restore and provider-health endpoints (spec §6.1, §6.6, §6.9).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Multipart, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kg_auth::{AuthorizationRequest, Identity};
use kg_checkpoint::{BackupContainer, RestoreJobData};
use kg_core::{JobSource, JobSpec, JobType, ProcessingMode};
use kg_error::{ErrorCode, KgError};
use kg_retry::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

fn require(identity: &Identity, state: &AppState, resource_type: &str, action: &str, request: &AuthorizationRequest) -> Result<(), AppError> {
    let decision = state.auth_kernel.authorize(identity, resource_type, action, request);
    if decision.is_allowed() {
        Ok(())
    } else {
        Err(AppError(KgError::new(ErrorCode::AuthorizationDenied, decision.reason.unwrap_or_else(|| "access denied".to_string()))))
    }
}

/// Query parameters for `POST /admin/backup`.
#[derive(Debug, Deserialize, Default)]
pub struct BackupQuery {
    ontology: Option<String>,
}

/// `POST /admin/backup`: stream a JSON backup dump (spec §6.1, §6.9). The
/// dump is produced eagerly and returned as one chunked body; an
/// incrementally-streamed encoder would avoid holding the whole export in
/// memory, but nothing downstream of [`kg_checkpoint::export_backup`]
/// supports that yet.
pub async fn backup(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<BackupQuery>,
) -> AppResult<Response> {
    require(&identity, &state, "admin", "backup", &AuthorizationRequest::new())?;

    let container = kg_checkpoint::export_backup(state.graph.as_ref(), query.ontology.as_deref(), state.clock.as_ref())
        .await
        .map_err(AppError)?;
    let body = serde_json::to_vec(&container).map_err(|e| AppError(KgError::new(ErrorCode::Internal, "serialize backup container").with_source(e)))?;

    let filename = format!("backup-{}.json", state.clock.now().to_rfc3339().replace(':', "-"));
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
        .into_response())
}

const RESTORE_TEMP_BLOB_PREFIX: &str = "restore-temp/";

/// `POST /admin/restore`: accept a multipart backup upload, stage it as a
/// temp blob, run the upload's own integrity check, then enqueue a
/// `JobType::Restore` job so the actual import runs like any other job —
/// on a worker, through `JobQueue`'s approve/dispatch/complete lifecycle,
/// under a `CheckpointGuard` (spec §5, §6.1). This handler never touches
/// the graph itself; a failed integrity check here means the temp blob is
/// cleaned up immediately since no worker will ever pick up a job that was
/// never enqueued. The temp-blob prefix is also swept at daemon startup
/// for anything older than 24h (spec §6.1) via
/// [`crate::startup::sweep_stale_restore_blobs`].
pub async fn restore(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    mut multipart: Multipart,
) -> AppResult<Json<RestoreOutcome>> {
    require(&identity, &state, "admin", "restore", &AuthorizationRequest::new())?;

    let mut bytes: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| AppError(KgError::new(ErrorCode::ValidationMalformedInput, e.to_string())))? {
        if field.name() == Some("backup") {
            bytes = Some(field.bytes().await.map_err(|e| AppError(KgError::new(ErrorCode::ValidationMalformedInput, e.to_string())))?);
        }
    }
    let bytes = bytes.ok_or_else(|| AppError(KgError::new(ErrorCode::ValidationMissingField, "missing 'backup' field")))?;

    let temp_key = format!(
        "{RESTORE_TEMP_BLOB_PREFIX}{}-{}.json",
        state.clock.now().seconds_since(kg_clock::UtcTime::epoch()),
        kg_clock::new_id(kg_clock::IdKind::Checkpoint)
    );
    state.blob.put(&temp_key, bytes.to_vec()).await.map_err(AppError)?;

    let container: BackupContainer = match serde_json::from_slice(&bytes) {
        Ok(container) => container,
        Err(e) => {
            let _ = state.blob.delete(&temp_key).await;
            return Err(AppError(KgError::new(ErrorCode::ValidationMalformedInput, "uploaded backup is not valid JSON").with_source(e)));
        }
    };
    if let Err(error) = container.verify_integrity() {
        let _ = state.blob.delete(&temp_key).await;
        return Err(AppError(error));
    }

    let ontology = match container.kind {
        kg_checkpoint::BackupKind::PartialBackup => container.data.ontologies.first().map(|o| o.ontology_id.clone()),
        kg_checkpoint::BackupKind::FullBackup => None,
    };
    let statistics = container.statistics;

    let job_data = RestoreJobData { temp_blob_key: temp_key.clone(), ontology: ontology.clone() };
    let spec = JobSpec {
        job_type: JobType::Restore,
        job_data: serde_json::to_value(&job_data)
            .map_err(|e| AppError(KgError::new(ErrorCode::Internal, "serialize restore job_data").with_source(e)))?,
        content_hash: None,
        ontology: ontology.unwrap_or_else(|| "default".to_string()),
        user_id: identity.user_id,
        is_system_job: true,
        source: JobSource::UserApi,
        source_metadata: BTreeMap::new(),
        processing_mode: ProcessingMode::Serial,
        force: true,
    };
    let job = match state.queue.enqueue(spec, None) {
        Ok(kg_queue::EnqueueOutcome::Created(job)) => job,
        Ok(kg_queue::EnqueueOutcome::AlreadyCompleted(job)) => job,
        Err(error) => {
            let _ = state.blob.delete(&temp_key).await;
            return Err(AppError(error));
        }
    };

    Ok(Json(RestoreOutcome { job_id: job.job_id, status: job.status, statistics }))
}

/// Response body for an enqueued restore (spec §6.1).
#[derive(Debug, Serialize)]
pub struct RestoreOutcome {
    job_id: String,
    status: kg_core::JobStatus,
    statistics: kg_checkpoint::BackupStatistics,
}

#[derive(Debug, Serialize)]
struct ProviderHealth {
    state: &'static str,
}

fn describe(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

/// `GET /admin/providers`: read-only circuit-breaker state for the
/// extractor and embedder providers.
pub async fn providers(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>) -> AppResult<Json<BTreeMap<String, ProviderHealth>>> {
    require(&identity, &state, "admin", "read", &AuthorizationRequest::new())?;
    let now = state.clock.now();
    let mut health = BTreeMap::new();
    health.insert("extractor".to_string(), ProviderHealth { state: describe(state.provider_circuits.extractor.state(now)) });
    health.insert("embedder".to_string(), ProviderHealth { state: describe(state.provider_circuits.embedder.state(now)) });
    Ok(Json(health))
}
