//! Artifact metadata, payload, and lifecycle endpoints (spec §4.5, §6.1).

use std::sync::Arc;

use axum::extract::{Extension, Json as JsonExtract, Path, Query, State};
use axum::Json;
use kg_auth::{AuthorizationRequest, Identity};
use kg_core::{Artifact, ArtifactType};
use kg_error::{ErrorCode, KgError};
use serde::{Deserialize, Serialize};

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

/// Request facts for a `scope_type=filter` check against an artifact (spec
/// §4.8: `owner=self`, `is_system=true`). A `None` `owner_id` means the
/// artifact is system-owned.
fn artifact_scope_request(identity: &Identity, artifact_id: impl Into<String>, artifact: &Artifact) -> AuthorizationRequest {
    let owner = if artifact.owner_id == Some(identity.user_id) { "self" } else { "other" };
    AuthorizationRequest::new()
        .with_resource_id(artifact_id)
        .with_fact("owner", serde_json::json!(owner))
        .with_fact("is_system", serde_json::json!(artifact.owner_id.is_none()))
}

/// One row of `GET /artifacts`, carrying freshness relative to the current
/// graph epoch without forcing the caller to fetch the payload.
#[derive(Debug, Serialize)]
pub struct ArtifactListEntry {
    #[serde(flatten)]
    artifact: Artifact,
    is_fresh: bool,
}

/// Query parameters for `GET /artifacts`.
#[derive(Debug, Deserialize, Default)]
pub struct ListArtifactsQuery {
    owner: Option<i64>,
    #[serde(rename = "type")]
    artifact_type: Option<String>,
    representation: Option<String>,
    ontology: Option<String>,
}

/// `GET /artifacts?owner=&type=&representation=&ontology=`.
pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListArtifactsQuery>,
) -> AppResult<Json<Vec<ArtifactListEntry>>> {
    require(&identity, &state, "artifact", "list", &AuthorizationRequest::new())?;

    let current_epoch = state.telemetry.graph_change_counter();
    let rows = state.artifacts.list(query.owner, query.ontology.as_deref()).await;
    let entries = rows
        .into_iter()
        .filter(|a| query.artifact_type.as_deref().is_none_or(|t| artifact_type_matches(&a.artifact_type, t)))
        .filter(|a| query.representation.as_deref().is_none_or(|r| a.representation == r))
        .map(|artifact| {
            let is_fresh = artifact.is_fresh(current_epoch);
            ArtifactListEntry { artifact, is_fresh }
        })
        .collect();
    Ok(Json(entries))
}

fn artifact_type_matches(artifact_type: &ArtifactType, wanted: &str) -> bool {
    match artifact_type {
        ArtifactType::Projection => wanted == "projection",
        ArtifactType::PolarityAnalysis => wanted == "polarity_analysis",
        ArtifactType::QueryResult => wanted == "query_result",
        ArtifactType::Report => wanted == "report",
        ArtifactType::StatsSnapshot => wanted == "stats_snapshot",
        ArtifactType::IngestionReport => wanted == "ingestion_report",
        ArtifactType::Other(name) => name == wanted,
    }
}

/// `GET /artifacts/{id}`: metadata plus freshness (spec §4.5 `GetMeta`).
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<Json<ArtifactListEntry>> {
    let current_epoch = state.telemetry.graph_change_counter();
    let meta = state.artifacts.get_meta(&id, current_epoch).await.map_err(AppError)?;
    require(&identity, &state, "artifact", "read", &artifact_scope_request(&identity, id, &meta.artifact))?;
    Ok(Json(ArtifactListEntry { artifact: meta.artifact, is_fresh: meta.is_fresh }))
}

/// `GET /artifacts/{id}/payload`.
pub async fn get_artifact_payload(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let current_epoch = state.telemetry.graph_change_counter();
    let meta = state.artifacts.get_meta(&id, current_epoch).await.map_err(AppError)?;
    require(&identity, &state, "artifact", "read", &artifact_scope_request(&identity, id.clone(), &meta.artifact))?;
    Ok(Json(state.artifacts.get_payload(&id).await.map_err(AppError)?))
}

/// Body of `POST /artifacts`: a directly-submitted artifact, as opposed to
/// one produced by an ingestion job or query-definition execution.
#[derive(Debug, Deserialize)]
pub struct CreateArtifactRequest {
    artifact_type: String,
    representation: String,
    name: String,
    #[serde(default)]
    parameters: serde_json::Value,
    payload: serde_json::Value,
    ontology: String,
    #[serde(default)]
    concept_ids: Vec<String>,
}

fn parse_artifact_type(name: &str) -> ArtifactType {
    match name {
        "projection" => ArtifactType::Projection,
        "polarity_analysis" => ArtifactType::PolarityAnalysis,
        "query_result" => ArtifactType::QueryResult,
        "report" => ArtifactType::Report,
        "stats_snapshot" => ArtifactType::StatsSnapshot,
        "ingestion_report" => ArtifactType::IngestionReport,
        other => ArtifactType::Other(other.to_string()),
    }
}

/// `POST /artifacts`: register a caller-supplied artifact (spec §4.5 `Persist`).
pub async fn create_artifact(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    JsonExtract(body): JsonExtract<CreateArtifactRequest>,
) -> AppResult<Json<Artifact>> {
    require(&identity, &state, "artifact", "create", &AuthorizationRequest::new())?;

    let artifact = state
        .artifacts
        .persist(
            parse_artifact_type(&body.artifact_type),
            body.representation,
            body.name,
            Some(identity.user_id),
            body.parameters,
            body.payload,
            body.ontology,
            body.concept_ids,
            None,
            state.telemetry.graph_change_counter(),
        )
        .await
        .map_err(AppError)?;
    Ok(Json(artifact))
}

/// Body of `POST /artifacts/{id}/regenerate`.
#[derive(Debug, Deserialize, Default)]
pub struct RegenerateArtifactRequest {
    payload: serde_json::Value,
}

/// `POST /artifacts/{id}/regenerate`: replace an existing artifact's
/// payload in place, bumping `graph_epoch` to the current value (spec §4.5
/// `Regenerate`). Re-running whatever produced the original payload is the
/// caller's responsibility; this only re-tiers storage for the new result.
pub async fn regenerate_artifact(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    JsonExtract(body): JsonExtract<RegenerateArtifactRequest>,
) -> AppResult<Json<Artifact>> {
    let current_epoch = state.telemetry.graph_change_counter();
    let existing = state.artifacts.get_meta(&id, current_epoch).await.map_err(AppError)?;
    require(&identity, &state, "artifact", "update", &artifact_scope_request(&identity, id.clone(), &existing.artifact))?;
    let artifact = state
        .artifacts
        .replace_payload(&id, body.payload, state.telemetry.graph_change_counter())
        .await
        .map_err(AppError)?;
    Ok(Json(artifact))
}

/// `DELETE /artifacts/{id}`.
pub async fn delete_artifact(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<Json<()>> {
    let current_epoch = state.telemetry.graph_change_counter();
    let existing = state.artifacts.get_meta(&id, current_epoch).await.map_err(AppError)?;
    require(&identity, &state, "artifact", "delete", &artifact_scope_request(&identity, id.clone(), &existing.artifact))?;
    state.artifacts.delete(&id).await.map_err(AppError)?;
    Ok(Json(()))
}
