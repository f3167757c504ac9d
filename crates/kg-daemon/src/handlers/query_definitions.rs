//! Reusable query recipe endpoints (spec §6.1 `/query-definitions`) and
//! their execution against the live graph.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Extension, Json as JsonExtract, Path, Query, State};
use axum::Json;
use kg_auth::{AuthorizationRequest, Identity};
use kg_core::{ArtifactType, DefinitionType, QueryDefinition};
use kg_error::{ErrorCode, KgError};
use kg_llm::EmbeddingPurpose;
use serde::Deserialize;

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

/// Request facts for a `scope_type=filter` check against a query definition
/// (spec §4.8: `owner=self`).
fn query_definition_scope_request(identity: &Identity, id: impl Into<String>, definition: &QueryDefinition) -> AuthorizationRequest {
    let owner = if definition.owner_id == identity.user_id { "self" } else { "other" };
    AuthorizationRequest::new().with_resource_id(id).with_fact("owner", serde_json::json!(owner))
}

/// Body of `POST /query-definitions`.
#[derive(Debug, Deserialize)]
pub struct CreateQueryDefinitionRequest {
    name: String,
    definition_type: DefinitionType,
    definition: serde_json::Value,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

/// `POST /query-definitions`.
pub async fn create_query_definition(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    JsonExtract(body): JsonExtract<CreateQueryDefinitionRequest>,
) -> AppResult<Json<QueryDefinition>> {
    require(&identity, &state, "query_definition", "create", &AuthorizationRequest::new())?;
    let definition = state
        .query_definitions
        .create(state.clock.as_ref(), body.name, identity.user_id, body.definition_type, body.definition, body.metadata)
        .await;
    Ok(Json(definition))
}

/// Query parameters for `GET /query-definitions`.
#[derive(Debug, Deserialize, Default)]
pub struct ListQueryDefinitionsQuery {
    owner: Option<i64>,
}

/// `GET /query-definitions`.
pub async fn list_query_definitions(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListQueryDefinitionsQuery>,
) -> AppResult<Json<Vec<QueryDefinition>>> {
    require(&identity, &state, "query_definition", "list", &AuthorizationRequest::new())?;
    Ok(Json(state.query_definitions.list(query.owner).await))
}

/// `DELETE /query-definitions/{id}`.
pub async fn delete_query_definition(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<Json<()>> {
    let definition = state.query_definitions.get(&id).await.map_err(AppError)?;
    require(&identity, &state, "query_definition", "delete", &query_definition_scope_request(&identity, id.clone(), &definition))?;
    state.query_definitions.delete(&id).await.map_err(AppError)?;
    Ok(Json(()))
}

/// `POST /query-definitions/{id}/execute` (spec §4.5 "produced by a query
/// execution"): runs the recipe against the live graph and persists the
/// result as a `query_result` artifact. Only `DefinitionType::Search` is
/// backed by the graph facade today; the other recipe kinds (block
/// diagram, raw Cypher-dialect, polarity, connection-finding) belong to a
/// query-planning layer this daemon does not implement, and are rejected
/// rather than silently no-opped.
pub async fn execute_query_definition(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> AppResult<Json<kg_core::Artifact>> {
    let definition = state.query_definitions.get(&id).await.map_err(AppError)?;
    require(&identity, &state, "query_definition", "execute", &query_definition_scope_request(&identity, id.clone(), &definition))?;

    if definition.definition_type != DefinitionType::Search {
        return Err(AppError(KgError::new(
            ErrorCode::ValidationUnknownVariant,
            format!("definition_type {:?} has no graph-backed executor", definition.definition_type),
        )));
    }

    let query_text = definition
        .definition
        .get("query")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| AppError(KgError::new(ErrorCode::ValidationMissingField, "search definition is missing a 'query' string")))?;
    let ontology = definition
        .definition
        .get("ontology")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("default");

    let embeddings = state.embedder.embed(&[query_text.to_string()], EmbeddingPurpose::Query).await.map_err(AppError)?;
    let embedding = embeddings.into_iter().next().ok_or_else(|| AppError(KgError::new(ErrorCode::Internal, "embedding service returned no vectors")))?;

    let min_similarity = state.config.read().await.ingestion.min_search_similarity as f32;
    let matches = state.graph.find_similar_concepts(ontology, &embedding, min_similarity).await.map_err(AppError)?;

    let results: Vec<serde_json::Value> = matches
        .iter()
        .map(|(concept, score)| serde_json::json!({"concept_id": concept.concept_id, "label": concept.label, "score": score}))
        .collect();
    let concept_ids = matches.iter().map(|(concept, _)| concept.concept_id.clone()).collect();

    let artifact = state
        .artifacts
        .persist(
            ArtifactType::QueryResult,
            "query_result".to_string(),
            format!("Results for {}", definition.name),
            Some(identity.user_id),
            serde_json::json!({"query": query_text, "ontology": ontology}),
            serde_json::json!({"results": results}),
            ontology.to_string(),
            concept_ids,
            Some(definition.id.clone()),
            state.telemetry.graph_change_counter(),
        )
        .await
        .map_err(AppError)?;
    Ok(Json(artifact))
}
