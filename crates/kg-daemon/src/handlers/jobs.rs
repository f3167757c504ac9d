//! Job submission, inspection, and lifecycle control (spec §6.1, §6.2).

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use futures::StreamExt;
use kg_auth::{AuthorizationRequest, Identity};
use kg_broker::BrokerEvent;
use kg_core::{content_hash, Job, JobAnalysis, JobSource, JobSpec, JobStatus, JobType, ProcessingMode};
use kg_error::{ErrorCode, KgError};
use kg_ingest::IngestionJobData;
use kg_queue::{EnqueueOutcome, JobFilter};
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

/// Request facts for a `scope_type=filter` check against a job (spec §4.8:
/// `owner=self`, `is_system=true`).
fn job_scope_request(identity: &Identity, job_id: impl Into<String>, job: &Job) -> AuthorizationRequest {
    let owner = if job.user_id == identity.user_id { "self" } else { "other" };
    AuthorizationRequest::new()
        .with_resource_id(job_id)
        .with_fact("owner", serde_json::json!(owner))
        .with_fact("is_system", serde_json::json!(job.is_system_job))
}

/// Wire shape of `POST /ingest`'s response (spec §6.1): either a freshly
/// queued/awaiting-approval job, or a pointer at a prior duplicate's
/// outcome when the `(content_hash, ontology)` pair was already submitted.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    job_id: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<kg_core::JobResult>,
}

/// `POST /ingest`: accept a multipart document upload and enqueue an
/// ingestion job (spec §4.3 step 1, §6.1).
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    mut multipart: Multipart,
) -> AppResult<Response> {
    require(&identity, &state, "job", "create", &AuthorizationRequest::new())?;

    let mut document_text: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut ontology: Option<String> = None;
    let mut force = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError(KgError::new(ErrorCode::ValidationMalformedInput, e.to_string())))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "document" => {
                filename = field.file_name().map(ToString::to_string);
                let bytes = field.bytes().await.map_err(|e| AppError(KgError::new(ErrorCode::ValidationMalformedInput, e.to_string())))?;
                document_text = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            "ontology" => {
                ontology = Some(field.text().await.unwrap_or_default());
            }
            "force" => {
                force = field.text().await.unwrap_or_default() == "true";
            }
            _ => {}
        }
    }

    let document_text = document_text.ok_or_else(|| AppError(KgError::new(ErrorCode::ValidationMissingField, "missing 'document' field")))?;
    let ontology = ontology.unwrap_or_else(|| "default".to_string());

    let job_data = IngestionJobData {
        document_text: document_text.clone(),
        filename,
        source_type: "text".to_string(),
        file_path: None,
        hostname: None,
        force,
    };
    let job_data_value = serde_json::to_value(&job_data).map_err(|e| AppError(KgError::new(ErrorCode::ValidationMalformedInput, e.to_string())))?;

    let spec = JobSpec {
        job_type: JobType::Ingestion,
        job_data: job_data_value,
        content_hash: Some(content_hash(document_text.as_bytes())),
        ontology,
        user_id: identity.user_id,
        is_system_job: false,
        source: JobSource::UserApi,
        source_metadata: BTreeMap::new(),
        processing_mode: ProcessingMode::Parallel,
        force,
    };

    let analysis = JobAnalysis {
        estimated_chunks: document_text.len().div_ceil(state.config.read().await.ingestion.chunk_size_chars.max(1)),
        estimated_cost_cents: 0,
        notes: Vec::new(),
    };

    let outcome = state.queue.enqueue(spec, Some(analysis)).map_err(AppError)?;
    let response = match outcome {
        EnqueueOutcome::Created(job) => (
            StatusCode::CREATED,
            Json(IngestResponse { job_id: job.job_id, status: job.status, duplicate: None, existing_job_id: None, result: None }),
        ),
        EnqueueOutcome::AlreadyCompleted(job) => (
            StatusCode::OK,
            Json(IngestResponse {
                job_id: job.job_id.clone(),
                status: job.status,
                duplicate: Some(true),
                existing_job_id: Some(job.job_id),
                result: job.result,
            }),
        ),
    };
    Ok(response.into_response())
}

/// `GET /jobs/{job_id}`.
pub async fn get_job(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(job_id): Path<String>) -> AppResult<Json<Job>> {
    let job = state.queue.get(&job_id).map_err(AppError)?;
    require(&identity, &state, "job", "read", &job_scope_request(&identity, job_id, &job))?;
    Ok(Json(job))
}

/// Query parameters for `GET /jobs`.
#[derive(Debug, Deserialize, Default)]
pub struct ListJobsQuery {
    status: Option<JobStatus>,
    owner: Option<i64>,
    is_system_job: Option<bool>,
    after_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// `GET /jobs`.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListJobsQuery>,
) -> AppResult<Json<kg_queue::JobPage>> {
    require(&identity, &state, "job", "list", &AuthorizationRequest::new())?;
    let filter = JobFilter {
        status: query.status,
        owner: query.owner,
        is_system_job: query.is_system_job,
        after_id: query.after_id,
        limit: query.limit,
    };
    Ok(Json(state.queue.list(&filter)))
}

/// `POST /jobs/{job_id}/approve`.
pub async fn approve_job(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(job_id): Path<String>) -> AppResult<Json<Job>> {
    let job = state.queue.get(&job_id).map_err(AppError)?;
    require(&identity, &state, "job", "approve", &job_scope_request(&identity, job_id.clone(), &job))?;
    Ok(Json(state.queue.approve(&job_id, identity.user_id).map_err(AppError)?))
}

/// `POST /jobs/{job_id}/cancel`.
pub async fn cancel_job(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(job_id): Path<String>) -> AppResult<Json<Job>> {
    let job = state.queue.get(&job_id).map_err(AppError)?;
    require(&identity, &state, "job", "cancel", &job_scope_request(&identity, job_id.clone(), &job))?;
    Ok(Json(state.queue.cancel(&job_id, Some(identity.user_id), "cancelled via API").map_err(AppError)?))
}

/// `DELETE /jobs/{job_id}`: drop a terminal job's row (spec §4.1 `Delete`).
/// The job's event history outlives the row, so this never loses the audit
/// trail, only the live snapshot.
pub async fn delete_job(State(state): State<Arc<AppState>>, Extension(identity): Extension<Identity>, Path(job_id): Path<String>) -> AppResult<Json<()>> {
    let job = state.queue.get(&job_id).map_err(AppError)?;
    require(&identity, &state, "job", "delete", &job_scope_request(&identity, job_id.clone(), &job))?;
    state.queue.delete(&job_id).map_err(AppError)?;
    Ok(Json(()))
}

/// `GET /jobs/{job_id}/stream`: SSE progress events (spec §6.2, §4.6).
pub async fn stream_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(job_id): Path<String>,
) -> AppResult<Response> {
    let job = state.queue.get(&job_id).map_err(AppError)?;
    require(&identity, &state, "job", "read", &job_scope_request(&identity, job_id, &job))?;

    let subscription = state.broker.subscribe(&job.job_id).await;
    let stream = subscription.into_stream().map(|event| -> Result<SseEvent, Infallible> {
        let (event_name, data) = match &event {
            BrokerEvent::Progress(snapshot) => ("progress", serde_json::to_string(snapshot).unwrap_or_default()),
            BrokerEvent::Completed(result) => ("completed", serde_json::to_string(result).unwrap_or_default()),
            BrokerEvent::Failed(message) => ("failed", message.clone()),
            BrokerEvent::Error(message) => ("error", message.clone()),
            BrokerEvent::Keepalive => ("keepalive", String::new()),
        };
        Ok(SseEvent::default().event(event_name).data(data))
    });

    // spec §6.2: the stream must carry `Cache-Control: no-cache`,
    // `Connection: keep-alive`, and a no-buffering hint for intermediary
    // proxies, or a reverse proxy between the client and this daemon may
    // buffer the whole response instead of flushing it event-by-event.
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
        .into_response())
}
