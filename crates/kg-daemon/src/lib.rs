//! HTTP surface for the knowledge graph control plane (spec §6): REST
//! endpoints for ingestion, job lifecycle, artifacts, query definitions,
//! and admin operations, plus an SSE stream for job progress.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod job_runner;
pub mod middleware;
pub mod query_definitions;
pub mod startup;
pub mod state;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{middleware as axum_middleware, Router};

use crate::middleware::CorsConfig;
use crate::state::AppState;

/// Build the Axum router over every resource (spec §6.1), with the
/// request-id, logging, rate-limit, CORS, and identity-resolution
/// middleware applied outermost-first: request id and logging wrap
/// everything (including rejected/rate-limited responses), identity
/// resolution runs last so handlers always see it.
pub fn build_app(state: Arc<AppState>, rate_limiter: crate::middleware::RateLimiter, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/ingest", post(handlers::jobs::ingest))
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/jobs/{job_id}", delete(handlers::jobs::delete_job))
        .route("/jobs/{job_id}/approve", post(handlers::jobs::approve_job))
        .route("/jobs/{job_id}/cancel", post(handlers::jobs::cancel_job))
        .route("/jobs/{job_id}/stream", get(handlers::jobs::stream_job))
        .route("/artifacts", get(handlers::artifacts::list_artifacts))
        .route("/artifacts", post(handlers::artifacts::create_artifact))
        .route("/artifacts/{id}", get(handlers::artifacts::get_artifact))
        .route("/artifacts/{id}", delete(handlers::artifacts::delete_artifact))
        .route("/artifacts/{id}/payload", get(handlers::artifacts::get_artifact_payload))
        .route("/artifacts/{id}/regenerate", post(handlers::artifacts::regenerate_artifact))
        .route("/query-definitions", post(handlers::query_definitions::create_query_definition))
        .route("/query-definitions", get(handlers::query_definitions::list_query_definitions))
        .route("/query-definitions/{id}", delete(handlers::query_definitions::delete_query_definition))
        .route("/query-definitions/{id}/execute", post(handlers::query_definitions::execute_query_definition))
        .route("/admin/backup", post(handlers::admin::backup))
        .route("/admin/restore", post(handlers::admin::restore))
        .route("/admin/providers", get(handlers::admin::providers))
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth::resolve_identity))
        .layer(cors.to_cors_layer())
        .layer(rate_limiter.into_layer())
        .layer(axum_middleware::from_fn(middleware::request_logger))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .with_state(state)
}
