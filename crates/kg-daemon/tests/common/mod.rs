//! Shared test harness for `kg-daemon`'s HTTP-level integration tests.
//!
//! Builds a full [`AppState`] the same way `main.rs` does, but wired with
//! in-memory collaborators (a [`FixedClock`], [`InMemoryGraph`],
//! [`InMemoryBlobStore`], mock extractor/embedder) so every test is
//! hermetic and deterministic.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use chrono::Duration;
use kg_artifacts::ArtifactStore;
use kg_auth::{builtin_roles, AuthorizationKernel, Identity, StaticTokenValidator};
use kg_blob::{BlobStore, InMemoryBlobStore};
use kg_broker::Broker;
use kg_clock::{Clock, FixedClock, UtcTime};
use kg_config::ControlPlaneConfig;
use kg_core::{ResourceGrant, RolePermission, ScopeType};
use kg_daemon::build_app;
use kg_daemon::job_runner::default_registry;
use kg_daemon::middleware::{CorsConfig, RateLimiter};
use kg_daemon::query_definitions::QueryDefinitionStore;
use kg_daemon::state::{AppState, ProviderCircuits};
use kg_graph::{GraphFacade, InMemoryGraph};
use kg_ingest::sink::NoopSink;
use kg_ingest::vocabulary::{CanonicalRelationshipType, RelationshipVocabulary};
use kg_ingest::IngestionPipeline;
use kg_llm::{EmbeddingService, ExtractionResult, LlmExtractor, MockEmbeddingService, MockExtractor};
use kg_queue::{JobOutcome, JobQueue};
use kg_retry::{CircuitBreaker, ProviderLimiter, RetryPolicy};
use kg_scheduler::{ArtifactCleanupLauncher, LauncherRegistry, Scheduler};
use kg_telemetry::GraphMetrics;
use tokio::sync::RwLock;

/// Bearer token the harness registers for each named test identity.
pub fn token_for(role: &str) -> String {
    format!("test-token-{role}")
}

/// A handle bundling the router under test with the services behind it, so
/// a test can drive the HTTP surface and also inspect/drive collaborators
/// directly (e.g. running a dispatched job to completion without a real
/// background loop).
pub struct Harness {
    pub app: Router,
    pub state: Arc<AppState>,
}

/// Default RBAC seed, mirroring `main.rs::default_role_permissions`.
fn default_role_permissions() -> Vec<RolePermission> {
    let allow = |role: &str, resource_type: &str, action: &str| RolePermission {
        role: role.to_string(),
        resource_type: resource_type.to_string(),
        action: action.to_string(),
        scope_type: ScopeType::Global,
        scope_id: None,
        scope_filter: None,
        granted: true,
    };
    vec![
        allow("read_only", "job", "read"),
        allow("read_only", "job", "list"),
        allow("read_only", "artifact", "read"),
        allow("read_only", "artifact", "list"),
        allow("read_only", "query_definition", "read"),
        allow("read_only", "query_definition", "list"),
        allow("read_only", "query_definition", "execute"),
        allow("contributor", "job", "create"),
        allow("contributor", "artifact", "create"),
        allow("contributor", "query_definition", "create"),
        allow("curator", "job", "approve"),
        allow("curator", "job", "cancel"),
        allow("curator", "job", "delete"),
        allow("curator", "artifact", "delete"),
        allow("curator", "query_definition", "delete"),
        allow("admin", "admin", "read"),
        allow("admin", "admin", "backup"),
        allow("platform_admin", "admin", "restore"),
    ]
}

/// Per-instance grant letting `bob` (and only `bob`) act on his own rows --
/// unused by default; tests that need per-instance grants build their own
/// [`ResourceGrant`] list instead of calling this.
fn no_resource_grants() -> Vec<ResourceGrant> {
    Vec::new()
}

/// One identity known to the harness's token validator.
pub struct TestUser {
    pub user_id: i64,
    pub username: &'static str,
    pub role: &'static str,
}

impl TestUser {
    pub fn token(&self) -> String {
        token_for(self.username)
    }
}

pub const ALICE: TestUser = TestUser { user_id: 10, username: "alice", role: "contributor" };
pub const BOB: TestUser = TestUser { user_id: 11, username: "bob", role: "contributor" };
pub const CURATOR: TestUser = TestUser { user_id: 12, username: "carol", role: "curator" };
pub const PLATFORM_ADMIN: TestUser = TestUser { user_id: 1000, username: "root-admin", role: "platform_admin" };

/// Build a harness with a fresh in-memory graph/blob store/queue and the
/// default RBAC seed, clocked at `UtcTime::epoch()`.
pub fn build() -> Harness {
    build_with_extractor(MockExtractor::new(ExtractionResult::default()))
}

/// Same as [`build`] but with a caller-supplied extractor, for tests that
/// need to script concept/relationship output per chunk.
pub fn build_with_extractor(extractor: MockExtractor) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(UtcTime::epoch()));
    let graph: Arc<dyn GraphFacade> = Arc::new(InMemoryGraph::new());
    let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());

    let mut config = ControlPlaneConfig::with_defaults();
    config.ingestion.chunk_size_chars = 32;
    config.ingestion.chunk_overlap_chars = 0;

    let queue = Arc::new(JobQueue::new(clock.clone(), config.queue.clone(), config.approval.clone()));
    let artifacts = Arc::new(ArtifactStore::new(blob.clone(), clock.clone(), config.artifacts.clone()));
    let broker = Arc::new(Broker::new(config.streaming.clone()));
    let telemetry = Arc::new(GraphMetrics::new());
    let query_definitions = Arc::new(QueryDefinitionStore::new());

    let vocabulary = Arc::new(RelationshipVocabulary::new(vec![CanonicalRelationshipType {
        relationship_type: "related_to".to_string(),
        direction: None,
        embedding: vec![0.0; 8],
    }]));
    let skipped_sink = Arc::new(NoopSink);

    let extractor: Arc<dyn LlmExtractor> = Arc::new(extractor);
    let embedder: Arc<dyn EmbeddingService> = Arc::new(MockEmbeddingService::new(config.embedding.dimensions as usize));

    let pipeline = Arc::new(IngestionPipeline::new(
        graph.clone(),
        extractor,
        embedder.clone(),
        vocabulary,
        skipped_sink,
        RetryPolicy::default(),
        Arc::new(ProviderLimiter::new(4)),
        Arc::new(ProviderLimiter::new(4)),
        clock.clone(),
        config.ingestion.clone(),
        queue.clone(),
        broker.clone(),
        artifacts.clone(),
        telemetry.clone(),
    ));

    let provider_circuits = ProviderCircuits {
        extractor: Arc::new(CircuitBreaker::new(5, Duration::minutes(1))),
        embedder: Arc::new(CircuitBreaker::new(5, Duration::minutes(1))),
    };

    let auth_kernel = Arc::new(AuthorizationKernel::new(builtin_roles(), default_role_permissions(), no_resource_grants()));

    let mut token_validator = StaticTokenValidator::new();
    for user in [ALICE, BOB, CURATOR, PLATFORM_ADMIN] {
        token_validator = token_validator.with_token(
            user.token(),
            Identity { user_id: user.user_id, username: user.username.to_string(), role: user.role.to_string(), group_ids: Vec::new() },
        );
    }

    let scheduler = Arc::new(Scheduler::new(clock.clone(), queue.clone(), {
        let mut registry = LauncherRegistry::new();
        registry.register(Arc::new(ArtifactCleanupLauncher));
        registry
    }));

    let job_runners = Arc::new(default_registry(pipeline.clone()));

    let state = Arc::new(AppState {
        clock,
        config: RwLock::new(config),
        graph,
        blob,
        queue,
        pipeline,
        job_runners,
        embedder,
        broker,
        artifacts,
        query_definitions,
        telemetry,
        scheduler,
        auth_kernel,
        token_validator: Arc::new(token_validator),
        provider_circuits,
    });

    let rate_limiter = RateLimiter::new(10_000, std::time::Duration::from_secs(60));
    let cors = CorsConfig::default();
    let app = build_app(state.clone(), rate_limiter, &cors);

    Harness { app, state }
}

/// Synchronously run every `approved` job to completion against the
/// harness's `job_runners` registry, mirroring `main.rs`'s background
/// dispatch loop without a real timer. Returns the job ids that were run.
pub async fn drain_dispatch(state: &AppState) -> Vec<String> {
    let mut run = Vec::new();
    for job in state.queue.dispatch_ready() {
        let started = state.queue.start(&job.job_id).expect("start dispatched job");
        let outcome = match state.job_runners.get(&started.job_type) {
            Some(runner) => runner.run(state, &started).await,
            None => panic!("no job runner registered for job_type {:?}", started.job_type),
        };
        match outcome {
            Ok(result) => {
                state.queue.complete(&job.job_id, JobOutcome::Success(result.clone())).expect("complete job");
                state.broker.publish_completed(&job.job_id, result).await;
            }
            Err(error) => {
                state.queue.complete(&job.job_id, JobOutcome::Failure(error.to_string())).expect("fail job");
                state.broker.publish_failed(&job.job_id, error.to_string()).await;
            }
        }
        run.push(job.job_id);
    }
    run
}
