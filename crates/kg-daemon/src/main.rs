#![deny(unsafe_code)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use kg_artifacts::ArtifactStore;
use kg_auth::{builtin_roles, AuthorizationKernel, Identity, StaticTokenValidator};
use kg_blob::{BlobStore, FilesystemBlobStore, InMemoryBlobStore};
use kg_broker::Broker;
use kg_clock::{Clock, SystemClock, INITIAL_ADMIN_USER_ID};
use kg_config::ControlPlaneConfig;
use kg_core::{PrincipalType, ResourceGrant, RolePermission, ScopeType};
use kg_daemon::middleware::{CorsConfig, RateLimiter};
use kg_daemon::query_definitions::QueryDefinitionStore;
use kg_daemon::state::{AppState, ProviderCircuits};
use kg_daemon::{build_app, startup};
use kg_graph::{GraphFacade, InMemoryGraph};
use kg_ingest::sink::NoopSink;
use kg_ingest::vocabulary::{CanonicalRelationshipType, RelationshipVocabulary};
use kg_ingest::IngestionPipeline;
use kg_llm::{EmbeddingService, ExtractionResult, LlmExtractor, MockEmbeddingService, MockExtractor};
use kg_queue::JobQueue;
use kg_retry::{CircuitBreaker, ProviderLimiter, RetryPolicy};
use kg_scheduler::{
    category_refresh_launcher, epistemic_remeasurement_launcher, ontology_annealing_launcher, projection_refresh_launcher,
    vocabulary_consolidation_launcher, ArtifactCleanupLauncher, LauncherContext, LauncherRegistry, Scheduler,
};
use kg_telemetry::GraphMetrics;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Default ontology new jobs and launchers operate against when a caller
/// doesn't name one. Matches the default the ingest handler falls back to.
const DEFAULT_ONTOLOGY: &str = "default";

#[derive(Parser, Debug)]
#[command(name = "kg-daemon", version, about = "Knowledge graph control plane daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Path to a TOML configuration file. Falls back to built-in defaults,
    /// then `KGCP_*` environment overrides, when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for blob storage (artifact payloads, checkpoint backups).
    /// When omitted, an in-memory blob store is used and nothing survives
    /// a restart.
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Bootstrap bearer token for the initial administrator, read from the
    /// environment rather than the command line so it never lands in shell
    /// history or `ps`. Required to reach any `admin:*`-scoped endpoint.
    #[arg(long, env = "KGCP_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Enable verbose logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("kg_daemon=debug,kg_ingest=debug,kg_scheduler=debug,info")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ControlPlaneConfig::load(args.config.as_deref()).context("load configuration")?;
    let warnings = config.validate().context("validate configuration")?;
    for warning in &warnings {
        warn!(%warning, "configuration warning");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let graph: Arc<dyn GraphFacade> = Arc::new(InMemoryGraph::new());

    let blob: Arc<dyn BlobStore> = match &args.blob_dir {
        Some(dir) => Arc::new(FilesystemBlobStore::new(dir.clone())),
        None => Arc::new(InMemoryBlobStore::new()),
    };

    let queue = Arc::new(JobQueue::new(clock.clone(), config.queue.clone(), config.approval.clone()));
    let artifacts = Arc::new(ArtifactStore::new(blob.clone(), clock.clone(), config.artifacts.clone()));
    let broker = Arc::new(Broker::new(config.streaming.clone()));
    let telemetry = Arc::new(GraphMetrics::new());
    let query_definitions = Arc::new(QueryDefinitionStore::new());

    let vocabulary = Arc::new(default_vocabulary());
    let skipped_sink = Arc::new(NoopSink);

    let extractor: Arc<dyn LlmExtractor> = Arc::new(MockExtractor::new(ExtractionResult::default()));
    let embedder: Arc<dyn EmbeddingService> = Arc::new(MockEmbeddingService::new(config.embedding.dimensions as usize));

    let extractor_limiter = Arc::new(ProviderLimiter::new(4));
    let embedder_limiter = Arc::new(ProviderLimiter::new(4));
    let retry_policy = RetryPolicy::default();

    let pipeline = Arc::new(IngestionPipeline::new(
        graph.clone(),
        extractor,
        embedder.clone(),
        vocabulary,
        skipped_sink,
        retry_policy,
        extractor_limiter,
        embedder_limiter,
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

    let auth_kernel = Arc::new(AuthorizationKernel::new(builtin_roles(), default_role_permissions(), default_resource_grants()));

    let mut token_validator = StaticTokenValidator::new();
    if let Some(token) = &args.admin_token {
        token_validator = token_validator.with_token(
            token.clone(),
            Identity {
                user_id: INITIAL_ADMIN_USER_ID,
                username: "admin".to_string(),
                role: "platform_admin".to_string(),
                group_ids: Vec::new(),
            },
        );
    } else {
        warn!("no KGCP_ADMIN_TOKEN set; admin-scoped endpoints are unreachable until one is configured");
    }

    let mut registry = LauncherRegistry::new();
    registry.register(Arc::new(category_refresh_launcher(DEFAULT_ONTOLOGY)));
    registry.register(Arc::new(vocabulary_consolidation_launcher(DEFAULT_ONTOLOGY)));
    registry.register(Arc::new(projection_refresh_launcher(DEFAULT_ONTOLOGY)));
    registry.register(Arc::new(epistemic_remeasurement_launcher(DEFAULT_ONTOLOGY, 25)));
    registry.register(Arc::new(ontology_annealing_launcher(DEFAULT_ONTOLOGY, 100)));
    registry.register(Arc::new(ArtifactCleanupLauncher));

    let scheduler = Arc::new(Scheduler::new(clock.clone(), queue.clone(), registry));
    scheduler.add_schedule("category-refresh", "category-refresh", "0 0 */6 * * *", 3).context("schedule category-refresh")?;
    scheduler
        .add_schedule("vocabulary-consolidation", "vocabulary-consolidation", "0 0 */12 * * *", 3)
        .context("schedule vocabulary-consolidation")?;
    scheduler.add_schedule("projection-refresh", "projection-refresh", "0 0 * * * *", 3).context("schedule projection-refresh")?;
    scheduler
        .add_schedule("epistemic-remeasurement", "epistemic-remeasurement", "0 0 0 * * *", 3)
        .context("schedule epistemic-remeasurement")?;
    scheduler.add_schedule("ontology-annealing", "ontology-annealing", "0 0 0 * * *", 3).context("schedule ontology-annealing")?;
    scheduler.add_schedule("artifact-cleanup", "artifact-cleanup", "0 30 0 * * *", 3).context("schedule artifact-cleanup")?;

    startup::sweep_stale_restore_blobs(blob.as_ref(), clock.as_ref())
        .await
        .context("sweep stale restore-temp blobs")?;

    let job_runners = Arc::new(kg_daemon::job_runner::default_registry(pipeline.clone()));

    let state = Arc::new(AppState {
        clock: clock.clone(),
        config: RwLock::new(config),
        graph: graph.clone(),
        blob: blob.clone(),
        queue: queue.clone(),
        pipeline: pipeline.clone(),
        job_runners,
        embedder,
        broker: broker.clone(),
        artifacts: artifacts.clone(),
        query_definitions,
        telemetry: telemetry.clone(),
        scheduler: scheduler.clone(),
        auth_kernel,
        token_validator: Arc::new(token_validator),
        provider_circuits,
    });

    spawn_dispatch_loop(state.clone());
    spawn_scheduler_loop(state.clone());
    spawn_retention_loop(state.clone());

    let rate_limiter = RateLimiter::new(120, StdDuration::from_secs(60));
    let cors = CorsConfig::default();
    let app = build_app(state, rate_limiter, &cors);

    let listener = tokio::net::TcpListener::bind(&args.bind).await.with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "kg-daemon listening");

    axum::serve(listener, app).await.context("serve")
}

/// A small generic set of relationship types ingestion can snap candidates
/// onto before falling back to substitution or skipping (spec §4.4). No
/// canonical list is prescribed anywhere upstream of this crate; this is a
/// deliberately minimal starting vocabulary an operator is expected to
/// extend via configuration as their ontology grows.
fn default_vocabulary() -> RelationshipVocabulary {
    let canonical = vec![
        CanonicalRelationshipType { relationship_type: "causes".to_string(), direction: None, embedding: vec![0.0; 8] },
        CanonicalRelationshipType { relationship_type: "part_of".to_string(), direction: None, embedding: vec![0.0; 8] },
        CanonicalRelationshipType { relationship_type: "depends_on".to_string(), direction: None, embedding: vec![0.0; 8] },
        CanonicalRelationshipType { relationship_type: "related_to".to_string(), direction: None, embedding: vec![0.0; 8] },
    ];
    RelationshipVocabulary::new(canonical)
}

/// Default RBAC seed rows (spec §4.8). Each permission is attached at the
/// narrowest role that should gain it; broader roles inherit it through
/// [`kg_auth::AuthorizationKernel::role_chain`], so `admin` and
/// `platform_admin` never need their own copies of `contributor`'s grants.
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

/// No per-instance grants are seeded at startup; operators add them at
/// runtime once they have concrete user/group ids to grant against.
fn default_resource_grants() -> Vec<ResourceGrant> {
    Vec::new()
}

fn spawn_dispatch_loop(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_millis(200));
        loop {
            interval.tick().await;
            for job in state.queue.dispatch_ready() {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(error) = run_dispatched_job(&state, &job.job_id).await {
                        warn!(job_id = %job.job_id, %error, "job dispatch failed");
                    }
                });
            }
        }
    });
}

async fn run_dispatched_job(state: &AppState, job_id: &str) -> Result<(), kg_error::KgError> {
    let job = state.queue.start(job_id)?;
    let outcome = match state.job_runners.get(&job.job_type) {
        Some(runner) => runner.run(state, &job).await,
        None => Err(kg_error::KgError::new(
            kg_error::ErrorCode::Internal,
            format!("no job runner registered for job_type {:?}", job.job_type),
        )),
    };
    match outcome {
        Ok(result) => {
            state.queue.complete(job_id, kg_queue::JobOutcome::Success(result.clone()))?;
            state.broker.publish_completed(job_id, result).await;
        }
        Err(error) => {
            state.queue.complete(job_id, kg_queue::JobOutcome::Failure(error.to_string()))?;
            state.broker.publish_failed(job_id, error.to_string()).await;
        }
    }
    state.broker.retire(job_id).await;
    Ok(())
}

fn spawn_scheduler_loop(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(StdDuration::from_secs(60));
        loop {
            interval.tick().await;
            let live_query_definition_ids = state.query_definitions.live_ids().await;
            let ctx = LauncherContext {
                telemetry: state.telemetry.clone(),
                graph: state.graph.clone(),
                artifacts: state.artifacts.clone(),
                live_query_definition_ids,
            };
            let outcomes = state.scheduler.tick(&ctx).await;
            for (name, outcome) in outcomes {
                info!(schedule = %name, ?outcome, "scheduler tick");
            }
        }
    });
}

fn spawn_retention_loop(state: Arc<AppState>) {
    tokio::spawn(async move {
        let interval_seconds = state.config.read().await.queue.cleanup_interval_seconds.max(1);
        let mut interval = tokio::time::interval(StdDuration::from_secs(u64::from(interval_seconds)));
        loop {
            interval.tick().await;
            let expired = state.queue.sweep_expired_approvals();
            let stale = state.queue.reap_stale_running(300);
            let retired = state.queue.sweep_retention();
            if !expired.is_empty() || !stale.is_empty() || !retired.is_empty() {
                info!(
                    expired = expired.len(),
                    stale = stale.len(),
                    retired = retired.len(),
                    "queue sweep"
                );
            }
        }
    });
}
