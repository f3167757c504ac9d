//! Shared application state (spec §6): every service the HTTP surface
//! delegates to, composed once in `main.rs` and handed to every handler
//! behind an [`std::sync::Arc`].

use std::sync::Arc;

use kg_artifacts::ArtifactStore;
use kg_auth::{AuthorizationKernel, TokenValidator};
use kg_blob::BlobStore;
use kg_broker::Broker;
use kg_clock::Clock;
use kg_config::ControlPlaneConfig;
use kg_graph::GraphFacade;
use kg_ingest::IngestionPipeline;
use kg_llm::EmbeddingService;
use kg_queue::JobQueue;
use kg_retry::CircuitBreaker;
use kg_scheduler::Scheduler;
use kg_telemetry::GraphMetrics;
use tokio::sync::RwLock;

use crate::job_runner::JobRunnerRegistry;
use crate::query_definitions::QueryDefinitionStore;

/// Per-provider circuit breakers, surfaced read-only at `GET
/// /admin/providers` (spec §6.9).
pub struct ProviderCircuits {
    /// Circuit guarding calls to the concept/relationship extraction LLM.
    pub extractor: Arc<CircuitBreaker>,
    /// Circuit guarding calls to the embedding provider.
    pub embedder: Arc<CircuitBreaker>,
}

/// Every collaborating service behind the HTTP surface.
pub struct AppState {
    /// Wall clock, swappable for a [`kg_clock::FixedClock`] in tests.
    pub clock: Arc<dyn Clock>,
    /// Hot-reloadable runtime configuration (spec §4.9).
    pub config: RwLock<ControlPlaneConfig>,
    /// The property-graph facade.
    pub graph: Arc<dyn GraphFacade>,
    /// Blob storage backing artifact payloads and checkpoint snapshots.
    pub blob: Arc<dyn BlobStore>,
    /// The job queue.
    pub queue: Arc<JobQueue>,
    /// The ingestion pipeline a worker loop drives jobs through.
    pub pipeline: Arc<IngestionPipeline>,
    /// `JobType -> JobRunner` registry the dispatch loop looks up every
    /// popped job against (spec §4.1's "worker dispatch").
    pub job_runners: Arc<JobRunnerRegistry>,
    /// Embedding provider, used directly by search-type query execution
    /// (the ingestion pipeline holds its own handle to the same service).
    pub embedder: Arc<dyn EmbeddingService>,
    /// Progress/completion event broker for SSE streaming.
    pub broker: Arc<Broker>,
    /// Content-addressed artifact store.
    pub artifacts: Arc<ArtifactStore>,
    /// Reusable query recipes.
    pub query_definitions: Arc<QueryDefinitionStore>,
    /// Graph-change epoch counters.
    pub telemetry: Arc<GraphMetrics>,
    /// Scheduled-job dispatcher.
    pub scheduler: Arc<Scheduler>,
    /// Authorization kernel (spec §4.8).
    pub auth_kernel: Arc<AuthorizationKernel>,
    /// Bearer-token validator.
    pub token_validator: Arc<dyn TokenValidator>,
    /// Provider circuit-breaker state.
    pub provider_circuits: ProviderCircuits,
}
