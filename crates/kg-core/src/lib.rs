#![deny(unsafe_code)]
#![warn(missing_docs)]
//! kg-core
//!
//! The stable contract for the knowledge graph control plane: job queue
//! records, artifact metadata, graph-entity DTOs, and identity/authorisation
//! rows. Every other crate in the workspace depends on this one for its
//! wire types; if you only take one dependency, take this one.

/// Extension traits for [`Job`] and [`Artifact`].
pub mod ext;
/// Validation helpers for job specs and artifact writes.
pub mod validate;

use std::collections::BTreeMap;

use kg_clock::UtcTime;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current contract version embedded in persisted job/artifact records and
/// backup dumps, so a restore can detect an incompatible schema.
///
/// ```
/// assert_eq!(kg_core::CONTRACT_VERSION, "kg/v1");
/// ```
pub const CONTRACT_VERSION: &str = "kg/v1";

/// Compute the dedup content hash of `bytes`: `"sha256:" + hex(SHA-256(bytes))`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{digest:x}")
}

// ── Jobs ────────────────────────────────────────────────────────────

/// Opaque job identifier, e.g. `job_3fa2…` (see [`kg_clock::new_id`]).
pub type JobId = String;

/// The kind of work a [`Job`] performs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Chunk → extract → embed → match → upsert document ingestion.
    Ingestion,
    /// Restore a backup dump into the graph.
    Restore,
    /// Produce a streamed backup dump.
    Backup,
    /// Recompute a cached projection artifact.
    ProjectionRefresh,
    /// Recompute embeddings for an existing concept set.
    EmbeddingRegeneration,
    /// Consolidate near-duplicate vocabulary/relationship types.
    VocabConsolidation,
    /// A job type not enumerated above, carried opaquely.
    Other(String),
}

/// State-machine status of a [`Job`]. See module docs on [`JobStateMachine`]
/// for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Just enqueued, approval routing not yet decided.
    Pending,
    /// Above the auto-approve threshold; waiting on an explicit approval.
    AwaitingApproval,
    /// Approved (automatically or explicitly); waiting for a worker slot.
    Approved,
    /// Holding a worker slot, not yet started.
    Queued,
    /// A worker is actively driving this job.
    Running,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: worker exhausted retries or hit a non-retryable error.
    Failed,
    /// Terminal: cancelled by the owner, an admin, or an approval timeout.
    Cancelled,
}

impl JobStatus {
    /// `true` for any of the three terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Marker describing a [`Job`]'s worker-slot contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Takes an exclusive worker slot sized to one.
    Serial,
    /// May share a worker slot with other parallel jobs.
    Parallel,
}

/// Who or what originated a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Submitted via the CLI front-end.
    UserCli,
    /// Submitted via the HTTP API directly.
    UserApi,
    /// Enqueued by the scheduled-jobs dispatcher.
    ScheduledTask,
    /// Enqueued by the system itself (e.g. cleanup sweep).
    System,
}

/// Free-form provenance captured alongside a job (filename, originating
/// host, interface tag). Kept as a structured bag rather than fixed fields
/// since the originating interfaces (CLI, web UI, MCP) each attach a
/// slightly different set.
pub type SourceMetadata = BTreeMap<String, serde_json::Value>;

/// A structured, opaque progress record. The [`kg_broker`](https://docs.rs/kg-broker)
/// crate guarantees monotonic replacement of this snapshot per job; this
/// crate only defines its shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressSnapshot {
    /// Pipeline stage name (e.g. `"chunking"`, `"extracting"`, `"upserting"`).
    pub stage: String,
    /// Overall completion percentage, `0..=100`.
    pub percent: u8,
    /// Items processed so far (chunk-granularity for ingestion).
    pub items_processed: u64,
    /// Total items expected, if known.
    pub items_total: Option<u64>,
    /// Human-readable status line.
    pub message: String,
    /// Chunks processed so far (ingestion-specific; `0` for other job types).
    pub chunks_processed: u64,
    /// Total chunks, if known.
    pub chunks_total: Option<u64>,
    /// Concepts created so far (ingestion-specific).
    pub concepts_created: u64,
    /// Extra stage-specific fields not promoted to a named field above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ProgressSnapshot {
    /// Returns `true` if `self` is a valid successor to `prior` under the
    /// monotonic-ordering rule (§4.6): percent must not decrease while the
    /// stage is unchanged, and percent resets are only valid on a stage
    /// change.
    #[must_use]
    pub fn is_monotonic_successor_of(&self, prior: &Self) -> bool {
        if self.stage == prior.stage {
            self.percent >= prior.percent
        } else {
            true
        }
    }
}

/// Pre-execution cost/size estimate attached to a job before approval
/// routing decides `awaiting_approval` vs. auto-approved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobAnalysis {
    /// Estimated chunk count for ingestion jobs.
    pub estimated_chunks: Option<u64>,
    /// Estimated provider cost in integer cents.
    pub estimated_cost_cents: Option<u64>,
    /// Free-form notes surfaced to the approver.
    pub notes: Vec<String>,
}

/// Terminal success payload. Shape is job-type-specific; carried opaquely.
pub type JobResult = serde_json::Value;

/// Job-type-specific parameters supplied at enqueue time.
pub type JobData = serde_json::Value;

/// A unit of asynchronous work tracked by the job queue (spec §3 "Job").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Opaque identifier, e.g. `job_3fa2…`.
    pub job_id: JobId,
    /// What kind of work this job performs.
    pub job_type: JobType,
    /// Current state-machine status.
    pub status: JobStatus,
    /// Dedup key: `"sha256:" + hex` of the source content, when applicable.
    pub content_hash: Option<String>,
    /// Ontology scope tag.
    pub ontology: String,
    /// Identity of the creator. System jobs use [`kg_clock::SYSTEM_USER_ID`].
    pub user_id: i64,
    /// `true` for jobs created by the system rather than a human/API caller.
    pub is_system_job: bool,
    /// Where this job was submitted from.
    pub source: JobSource,
    /// Free-form provenance (filename, host, interface tag).
    pub source_metadata: SourceMetadata,
    /// Worker-slot contention mode.
    pub processing_mode: ProcessingMode,
    /// Enqueue time.
    pub created_at: UtcTime,
    /// When a worker began driving this job.
    pub started_at: Option<UtcTime>,
    /// When the job reached a terminal state.
    pub completed_at: Option<UtcTime>,
    /// When an approval was granted.
    pub approved_at: Option<UtcTime>,
    /// Who granted the approval.
    pub approved_by: Option<i64>,
    /// Deadline after which an `awaiting_approval` job auto-cancels.
    pub expires_at: Option<UtcTime>,
    /// Pre-execution cost/size estimate.
    pub analysis: Option<JobAnalysis>,
    /// Latest progress snapshot, if any work has been reported.
    pub progress: Option<ProgressSnapshot>,
    /// Terminal success payload.
    pub result: Option<JobResult>,
    /// Terminal failure message, set only when `status == Failed`.
    pub error: Option<String>,
    /// Job-type-specific parameters.
    pub job_data: JobData,
    /// Artifact produced by this job, once registered.
    pub artifact_id: Option<String>,
}

/// Caller-supplied specification for [`Job`] enqueue (spec §4.1 `Enqueue`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// What kind of work to perform.
    pub job_type: JobType,
    /// Job-type-specific parameters.
    pub job_data: JobData,
    /// Dedup key, when this job type is content-addressed.
    pub content_hash: Option<String>,
    /// Ontology scope tag.
    pub ontology: String,
    /// Identity of the creator.
    pub user_id: i64,
    /// `true` for system-originated jobs (bypasses approval).
    pub is_system_job: bool,
    /// Where this job was submitted from.
    pub source: JobSource,
    /// Free-form provenance.
    pub source_metadata: SourceMetadata,
    /// Worker-slot contention mode.
    pub processing_mode: ProcessingMode,
    /// Skip the completed-job dedup short-circuit and re-ingest anyway.
    pub force: bool,
}

/// A named, cron-scheduled row driving the scheduled-jobs dispatcher
/// (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScheduledJob {
    /// Unique schedule name, e.g. `"projection-refresh"`.
    pub name: String,
    /// Name of the launcher invoked on tick (resolved by the scheduler crate).
    pub launcher_class: String,
    /// Standard 5-field cron expression.
    pub schedule_cron: String,
    /// Schedules can be disabled without deleting the row.
    pub enabled: bool,
    /// Consecutive-failure budget before auto-disabling.
    pub max_retries: u32,
    /// Consecutive failures observed since the last success.
    pub retry_count: u32,
    /// Last tick this schedule actually invoked its launcher.
    pub last_run: Option<UtcTime>,
    /// Last tick the launcher completed without error.
    pub last_success: Option<UtcTime>,
    /// Last tick the launcher raised an error.
    pub last_failure: Option<UtcTime>,
    /// Next time this schedule is due to fire.
    pub next_run: UtcTime,
}

// ── Artifacts ───────────────────────────────────────────────────────

/// The kind of computed result an [`Artifact`] holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// A cached graph projection (subgraph extract for a view).
    Projection,
    /// A polarity/sentiment analysis result.
    PolarityAnalysis,
    /// The result of executing a [`QueryDefinition`].
    QueryResult,
    /// A generated human-readable report.
    Report,
    /// A point-in-time statistics snapshot.
    StatsSnapshot,
    /// A per-document ingestion summary.
    IngestionReport,
    /// An artifact type not enumerated above.
    Other(String),
}

/// Names the originating tool/view that produced an [`Artifact`].
pub type ArtifactRepresentation = String;

/// A computed, persistable result (spec §3 "Artifact").
///
/// Exactly one of `inline_result` or `garage_key` is populated — see
/// [`validate::validate_artifact_storage`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Opaque identifier.
    pub id: String,
    /// Kind of result.
    pub artifact_type: ArtifactType,
    /// Originating tool/view.
    pub representation: ArtifactRepresentation,
    /// Human-readable name.
    pub name: String,
    /// Owning user, or `None` for a system-owned artifact.
    pub owner_id: Option<i64>,
    /// Inputs used to produce this artifact.
    pub parameters: serde_json::Value,
    /// Arbitrary additional metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// `graph_change_counter` value at creation time.
    pub graph_epoch: u64,
    /// Payload, inline, when small enough (below `inline_threshold_bytes`).
    pub inline_result: Option<serde_json::Value>,
    /// Blob store key, when the payload was too large to inline.
    pub garage_key: Option<String>,
    /// Creation time.
    pub created_at: UtcTime,
    /// Expiry, consulted by the daily cleanup job.
    pub expires_at: Option<UtcTime>,
    /// Concepts this artifact references, for cross-linking.
    pub concept_ids: Vec<String>,
    /// Ontology scope.
    pub ontology: String,
    /// The reusable recipe that produced this artifact, if any.
    pub query_definition_id: Option<String>,
}

impl Artifact {
    /// `true` iff `self.graph_epoch` equals `current_epoch` (spec §3
    /// freshness invariant).
    #[must_use]
    pub fn is_fresh(&self, current_epoch: u64) -> bool {
        self.graph_epoch == current_epoch
    }
}

/// The kind of recipe a [`QueryDefinition`] encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionType {
    /// A block-diagram visual query.
    BlockDiagram,
    /// A raw Cypher-dialect query against the graph facade.
    Cypher,
    /// A text/semantic search.
    Search,
    /// A polarity/sentiment analysis recipe.
    Polarity,
    /// A shortest-path / connection-finding recipe.
    Connection,
    /// An open-ended exploration recipe.
    Exploration,
    /// A scripted multi-step program.
    Program,
}

/// A reusable query recipe (spec §3 "Query Definition"). Executing one
/// produces an [`Artifact`] with `query_definition_id` set back to this row.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryDefinition {
    /// Opaque identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Owning user.
    pub owner_id: i64,
    /// Recipe kind.
    pub definition_type: DefinitionType,
    /// The recipe body, shaped per `definition_type`.
    pub definition: serde_json::Value,
    /// Arbitrary additional metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: UtcTime,
    /// Last-edited time.
    pub updated_at: UtcTime,
}

// ── Graph entities ──────────────────────────────────────────────────

/// A graph concept node (spec §3 "Concept"), unique by `concept_id`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Concept {
    /// Unique identifier, deterministic from label+ontology+hash when newly
    /// minted, or the id of the matched node when reused.
    pub concept_id: String,
    /// Canonical label.
    pub label: String,
    /// Extracted description.
    pub description: String,
    /// Dense embedding vector for similarity matching.
    pub embedding: Vec<f32>,
    /// Ontology scope.
    pub ontology: String,
    /// Creation time.
    pub created_at: UtcTime,
}

/// Per-chunk or per-image record of ingested content (spec §3 "Source").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceRecord {
    /// Unique identifier.
    pub source_id: String,
    /// Originating document id (`DocumentMeta.document_id`).
    pub document: String,
    /// Paragraph index within the document, when text-derived.
    pub paragraph: Option<u32>,
    /// Full chunk text.
    pub full_text: String,
    /// SHA-256 of `full_text`.
    pub content_hash: String,
    /// MIME-ish content type tag.
    pub content_type: String,
    /// Blob store key for the original payload, if retained.
    pub storage_key: Option<String>,
    /// Text embedding.
    pub embedding: Vec<f32>,
    /// Visual embedding, for image-derived sources.
    pub visual_embedding: Option<Vec<f32>>,
}

/// Evidence quote linking a [`Concept`] to a [`SourceRecord`] (spec §3
/// "Instance").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Instance {
    /// Unique identifier.
    pub instance_id: String,
    /// The concept this instance evidences.
    pub concept_id: String,
    /// The source chunk the evidence was drawn from.
    pub source_id: String,
    /// The verbatim evidence quote.
    pub evidence_quote: String,
}

/// Per-document provenance node (spec §3 "DocumentMeta").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DocumentMeta {
    /// Document id, equal to the document's content hash.
    pub document_id: String,
    /// Ontology scope.
    pub ontology: String,
    /// Number of `Source` chunks derived from this document.
    pub source_count: u64,
    /// Original filename, if known.
    pub filename: Option<String>,
    /// Source type tag (e.g. `"pdf"`, `"text"`, `"image"`).
    pub source_type: String,
    /// Original file path, if known.
    pub file_path: Option<String>,
    /// Originating hostname, if known.
    pub hostname: Option<String>,
    /// When this document was ingested.
    pub ingested_at: UtcTime,
    /// Identity of the ingesting user.
    pub ingested_by: i64,
    /// The ingestion job that produced this record.
    pub job_id: JobId,
}

/// Lifecycle state of an [`Ontology`] scope node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OntologyLifecycleState {
    /// Accepting new ingestion.
    Active,
    /// Frozen; read-only.
    Archived,
}

/// First-class scope node every [`SourceRecord`] is `SCOPED_BY` (spec §3
/// "Ontology").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Ontology {
    /// Unique identifier.
    pub ontology_id: String,
    /// Human-readable name.
    pub name: String,
    /// Lifecycle state.
    pub lifecycle_state: OntologyLifecycleState,
    /// `graph_change_counter` value at creation time.
    pub creation_epoch: u64,
}

/// Direction semantics of a relationship type (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipDirection {
    /// `from` → `to`.
    Outward,
    /// `to` → `from`.
    Inward,
    /// No preferred direction.
    Bidirectional,
}

/// Where a relationship edge's assertion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceSource {
    /// Asserted by the LLM extractor during ingestion.
    LlmExtraction,
    /// Asserted by a human curator.
    HumanCuration,
}

/// Provenance metadata carried by every relationship edge (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Provenance {
    /// When the edge was created or last reasserted.
    pub created_at: UtcTime,
    /// Identity of the asserting principal.
    pub created_by: i64,
    /// How the edge was asserted.
    pub source: ProvenanceSource,
    /// The ingestion job that asserted the edge, if any.
    pub job_id: Option<JobId>,
    /// The document the assertion was drawn from, if any.
    pub document_id: Option<String>,
    /// Extractor confidence, `0.0..=1.0`, if known.
    pub confidence: Option<f32>,
}

/// A relationship edge between two concepts (spec §3, §4.4).
///
/// Upsert identity is the triple `(from_concept_id, to_concept_id,
/// relationship_type)` plus normalised `direction`; re-issuing the same
/// triple updates `provenance` rather than duplicating the edge.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RelationshipEdge {
    /// Source concept.
    pub from_concept_id: String,
    /// Target concept.
    pub to_concept_id: String,
    /// Canonical type, drawn from the controlled vocabulary.
    pub relationship_type: String,
    /// Direction semantics for this type.
    pub direction: RelationshipDirection,
    /// Provenance of the most recent assertion.
    pub provenance: Provenance,
}

// ── Identity & authorisation ────────────────────────────────────────

/// A local account (spec §3 "Identity & authorisation").
///
/// Id `1` is reserved for the non-login `system` principal; id `1000` is
/// the initial administrator seeded at migration time. Ids `1..=999` are
/// reserved for system principals (see [`kg_clock::is_reserved_user_id`]).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct User {
    /// Unique identifier.
    pub id: i64,
    /// Login name.
    pub username: String,
    /// Password hash (opaque to this crate; hashing lives behind the auth
    /// hook per spec §1 non-goals).
    pub password_hash: String,
    /// The role this user is assigned by default.
    pub primary_role: String,
    /// Disabled accounts fail authentication immediately.
    pub disabled: bool,
}

/// A principal group. Id `1` is the implicit `public` group every
/// authenticated user belongs to; id `2` is the built-in `admins` group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Group {
    /// Unique identifier.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// `true` for built-in groups, which cannot be deleted.
    pub is_system: bool,
}

/// A named role in the inheritance DAG.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Role {
    /// Unique role name, e.g. `"curator"`.
    pub role_name: String,
    /// Parent role this one inherits permissions from, if any.
    pub parent_role: Option<String>,
    /// `true` for the built-in roles seeded at migration time.
    pub is_builtin: bool,
}

/// Declares the actions and scoping support for a resource type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Resource {
    /// The resource type name, e.g. `"job"`, `"artifact"`.
    pub resource_type: String,
    /// Actions recognised for this resource type, e.g. `"read"`, `"delete"`.
    pub available_actions: Vec<String>,
    /// Whether per-instance [`ResourceGrant`]s are meaningful for this type.
    pub supports_scoping: bool,
}

/// How broadly a [`RolePermission`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// Applies to every instance of the resource type.
    Global,
    /// Applies only to instances matching a structured predicate.
    Filter,
    /// Applies only to one named instance.
    Instance,
}

/// A single role → (resource_type, action) permission row.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RolePermission {
    /// The role this permission is attached to.
    pub role: String,
    /// Resource type this permission governs.
    pub resource_type: String,
    /// Action this permission governs.
    pub action: String,
    /// How broadly this permission applies.
    pub scope_type: ScopeType,
    /// The single instance id, when `scope_type == Instance`.
    pub scope_id: Option<String>,
    /// The structured predicate, when `scope_type == Filter`. Recognised
    /// keys: `owner=self`, `is_system=true`; multiple keys combine with AND.
    /// Evaluated by [`kg_rule_engine`](https://docs.rs/kg-rule-engine).
    pub scope_filter: Option<BTreeMap<String, serde_json::Value>>,
    /// `false` is an explicit deny, overriding any grant below it in the
    /// inheritance chain.
    pub granted: bool,
}

/// A per-instance access grant to a specific principal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceGrant {
    /// Resource type being granted.
    pub resource_type: String,
    /// The specific instance id.
    pub resource_id: String,
    /// Whether the principal is a user or a group.
    pub principal_type: PrincipalType,
    /// The user or group id.
    pub principal_id: i64,
    /// The action this grant permits.
    pub permission: String,
}

/// Distinguishes the two kinds of principal a [`ResourceGrant`] may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    /// A single user.
    User,
    /// A group of users.
    Group,
}
