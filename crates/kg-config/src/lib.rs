//! Configuration loading, validation, and runtime patching for the
//! knowledge graph control plane.
//!
//! This crate provides [`ControlPlaneConfig`] — the top-level runtime
//! settings described in spec §3 — together with helpers for loading from
//! TOML, applying environment overrides, producing advisory
//! [`ConfigWarning`]s, and applying a runtime-mutable patch without a
//! restart (the "startup load → runtime-mutable subset" split).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A numeric setting is valid but unusually aggressive or lax.
    SuspiciousValue {
        /// Dotted field path, e.g. `"queue.max_concurrent_workers"`.
        field: String,
        /// Why it's worth a second look.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::SuspiciousValue { field, hint } => {
                write!(f, "'{field}': {hint}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Job queue retention and concurrency settings (spec §3 "Queue").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Hours a completed job's row is retained before archival.
    pub completed_retention_hours: u32,
    /// Hours a failed job's row is retained before archival.
    pub failed_retention_hours: u32,
    /// Hours an `awaiting_approval` job may wait before auto-cancellation.
    pub approval_timeout_hours: u32,
    /// Interval, in seconds, between retention/expiry sweeps.
    pub cleanup_interval_seconds: u32,
    /// Maximum number of jobs the dispatcher will run concurrently.
    pub max_concurrent_workers: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            completed_retention_hours: 48,
            failed_retention_hours: 168,
            approval_timeout_hours: 24,
            cleanup_interval_seconds: 3_600,
            max_concurrent_workers: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

/// Content-hash dedup strategy (spec §3 "Dedup").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    /// Hashing algorithm used to derive `content_hash`.
    pub algorithm: HashAlgorithm,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
        }
    }
}

/// Supported content-hash algorithms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256, prefixed `"sha256:"` on the wire.
    Sha256,
}

impl HashAlgorithm {
    /// The wire prefix prepended to the hex digest, e.g. `"sha256:"`.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256:",
        }
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Auto-approval thresholds (spec §3 "Approval", §4.1 "Approval policy").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Jobs estimated below this cost (in cents) are approved automatically.
    pub auto_approve_under_cost_cents: u32,
    /// Jobs estimated below this chunk count are approved automatically.
    pub auto_approve_under_chunks: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve_under_cost_cents: 50,
            auto_approve_under_chunks: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// Active embedding profile (spec §3 "Embedding", §6.5).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Identifier of the active embedding profile.
    pub active_profile_id: String,
    /// Output vector dimensionality for the active profile.
    pub dimensions: u32,
    /// Whether vectors are L2-normalised after embedding.
    pub normalize: bool,
    /// Prefix applied to text before embedding it as a query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_prefix: Option<String>,
    /// Prefix applied to text before embedding it as a document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_prefix: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            active_profile_id: "default".to_string(),
            dimensions: 768,
            normalize: true,
            query_prefix: None,
            document_prefix: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Chunking and matching thresholds (spec §3 "Ingestion", §4.3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct IngestionConfig {
    /// Target chunk size, in characters.
    pub chunk_size_chars: u32,
    /// Overlap between consecutive chunks, in characters.
    pub chunk_overlap_chars: u32,
    /// Minimum cosine similarity for a candidate concept to match an existing one.
    pub min_concept_similarity: f64,
    /// Minimum cosine similarity for a search result to be considered relevant.
    pub min_search_similarity: f64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size_chars: 2_000,
            chunk_overlap_chars: 200,
            min_concept_similarity: 0.85,
            min_search_similarity: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// SSE streaming cadence (spec §3 "Streaming", §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Interval, in milliseconds, between broker polls for a changed snapshot.
    pub sse_poll_interval_ms: u32,
    /// Interval, in seconds, between `keepalive` events while idle.
    pub sse_keepalive_seconds: u32,
    /// Server-side idle timeout, in seconds, after which a stream closes.
    pub sse_idle_timeout_seconds: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sse_poll_interval_ms: 500,
            sse_keepalive_seconds: 30,
            sse_idle_timeout_seconds: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Artifact storage thresholds (spec §3 "Artifacts", §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Payloads at or below this size are stored inline rather than in the blob store.
    pub inline_threshold_bytes: u64,
    /// Size budget, in MiB, for the daemon's local artifact payload cache.
    pub localstorage_cache_mb: u32,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: 10_240,
            localstorage_cache_mb: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the knowledge graph control plane.
///
/// Loaded once at startup (`load`); a subset of fields (see
/// [`RuntimeConfigPatch`]) may be hot-reloaded afterwards via
/// [`ControlPlaneConfig::apply_patch`] without a process restart.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Job queue settings.
    pub queue: QueueConfig,
    /// Dedup settings.
    pub dedup: DedupConfig,
    /// Approval thresholds.
    pub approval: ApprovalConfig,
    /// Embedding profile.
    pub embedding: EmbeddingConfig,
    /// Chunking/matching thresholds.
    pub ingestion: IngestionConfig,
    /// SSE cadence.
    pub streaming: StreamingConfig,
    /// Artifact store thresholds.
    pub artifacts: ArtifactsConfig,
    /// Whether authentication is enforced. Disabling this maps every
    /// request to the `public` group; flipped at request time, not at
    /// construction time, so it can be hot-reloaded.
    pub auth_enabled: bool,
}

// A hand-written impl, not a derive: `#[serde(default)]` on the container
// fills any field missing from a parsed TOML file via `Self::default()`, so
// a derived `Default` (which would give `auth_enabled: false`) would leave
// auth silently disabled for a config file that simply never mentions it.
impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ControlPlaneConfig {
    /// Construct a configuration with every field at its documented default.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            queue: QueueConfig::default(),
            dedup: DedupConfig::default(),
            approval: ApprovalConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingestion: IngestionConfig::default(),
            streaming: StreamingConfig::default(),
            artifacts: ArtifactsConfig::default(),
            auth_enabled: true,
        }
    }

    /// Load from an optional TOML file, falling back to defaults when
    /// `path` is `None`, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                    path: p.display().to_string(),
                })?;
                Self::parse_toml(&content)?
            }
            None => Self::with_defaults(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML string into a [`ControlPlaneConfig`].
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Apply `KGCP_*` environment variable overrides in place.
    ///
    /// Recognised variables: `KGCP_MAX_CONCURRENT_WORKERS`,
    /// `KGCP_AUTH_ENABLED`, `KGCP_SSE_KEEPALIVE_SECONDS`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("KGCP_MAX_CONCURRENT_WORKERS")
            && let Ok(n) = val.parse()
        {
            self.queue.max_concurrent_workers = n;
        }
        if let Ok(val) = std::env::var("KGCP_AUTH_ENABLED")
            && let Ok(b) = val.parse()
        {
            self.auth_enabled = b;
        }
        if let Ok(val) = std::env::var("KGCP_SSE_KEEPALIVE_SECONDS")
            && let Ok(n) = val.parse()
        {
            self.streaming.sse_keepalive_seconds = n;
        }
    }

    /// Validate semantic constraints, returning advisory warnings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when a hard constraint is
    /// violated (out-of-range similarity thresholds, zero worker slots,
    /// overlap ≥ chunk size).
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if !(0.0..=1.0).contains(&self.ingestion.min_concept_similarity) {
            errors.push(format!(
                "ingestion.min_concept_similarity {} out of range [0,1]",
                self.ingestion.min_concept_similarity
            ));
        }
        if !(0.0..=1.0).contains(&self.ingestion.min_search_similarity) {
            errors.push(format!(
                "ingestion.min_search_similarity {} out of range [0,1]",
                self.ingestion.min_search_similarity
            ));
        }
        if self.ingestion.chunk_overlap_chars >= self.ingestion.chunk_size_chars {
            errors.push("ingestion.chunk_overlap_chars must be < chunk_size_chars".to_string());
        }
        if self.queue.max_concurrent_workers == 0 {
            errors.push("queue.max_concurrent_workers must be >= 1".to_string());
        }
        if self.embedding.dimensions == 0 {
            errors.push("embedding.dimensions must be >= 1".to_string());
        }

        if self.queue.max_concurrent_workers > 256 {
            warnings.push(ConfigWarning::SuspiciousValue {
                field: "queue.max_concurrent_workers".to_string(),
                hint: "unusually high worker count may overwhelm the graph facade".to_string(),
            });
        }
        if self.streaming.sse_idle_timeout_seconds < self.streaming.sse_keepalive_seconds {
            warnings.push(ConfigWarning::SuspiciousValue {
                field: "streaming.sse_idle_timeout_seconds".to_string(),
                hint: "idle timeout shorter than the keepalive interval; streams will never see a keepalive before closing".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons: errors })
        }
    }

    /// Apply a runtime-mutable patch (the subset of fields this system
    /// allows hot-reloading without a restart).
    pub fn apply_patch(&mut self, patch: RuntimeConfigPatch) {
        if let Some(v) = patch.max_concurrent_workers {
            self.queue.max_concurrent_workers = v;
        }
        if let Some(v) = patch.auto_approve_under_cost_cents {
            self.approval.auto_approve_under_cost_cents = v;
        }
        if let Some(v) = patch.auto_approve_under_chunks {
            self.approval.auto_approve_under_chunks = v;
        }
        if let Some(v) = patch.auth_enabled {
            self.auth_enabled = v;
        }
        if let Some(v) = patch.sse_keepalive_seconds {
            self.streaming.sse_keepalive_seconds = v;
        }
    }
}

/// The runtime-mutable subset of [`ControlPlaneConfig`]. Fields outside this
/// set (chunking, dedup, embedding profile) require a restart to change,
/// matching spec §3's "startup load → runtime-mutable subset" split.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfigPatch {
    /// Override for [`QueueConfig::max_concurrent_workers`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_workers: Option<u32>,
    /// Override for [`ApprovalConfig::auto_approve_under_cost_cents`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_under_cost_cents: Option<u32>,
    /// Override for [`ApprovalConfig::auto_approve_under_chunks`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_under_chunks: Option<u32>,
    /// Override for [`ControlPlaneConfig::auth_enabled`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_enabled: Option<bool>,
    /// Override for [`StreamingConfig::sse_keepalive_seconds`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_keepalive_seconds: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = ControlPlaneConfig::with_defaults();
        assert_eq!(config.queue.completed_retention_hours, 48);
        assert_eq!(config.queue.failed_retention_hours, 168);
        assert_eq!(config.artifacts.inline_threshold_bytes, 10_240);
        assert_eq!(config.ingestion.min_concept_similarity, 0.85);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn overlap_ge_chunk_size_is_rejected() {
        let mut config = ControlPlaneConfig::with_defaults();
        config.ingestion.chunk_overlap_chars = config.ingestion.chunk_size_chars;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = ControlPlaneConfig::with_defaults();
        config.queue.max_concurrent_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn large_worker_count_is_a_warning_not_an_error() {
        let mut config = ControlPlaneConfig::with_defaults();
        config.queue.max_concurrent_workers = 500;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn patch_only_touches_runtime_mutable_fields() {
        let mut config = ControlPlaneConfig::with_defaults();
        let original_chunk_size = config.ingestion.chunk_size_chars;
        config.apply_patch(RuntimeConfigPatch {
            max_concurrent_workers: Some(10),
            auth_enabled: Some(false),
            ..Default::default()
        });
        assert_eq!(config.queue.max_concurrent_workers, 10);
        assert!(!config.auth_enabled);
        assert_eq!(config.ingestion.chunk_size_chars, original_chunk_size);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ControlPlaneConfig::with_defaults();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = ControlPlaneConfig::parse_toml(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn omitting_auth_enabled_from_a_config_file_still_defaults_to_enforced() {
        let config = ControlPlaneConfig::parse_toml("").unwrap();
        assert!(config.auth_enabled, "auth must default to enforced when unspecified");
    }
}
