//! Validation helpers for job specs and artifact writes.

use std::fmt;

use crate::{Artifact, JobSpec};

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
    /// An artifact stored both or neither of `inline_result`/`garage_key`.
    InvalidStorageTier {
        /// Description of what was wrong.
        reason: String,
    },
    /// A field held a value outside its recognised range.
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the expected range.
        reason: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing required field: {field}"),
            Self::InvalidStorageTier { reason } => write!(f, "invalid storage tier: {reason}"),
            Self::OutOfRange { field, reason } => write!(f, "{field} out of range: {reason}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a [`JobSpec`] before it reaches the queue.
///
/// # Errors
/// Returns every problem found rather than short-circuiting on the first.
pub fn validate_job_spec(spec: &JobSpec) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if spec.ontology.trim().is_empty() {
        errors.push(ValidationError::MissingField { field: "ontology" });
    }
    if spec.user_id == 0 {
        errors.push(ValidationError::OutOfRange {
            field: "user_id",
            reason: "user ids start at 1".into(),
        });
    }
    if let Some(hash) = &spec.content_hash {
        if !hash.starts_with("sha256:") {
            errors.push(ValidationError::InvalidStorageTier {
                reason: format!("content_hash must be prefixed with \"sha256:\", got {hash}"),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate that an [`Artifact`] carries exactly one of `inline_result` or
/// `garage_key` (spec §3 invariant).
///
/// # Errors
/// Returns an error describing whether zero or both tiers were populated.
pub fn validate_artifact_storage(artifact: &Artifact) -> Result<(), ValidationError> {
    match (&artifact.inline_result, &artifact.garage_key) {
        (Some(_), Some(_)) => Err(ValidationError::InvalidStorageTier {
            reason: "both inline_result and garage_key are set".into(),
        }),
        (None, None) => Err(ValidationError::InvalidStorageTier {
            reason: "neither inline_result nor garage_key is set".into(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtifactType, JobSource, JobType, ProcessingMode};
    use kg_clock::UtcTime;
    use std::collections::BTreeMap;

    fn base_spec() -> JobSpec {
        JobSpec {
            job_type: JobType::Ingestion,
            job_data: serde_json::json!({}),
            content_hash: Some("sha256:abc".into()),
            ontology: "default".into(),
            user_id: 1000,
            is_system_job: false,
            source: JobSource::UserApi,
            source_metadata: BTreeMap::new(),
            processing_mode: ProcessingMode::Parallel,
            force: false,
        }
    }

    #[test]
    fn rejects_empty_ontology() {
        let mut spec = base_spec();
        spec.ontology = "   ".into();
        let errs = validate_job_spec(&spec).unwrap_err();
        assert!(errs.contains(&ValidationError::MissingField { field: "ontology" }));
    }

    #[test]
    fn rejects_unprefixed_content_hash() {
        let mut spec = base_spec();
        spec.content_hash = Some("abc123".into());
        let errs = validate_job_spec(&spec).unwrap_err();
        assert!(matches!(errs[0], ValidationError::InvalidStorageTier { .. }));
    }

    #[test]
    fn accepts_well_formed_spec() {
        assert!(validate_job_spec(&base_spec()).is_ok());
    }

    fn base_artifact() -> Artifact {
        Artifact {
            id: "artifact_1".into(),
            artifact_type: ArtifactType::Report,
            representation: "report".into(),
            name: "test".into(),
            owner_id: Some(1000),
            parameters: serde_json::json!({}),
            metadata: BTreeMap::new(),
            graph_epoch: 0,
            inline_result: None,
            garage_key: None,
            created_at: UtcTime::epoch(),
            expires_at: None,
            concept_ids: vec![],
            ontology: "default".into(),
            query_definition_id: None,
        }
    }

    #[test]
    fn rejects_neither_storage_tier() {
        assert!(validate_artifact_storage(&base_artifact()).is_err());
    }

    #[test]
    fn rejects_both_storage_tiers() {
        let mut artifact = base_artifact();
        artifact.inline_result = Some(serde_json::json!({}));
        artifact.garage_key = Some("artifacts/report/x.json".into());
        assert!(validate_artifact_storage(&artifact).is_err());
    }

    #[test]
    fn accepts_exactly_one_tier() {
        let mut artifact = base_artifact();
        artifact.inline_result = Some(serde_json::json!({}));
        assert!(validate_artifact_storage(&artifact).is_ok());
    }
}
