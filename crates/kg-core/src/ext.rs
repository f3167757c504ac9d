//! Convenience extension traits for [`crate::Job`] and [`crate::Artifact`].

use crate::{Artifact, Job, JobStatus};

/// Convenience helpers for inspecting a [`Job`].
pub trait JobExt {
    /// `true` when this job's `(content_hash, ontology)` pair participates
    /// in dedup (spec §4.1).
    fn is_dedup_eligible(&self) -> bool;

    /// `true` when this job bypasses the approval queue (system or
    /// scheduled-task jobs per spec §4.1).
    fn bypasses_approval(&self) -> bool;

    /// Returns the job's age relative to `now`, in whole seconds.
    fn age_seconds(&self, now: kg_clock::UtcTime) -> i64;

    /// `true` if an `awaiting_approval` job's deadline has passed.
    fn is_approval_expired(&self, now: kg_clock::UtcTime) -> bool;
}

impl JobExt for Job {
    fn is_dedup_eligible(&self) -> bool {
        self.content_hash.is_some()
    }

    fn bypasses_approval(&self) -> bool {
        self.is_system_job || matches!(self.source, crate::JobSource::ScheduledTask)
    }

    fn age_seconds(&self, now: kg_clock::UtcTime) -> i64 {
        now.seconds_since(self.created_at)
    }

    fn is_approval_expired(&self, now: kg_clock::UtcTime) -> bool {
        self.status == JobStatus::AwaitingApproval
            && self.expires_at.is_some_and(|exp| now.seconds_since(exp) >= 0)
    }
}

/// Convenience helpers for inspecting an [`Artifact`].
pub trait ArtifactExt {
    /// Returns the inline payload size in bytes, or `0` when the artifact
    /// is blob-backed.
    fn inline_size_bytes(&self) -> usize;

    /// `true` if this artifact's payload lives in the blob store rather
    /// than inline.
    fn is_blob_backed(&self) -> bool;
}

impl ArtifactExt for Artifact {
    fn inline_size_bytes(&self) -> usize {
        self.inline_result
            .as_ref()
            .map(|v| serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn is_blob_backed(&self) -> bool {
        self.garage_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobAnalysis, JobSource, JobStatus, JobType, ProcessingMode};
    use kg_clock::UtcTime;
    use std::collections::BTreeMap;

    fn base_job() -> Job {
        Job {
            job_id: "job_1".into(),
            job_type: JobType::Ingestion,
            status: JobStatus::AwaitingApproval,
            content_hash: Some("sha256:abc".into()),
            ontology: "default".into(),
            user_id: 42,
            is_system_job: false,
            source: JobSource::UserApi,
            source_metadata: BTreeMap::new(),
            processing_mode: ProcessingMode::Parallel,
            created_at: UtcTime::epoch(),
            started_at: None,
            completed_at: None,
            approved_at: None,
            approved_by: None,
            expires_at: Some(UtcTime::epoch().plus(chrono::Duration::hours(24))),
            analysis: Some(JobAnalysis::default()),
            progress: None,
            result: None,
            error: None,
            job_data: serde_json::json!({}),
            artifact_id: None,
        }
    }

    #[test]
    fn approval_expiry_respects_deadline() {
        let job = base_job();
        let before = UtcTime::epoch().plus(chrono::Duration::hours(1));
        let after = UtcTime::epoch().plus(chrono::Duration::hours(25));
        assert!(!job.is_approval_expired(before));
        assert!(job.is_approval_expired(after));
    }

    #[test]
    fn system_and_scheduled_jobs_bypass_approval() {
        let mut job = base_job();
        assert!(!job.bypasses_approval());
        job.is_system_job = true;
        assert!(job.bypasses_approval());
        job.is_system_job = false;
        job.source = JobSource::ScheduledTask;
        assert!(job.bypasses_approval());
    }
}
