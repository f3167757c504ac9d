//! Job queue: state machine, dedup, FIFO dispatch, and restart safety
//! (spec §4.1).
//!
//! Every transition is persisted (here, written to the in-memory map) before
//! a worker ever observes it, and every transition appends a [`JobEvent`] to
//! an append-only log that survives the job row's eventual archival — the
//! event log is what answers "why is this job stuck" once the row itself
//! has aged out of the retention window.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use kg_clock::{Clock, UtcTime};
use kg_config::{ApprovalConfig, QueueConfig};
use kg_core::validate::validate_job_spec;
use kg_core::{
    Job, JobAnalysis, JobId, JobResult, JobSource, JobSpec, JobStatus, ProcessingMode, ProgressSnapshot,
};
use kg_error::{ErrorCode, KgError};

/// One entry in a job's append-only transition history.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobEvent {
    /// Which job this event describes.
    pub job_id: JobId,
    /// The status the job moved into.
    pub status: JobStatus,
    /// Who drove this transition (`None` for system-driven sweeps).
    pub actor: Option<i64>,
    /// Human-readable reason, e.g. `"approval timeout"`.
    pub reason: Option<String>,
    /// When this transition happened.
    pub at: UtcTime,
}

/// The outcome of a successful [`JobQueue::enqueue`] call.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new job was created.
    Created(Job),
    /// A completed job already exists for this `(content_hash, ontology)`
    /// and `force` was not set; its prior result is returned instead of
    /// doing the work again.
    AlreadyCompleted(Job),
}

/// Filter and cursor for [`JobQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to jobs in this status.
    pub status: Option<JobStatus>,
    /// Restrict to jobs owned by this user id.
    pub owner: Option<i64>,
    /// Restrict to (or exclude) system jobs.
    pub is_system_job: Option<bool>,
    /// Resume after this job id (exclusive), for cursor pagination.
    pub after_id: Option<JobId>,
    /// Maximum rows to return.
    pub limit: usize,
}

/// A page of [`JobQueue::list`] results.
#[derive(Debug, Clone, Default)]
pub struct JobPage {
    /// The matching jobs, ordered by `job_id`.
    pub jobs: Vec<Job>,
    /// Cursor to pass as `after_id` for the next page, `None` at the end.
    pub next_after_id: Option<JobId>,
}

/// Outcome a worker reports to [`JobQueue::complete`].
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The job finished successfully with this result payload.
    Success(JobResult),
    /// The job failed with this serialised error message.
    Failure(String),
}

fn invalid_transition(job_id: &str, from: JobStatus, action: &str) -> KgError {
    KgError::new(
        ErrorCode::ConflictInvalidTransition,
        format!("job {job_id} in status {from:?} cannot {action}"),
    )
    .with_context("job_id", job_id)
}

fn not_found(job_id: &str) -> KgError {
    KgError::new(ErrorCode::NotFoundJob, format!("no job with id {job_id}")).with_context("job_id", job_id)
}

struct Inner {
    jobs: BTreeMap<JobId, Job>,
    events: Vec<JobEvent>,
    in_flight: BTreeMap<(String, String), JobId>,
    completed: BTreeMap<(String, String), JobId>,
    heartbeats: BTreeMap<JobId, UtcTime>,
}

/// The job queue: enqueue/approve/cancel/dispatch/complete, dedup, and the
/// retention sweep. Held as a single `Arc<JobQueue>` and shared across the
/// daemon's request handlers and worker loop.
pub struct JobQueue {
    clock: Arc<dyn Clock>,
    queue_config: QueueConfig,
    approval_config: ApprovalConfig,
    inner: RwLock<Inner>,
}

impl JobQueue {
    /// Construct an empty queue.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, queue_config: QueueConfig, approval_config: ApprovalConfig) -> Self {
        Self {
            clock,
            queue_config,
            approval_config,
            inner: RwLock::new(Inner {
                jobs: BTreeMap::new(),
                events: Vec::new(),
                in_flight: BTreeMap::new(),
                completed: BTreeMap::new(),
                heartbeats: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("job queue lock poisoned")
    }

    fn record_event(inner: &mut Inner, job_id: &str, status: JobStatus, actor: Option<i64>, reason: Option<String>, at: UtcTime) {
        inner.events.push(JobEvent { job_id: job_id.to_string(), status, actor, reason, at });
    }

    /// `true` when `spec` is auto-approvable: system/scheduled-task jobs
    /// always bypass approval (spec §4.1); otherwise a job is
    /// auto-approvable when `analysis` is absent (nothing to gate on) or
    /// its estimates fall under the configured thresholds.
    #[must_use]
    pub fn is_auto_approvable(&self, spec: &JobSpec, analysis: Option<&JobAnalysis>) -> bool {
        if spec.is_system_job || matches!(spec.source, JobSource::ScheduledTask) {
            return true;
        }
        match analysis {
            None => true,
            Some(analysis) => {
                let chunks_ok = analysis
                    .estimated_chunks
                    .is_none_or(|c| c <= u64::from(self.approval_config.auto_approve_under_chunks));
                let cost_ok = analysis
                    .estimated_cost_cents
                    .is_none_or(|c| c <= u64::from(self.approval_config.auto_approve_under_cost_cents));
                chunks_ok && cost_ok
            }
        }
    }

    /// Enqueue a new job (spec §4.1 `Enqueue`).
    pub fn enqueue(&self, spec: JobSpec, analysis: Option<JobAnalysis>) -> Result<EnqueueOutcome, KgError> {
        validate_job_spec(&spec).map_err(|errors| {
            let message = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            KgError::new(ErrorCode::ValidationMissingField, message)
        })?;

        let now = self.clock.now();
        let mut inner = self.lock();

        if let Some(hash) = &spec.content_hash {
            let key = (hash.clone(), spec.ontology.clone());
            if let Some(existing) = inner.in_flight.get(&key) {
                return Err(KgError::new(
                    ErrorCode::ConflictDuplicateJob,
                    format!("job {existing} already in flight for this content_hash/ontology"),
                )
                .with_context("job_id", existing.clone()));
            }
            if !spec.force {
                if let Some(existing_id) = inner.completed.get(&key).cloned() {
                    let existing = inner.jobs.get(&existing_id).cloned().expect("completed index dangling");
                    return Ok(EnqueueOutcome::AlreadyCompleted(existing));
                }
            }
        }

        let job_id = kg_clock::new_id(kg_clock::IdKind::Job);
        let auto_approved = self.is_auto_approvable(&spec, analysis.as_ref());
        let status = if auto_approved { JobStatus::Approved } else { JobStatus::AwaitingApproval };
        let expires_at = (!auto_approved)
            .then(|| now.plus(chrono::Duration::hours(i64::from(self.queue_config.approval_timeout_hours))));

        let job = Job {
            job_id: job_id.clone(),
            job_type: spec.job_type.clone(),
            status,
            content_hash: spec.content_hash.clone(),
            ontology: spec.ontology.clone(),
            user_id: spec.user_id,
            is_system_job: spec.is_system_job,
            source: spec.source,
            source_metadata: spec.source_metadata.clone(),
            processing_mode: spec.processing_mode,
            created_at: now,
            started_at: None,
            completed_at: None,
            approved_at: auto_approved.then_some(now),
            approved_by: None,
            expires_at,
            analysis,
            progress: None,
            result: None,
            error: None,
            job_data: spec.job_data.clone(),
            artifact_id: None,
        };

        if let Some(hash) = &spec.content_hash {
            inner.in_flight.insert((hash.clone(), spec.ontology.clone()), job_id.clone());
        }
        Self::record_event(&mut inner, &job_id, status, None, None, now);
        inner.jobs.insert(job_id, job.clone());
        Ok(EnqueueOutcome::Created(job))
    }

    /// Fetch a job snapshot by id.
    pub fn get(&self, job_id: &str) -> Result<Job, KgError> {
        self.inner.read().expect("job queue lock poisoned").jobs.get(job_id).cloned().ok_or_else(|| not_found(job_id))
    }

    /// Page through jobs matching `filter`, ordered by `job_id`.
    #[must_use]
    pub fn list(&self, filter: &JobFilter) -> JobPage {
        let inner = self.inner.read().expect("job queue lock poisoned");
        let limit = filter.limit.max(1);
        let matches: Vec<Job> = inner
            .jobs
            .iter()
            .filter(|(id, _)| filter.after_id.as_deref().is_none_or(|after| id.as_str() > after))
            .map(|(_, job)| job)
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| filter.owner.is_none_or(|owner| job.user_id == owner))
            .filter(|job| filter.is_system_job.is_none_or(|flag| job.is_system_job == flag))
            .cloned()
            .collect();

        let mut page: Vec<Job> = matches.into_iter().take(limit + 1).collect();
        let next_after_id = if page.len() > limit { page.pop().map(|_| page.last().unwrap().job_id.clone()) } else { None };
        JobPage { jobs: page, next_after_id }
    }

    /// Approve an `awaiting_approval` job (spec §4.1 `Approve`).
    pub fn approve(&self, job_id: &str, approver: i64) -> Result<Job, KgError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::AwaitingApproval {
            return Err(invalid_transition(job_id, job.status, "be approved"));
        }
        job.status = JobStatus::Approved;
        job.approved_at = Some(now);
        job.approved_by = Some(approver);
        job.expires_at = None;
        let result = job.clone();
        Self::record_event(&mut inner, job_id, JobStatus::Approved, Some(approver), None, now);
        Ok(result)
    }

    /// Cancel a non-terminal job (spec §4.1 `Cancel`).
    pub fn cancel(&self, job_id: &str, canceller: Option<i64>, reason: impl Into<String>) -> Result<Job, KgError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let reason = reason.into();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status.is_terminal() {
            return Err(invalid_transition(job_id, job.status, "be cancelled"));
        }
        let hash_key = job.content_hash.clone().map(|h| (h, job.ontology.clone()));
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        let result = job.clone();
        if let Some(key) = hash_key {
            inner.in_flight.remove(&key);
        }
        Self::record_event(&mut inner, job_id, JobStatus::Cancelled, canceller, Some(reason), now);
        Ok(result)
    }

    /// Delete a terminal job's row (spec §4.1 `Delete`). The job's
    /// [`JobEvent`] history is retained.
    pub fn delete(&self, job_id: &str) -> Result<(), KgError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let job = inner.jobs.get(job_id).ok_or_else(|| not_found(job_id))?;
        if !job.status.is_terminal() {
            return Err(invalid_transition(job_id, job.status, "be deleted"));
        }
        Self::record_event(&mut inner, job_id, job.status, None, Some("deleted".into()), now);
        inner.jobs.remove(job_id);
        inner.heartbeats.remove(job_id);
        Ok(())
    }

    /// Select `approved` jobs for dispatch into `queued`, FIFO by
    /// `created_at`, respecting `max_concurrent_workers` and serial
    /// exclusivity: a `serial` job only starts when no other job is
    /// running or queued, and while one is running no other job may start.
    pub fn dispatch_ready(&self) -> Vec<Job> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let capacity = self.queue_config.max_concurrent_workers as usize;

        let mut occupied = inner
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Queued))
            .count();
        let exclusive_in_play = inner
            .jobs
            .values()
            .any(|j| matches!(j.status, JobStatus::Running | JobStatus::Queued) && j.processing_mode == ProcessingMode::Serial);

        if exclusive_in_play {
            return Vec::new();
        }

        let mut candidates: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Approved)
            .map(|j| j.job_id.clone())
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &inner.jobs[a];
            let jb = &inner.jobs[b];
            ja.created_at.cmp(&jb.created_at).then_with(|| a.cmp(b))
        });

        let mut dispatched = Vec::new();
        let mut claimed_exclusive = false;
        for id in candidates {
            if occupied >= capacity || claimed_exclusive {
                break;
            }
            let mode = inner.jobs[&id].processing_mode;
            if mode == ProcessingMode::Serial && occupied > 0 {
                continue;
            }
            let job = inner.jobs.get_mut(&id).expect("candidate vanished under lock");
            job.status = JobStatus::Queued;
            occupied += 1;
            if mode == ProcessingMode::Serial {
                claimed_exclusive = true;
            }
            dispatched.push(job.clone());
            Self::record_event(&mut inner, &id, JobStatus::Queued, None, None, now);
        }
        dispatched
    }

    /// A worker claims a `queued` job and begins driving it.
    pub fn start(&self, job_id: &str) -> Result<Job, KgError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::Queued {
            return Err(invalid_transition(job_id, job.status, "be started"));
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        let result = job.clone();
        inner.heartbeats.insert(job_id.to_string(), now);
        Self::record_event(&mut inner, job_id, JobStatus::Running, None, None, now);
        Ok(result)
    }

    /// Attach the artifact a worker produced to the job that produced it
    /// (spec §4.3 step 5 "link `job.artifact_id`"). Callable at any status;
    /// a worker typically calls this just before [`Self::complete`].
    pub fn link_artifact(&self, job_id: &str, artifact_id: impl Into<String>) -> Result<(), KgError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        job.artifact_id = Some(artifact_id.into());
        Ok(())
    }

    /// Record a liveness heartbeat for a running job.
    pub fn heartbeat(&self, job_id: &str) -> Result<(), KgError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let job = inner.jobs.get(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::Running {
            return Err(invalid_transition(job_id, job.status, "receive a heartbeat"));
        }
        inner.heartbeats.insert(job_id.to_string(), now);
        Ok(())
    }

    /// Persist a progress snapshot (spec §4.1 `UpdateProgress`). Idempotent:
    /// a snapshot that is not a monotonic successor of the current one is
    /// dropped silently rather than erroring, since repeated/out-of-order
    /// delivery from a restarted worker is expected.
    pub fn update_progress(&self, job_id: &str, snapshot: ProgressSnapshot) -> Result<(), KgError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if job.status != JobStatus::Running {
            return Err(invalid_transition(job_id, job.status, "receive progress"));
        }
        let accept = match &job.progress {
            Some(prior) => snapshot.is_monotonic_successor_of(prior),
            None => true,
        };
        if accept {
            job.progress = Some(snapshot);
        } else {
            tracing::warn!(target: "kg_queue", job_id, "dropped out-of-order progress snapshot");
        }
        Ok(())
    }

    /// Record a terminal outcome (spec §4.1 `Complete`). Idempotent: calling
    /// again with the job already in the matching terminal state is a no-op
    /// rather than an error (restart safety).
    pub fn complete(&self, job_id: &str, outcome: JobOutcome) -> Result<Job, KgError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let job = inner.jobs.get(job_id).ok_or_else(|| not_found(job_id))?;
        let target_status = match &outcome {
            JobOutcome::Success(_) => JobStatus::Completed,
            JobOutcome::Failure(_) => JobStatus::Failed,
        };
        if job.status == target_status {
            return Ok(job.clone());
        }
        if job.status != JobStatus::Running {
            return Err(invalid_transition(job_id, job.status, "complete"));
        }

        let hash_key = job.content_hash.clone().map(|h| (h, job.ontology.clone()));
        let job = inner.jobs.get_mut(job_id).expect("checked above");
        job.status = target_status;
        job.completed_at = Some(now);
        match outcome {
            JobOutcome::Success(result) => job.result = Some(result),
            JobOutcome::Failure(message) => job.error = Some(message),
        }
        let result = job.clone();

        if let Some(key) = hash_key {
            inner.in_flight.remove(&key);
            if target_status == JobStatus::Completed {
                inner.completed.insert(key, job_id.to_string());
            }
        }
        inner.heartbeats.remove(job_id);
        Self::record_event(&mut inner, job_id, target_status, None, None, now);
        Ok(result)
    }

    /// Transition any `awaiting_approval` job whose `expires_at` has passed
    /// into `cancelled`. Returns the ids cancelled.
    pub fn sweep_expired_approvals(&self) -> Vec<JobId> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::AwaitingApproval)
            .filter(|j| j.expires_at.is_some_and(|exp| now.seconds_since(exp) >= 0))
            .map(|j| j.job_id.clone())
            .collect();
        for id in &expired {
            let job = inner.jobs.get_mut(id).expect("id just collected");
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            Self::record_event(&mut inner, id, JobStatus::Cancelled, None, Some("approval timeout".into()), now);
        }
        expired
    }

    /// Reset `running` jobs whose heartbeat is older than `timeout_seconds`
    /// back to `queued` (spec §4.1 "on process restart... reset to
    /// queued"). Returns the ids reset.
    pub fn reap_stale_running(&self, timeout_seconds: i64) -> Vec<JobId> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let stale: Vec<JobId> = inner
            .heartbeats
            .iter()
            .filter(|(_, last)| now.seconds_since(**last) >= timeout_seconds)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(job) = inner.jobs.get_mut(id) {
                if job.status == JobStatus::Running {
                    job.status = JobStatus::Queued;
                    job.started_at = None;
                    Self::record_event(&mut inner, id, JobStatus::Queued, None, Some("heartbeat lapsed".into()), now);
                }
            }
            inner.heartbeats.remove(id);
        }
        stale
    }

    /// Remove `completed`/`failed` job rows older than their configured
    /// retention window. The [`JobEvent`] history for each row removed is
    /// left in place as the durable audit trail that survives archival.
    pub fn sweep_retention(&self) -> Vec<JobId> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let completed_cutoff = i64::from(self.queue_config.completed_retention_hours) * 3600;
        let failed_cutoff = i64::from(self.queue_config.failed_retention_hours) * 3600;

        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| match (j.status, j.completed_at) {
                (JobStatus::Completed, Some(at)) => now.seconds_since(at) >= completed_cutoff,
                (JobStatus::Failed, Some(at)) => now.seconds_since(at) >= failed_cutoff,
                _ => false,
            })
            .map(|j| j.job_id.clone())
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        expired
    }

    /// The full transition history for `job_id`, oldest first. Returns rows
    /// even after the job row itself has been archived.
    #[must_use]
    pub fn events_for(&self, job_id: &str) -> Vec<JobEvent> {
        self.inner
            .read()
            .expect("job queue lock poisoned")
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_clock::FixedClock;
    use kg_core::{JobSpec, JobType};
    use std::collections::BTreeMap as Map;

    fn queue() -> (JobQueue, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let queue = JobQueue::new(clock.clone(), QueueConfig::default(), ApprovalConfig::default());
        (queue, clock)
    }

    fn spec(hash: Option<&str>, force: bool) -> JobSpec {
        JobSpec {
            job_type: JobType::Ingestion,
            job_data: serde_json::json!({}),
            content_hash: hash.map(str::to_string),
            ontology: "default".into(),
            user_id: 42,
            is_system_job: false,
            source: JobSource::UserApi,
            source_metadata: Map::new(),
            processing_mode: ProcessingMode::Parallel,
            force,
        }
    }

    #[test]
    fn enqueue_without_analysis_auto_approves() {
        let (queue, _clock) = queue();
        let outcome = queue.enqueue(spec(Some("sha256:a"), false), None).unwrap();
        match outcome {
            EnqueueOutcome::Created(job) => assert_eq!(job.status, JobStatus::Approved),
            EnqueueOutcome::AlreadyCompleted(_) => panic!("expected a new job"),
        }
    }

    #[test]
    fn enqueue_over_threshold_awaits_approval() {
        let (queue, _clock) = queue();
        let analysis = JobAnalysis { estimated_chunks: Some(500), estimated_cost_cents: Some(10), notes: vec![] };
        let outcome = queue.enqueue(spec(Some("sha256:a"), false), Some(analysis)).unwrap();
        match outcome {
            EnqueueOutcome::Created(job) => {
                assert_eq!(job.status, JobStatus::AwaitingApproval);
                assert!(job.expires_at.is_some());
            }
            EnqueueOutcome::AlreadyCompleted(_) => panic!("expected a new job"),
        }
    }

    #[test]
    fn duplicate_in_flight_job_is_rejected() {
        let (queue, _clock) = queue();
        queue.enqueue(spec(Some("sha256:a"), false), None).unwrap();
        let err = queue.enqueue(spec(Some("sha256:a"), false), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConflictDuplicateJob);
    }

    #[test]
    fn completed_job_short_circuits_unless_forced() {
        let (queue, _clock) = queue();
        let job = match queue.enqueue(spec(Some("sha256:a"), false), None).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        queue.dispatch_ready();
        queue.start(&job.job_id).unwrap();
        queue.complete(&job.job_id, JobOutcome::Success(serde_json::json!({"ok": true}))).unwrap();

        match queue.enqueue(spec(Some("sha256:a"), false), None).unwrap() {
            EnqueueOutcome::AlreadyCompleted(existing) => assert_eq!(existing.job_id, job.job_id),
            EnqueueOutcome::Created(_) => panic!("expected the prior completed job"),
        }

        match queue.enqueue(spec(Some("sha256:a"), true), None).unwrap() {
            EnqueueOutcome::Created(new_job) => assert_ne!(new_job.job_id, job.job_id),
            EnqueueOutcome::AlreadyCompleted(_) => panic!("force should bypass the short-circuit"),
        }
    }

    #[test]
    fn approve_then_dispatch_then_start_then_complete() {
        let (queue, _clock) = queue();
        let analysis = JobAnalysis { estimated_chunks: Some(500), ..Default::default() };
        let job = match queue.enqueue(spec(None, false), Some(analysis)).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        assert_eq!(job.status, JobStatus::AwaitingApproval);

        let approved = queue.approve(&job.job_id, 7).unwrap();
        assert_eq!(approved.status, JobStatus::Approved);
        assert_eq!(approved.approved_by, Some(7));

        let dispatched = queue.dispatch_ready();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].status, JobStatus::Queued);

        let running = queue.start(&job.job_id).unwrap();
        assert_eq!(running.status, JobStatus::Running);

        let completed = queue.complete(&job.job_id, JobOutcome::Success(serde_json::json!({}))).unwrap();
        assert_eq!(completed.status, JobStatus::Completed);

        // idempotent repeat
        let again = queue.complete(&job.job_id, JobOutcome::Success(serde_json::json!({}))).unwrap();
        assert_eq!(again.status, JobStatus::Completed);
    }

    #[test]
    fn serial_job_blocks_other_dispatch_until_it_finishes() {
        let (queue, _clock) = queue();
        let mut serial_spec = spec(Some("sha256:serial"), false);
        serial_spec.processing_mode = ProcessingMode::Serial;
        let serial_job = match queue.enqueue(serial_spec, None).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        let parallel_job = match queue.enqueue(spec(Some("sha256:parallel"), false), None).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };

        let first_round = queue.dispatch_ready();
        assert_eq!(first_round.len(), 1);
        assert_eq!(first_round[0].job_id, serial_job.job_id);

        let second_round = queue.dispatch_ready();
        assert!(second_round.is_empty());

        queue.start(&serial_job.job_id).unwrap();
        queue.complete(&serial_job.job_id, JobOutcome::Success(serde_json::json!({}))).unwrap();

        let third_round = queue.dispatch_ready();
        assert_eq!(third_round.len(), 1);
        assert_eq!(third_round[0].job_id, parallel_job.job_id);
    }

    #[test]
    fn expired_approval_is_swept_to_cancelled() {
        let (queue, clock) = queue();
        let analysis = JobAnalysis { estimated_chunks: Some(500), ..Default::default() };
        let job = match queue.enqueue(spec(None, false), Some(analysis)).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        clock.advance(chrono::Duration::hours(25));
        let cancelled = queue.sweep_expired_approvals();
        assert_eq!(cancelled, vec![job.job_id.clone()]);
        assert_eq!(queue.get(&job.job_id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn stale_heartbeat_resets_running_job_to_queued() {
        let (queue, clock) = queue();
        let job = match queue.enqueue(spec(None, false), None).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        queue.dispatch_ready();
        queue.start(&job.job_id).unwrap();
        clock.advance(chrono::Duration::seconds(120));
        let reset = queue.reap_stale_running(60);
        assert_eq!(reset, vec![job.job_id.clone()]);
        assert_eq!(queue.get(&job.job_id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn link_artifact_sets_job_artifact_id() {
        let (queue, _clock) = queue();
        let job = match queue.enqueue(spec(None, false), None).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        queue.link_artifact(&job.job_id, "artifact_abc").unwrap();
        assert_eq!(queue.get(&job.job_id).unwrap().artifact_id.as_deref(), Some("artifact_abc"));
    }

    #[test]
    fn retention_sweep_removes_row_but_keeps_events() {
        let (queue, clock) = queue();
        let job = match queue.enqueue(spec(Some("sha256:a"), false), None).unwrap() {
            EnqueueOutcome::Created(job) => job,
            _ => unreachable!(),
        };
        queue.dispatch_ready();
        queue.start(&job.job_id).unwrap();
        queue.complete(&job.job_id, JobOutcome::Success(serde_json::json!({}))).unwrap();

        clock.advance(chrono::Duration::hours(49));
        let removed = queue.sweep_retention();
        assert_eq!(removed, vec![job.job_id.clone()]);
        assert!(queue.get(&job.job_id).is_err());
        assert!(!queue.events_for(&job.job_id).is_empty());
    }

    #[test]
    fn list_pages_by_job_id_cursor() {
        let (queue, _clock) = queue();
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = queue.enqueue(spec(Some(&format!("sha256:{i}")), false), None).unwrap();
            match outcome {
                EnqueueOutcome::Created(job) => ids.push(job.job_id),
                EnqueueOutcome::AlreadyCompleted(_) => panic!("unexpected dedup"),
            }
        }
        ids.sort();

        let first_page = queue.list(&JobFilter { limit: 2, ..Default::default() });
        assert_eq!(first_page.jobs.len(), 2);
        assert!(first_page.next_after_id.is_some());

        let second_page = queue.list(&JobFilter { limit: 2, after_id: first_page.next_after_id, ..Default::default() });
        assert_eq!(second_page.jobs.len(), 2);
        assert_ne!(first_page.jobs[0].job_id, second_page.jobs[0].job_id);
    }
}
