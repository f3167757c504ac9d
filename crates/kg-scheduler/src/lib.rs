//! kg-scheduler
//!
//! Scheduled-jobs dispatcher (spec §4.2): a periodic tick compares each
//! [`kg_core::ScheduledJob`] row's `next_run` against the clock, invokes its
//! named [`Launcher`], and re-enqueues work through the same [`kg_queue`]
//! path a user-submitted job takes. Launchers never touch the job queue or
//! the graph directly on their own schedule; the dispatcher owns cron
//! parsing, retry/backoff, and auto-disabling.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use kg_artifacts::ArtifactStore;
use kg_clock::{Clock, UtcTime, SYSTEM_USER_ID};
use kg_core::{JobAnalysis, JobSource, JobSpec, JobType, ProcessingMode, ScheduledJob};
use kg_error::{ErrorCode, KgError};
use kg_graph::GraphFacade;
use kg_queue::JobQueue;
use kg_telemetry::{exceeds_threshold, GraphMetrics, GraphMetricsSnapshot};
use serde_json::json;
use tracing::{info, warn};

/// Shared, read-only services a [`Launcher`] may consult while deciding
/// whether to enqueue work. Rebuilt by the caller on every tick so each
/// launcher always sees current state.
pub struct LauncherContext {
    /// Graph-change epoch counters (spec §4.7).
    pub telemetry: Arc<GraphMetrics>,
    /// Graph store, for launchers that need live object counts.
    pub graph: Arc<dyn GraphFacade>,
    /// Artifact store, for the artifact-cleanup launcher.
    pub artifacts: Arc<ArtifactStore>,
    /// Query definition ids still referenced by a live view, supplied by the
    /// caller (the query-definition store lives above this crate).
    pub live_query_definition_ids: HashSet<String>,
}

/// A unit of work a [`Launcher`] wants enqueued. Carries the same
/// `(JobSpec, Option<JobAnalysis>)` pair [`JobQueue::enqueue`] accepts.
#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    /// The job to enqueue.
    pub spec: JobSpec,
    /// Optional pre-computed cost/size analysis for the approval gate.
    pub analysis: Option<JobAnalysis>,
}

/// One named, scheduled unit of periodic work (spec §4.2). A launcher never
/// mutates the graph itself; it inspects current state and decides what, if
/// anything, to enqueue. Re-running on unchanged state must return no new
/// work — that is what makes a tick idempotent.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// The `launcher_class` name this launcher answers to.
    fn name(&self) -> &str;

    /// Inspect current state and return zero or more jobs to enqueue.
    async fn tick(&self, now: UtcTime, ctx: &LauncherContext) -> Result<Vec<EnqueueSpec>, KgError>;
}

fn system_job(job_type: JobType, ontology: &str, job_data: serde_json::Value) -> JobSpec {
    JobSpec {
        job_type,
        job_data,
        content_hash: None,
        ontology: ontology.to_string(),
        user_id: SYSTEM_USER_ID,
        is_system_job: true,
        source: JobSource::ScheduledTask,
        source_metadata: BTreeMap::new(),
        processing_mode: ProcessingMode::Parallel,
        force: false,
    }
}

/// A launcher that inspects one named counter on [`GraphMetricsSnapshot`]
/// and enqueues a single job when it has advanced by at least `threshold`
/// since the last tick that acted. Covers every named launcher in spec
/// §4.2 except artifact-cleanup, which is unconditional.
pub struct CounterGatedLauncher {
    name: String,
    job_type: JobType,
    ontology: String,
    threshold: u64,
    counter: fn(&GraphMetricsSnapshot) -> u64,
    on_fire: fn(&GraphMetrics),
    last_measured: AtomicU64,
}

impl CounterGatedLauncher {
    /// Build a counter-gated launcher.
    ///
    /// `counter` reads the relevant cumulative/epoch value out of a
    /// snapshot; `on_fire` is called against the live [`GraphMetrics`]
    /// table after a successful enqueue, to record an epoch watermark
    /// (e.g. `record_annealing_epoch`) where the launcher's semantics call
    /// for one. Pass a no-op fn pointer when there is none to record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        ontology: impl Into<String>,
        threshold: u64,
        counter: fn(&GraphMetricsSnapshot) -> u64,
        on_fire: fn(&GraphMetrics),
    ) -> Self {
        Self {
            name: name.into(),
            job_type,
            ontology: ontology.into(),
            threshold,
            counter,
            on_fire,
            last_measured: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Launcher for CounterGatedLauncher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tick(&self, _now: UtcTime, ctx: &LauncherContext) -> Result<Vec<EnqueueSpec>, KgError> {
        let snapshot = ctx.telemetry.snapshot();
        let current = (self.counter)(&snapshot);
        let last = self.last_measured.load(Ordering::Acquire);
        if !exceeds_threshold(current, last, self.threshold) {
            return Ok(Vec::new());
        }

        self.last_measured.store(current, Ordering::Release);
        (self.on_fire)(&ctx.telemetry);

        let spec = system_job(
            self.job_type.clone(),
            &self.ontology,
            json!({ "launcher": self.name, "delta": current.saturating_sub(last) }),
        );
        Ok(vec![EnqueueSpec { spec, analysis: None }])
    }
}

fn noop(_: &GraphMetrics) {}

/// `category-refresh` (every 6h): recompute per-ontology category
/// projections whenever a document has been ingested since the last run.
#[must_use]
pub fn category_refresh_launcher(ontology: impl Into<String>) -> CounterGatedLauncher {
    CounterGatedLauncher::new(
        "category-refresh",
        JobType::ProjectionRefresh,
        ontology,
        1,
        |s| s.document_ingestion_counter,
        noop,
    )
}

/// `vocabulary-consolidation` (every 12h): merge near-duplicate
/// relationship/concept types whenever the vocabulary has changed.
#[must_use]
pub fn vocabulary_consolidation_launcher(ontology: impl Into<String>) -> CounterGatedLauncher {
    CounterGatedLauncher::new(
        "vocabulary-consolidation",
        JobType::VocabConsolidation,
        ontology,
        1,
        |s| s.vocabulary_change_counter,
        noop,
    )
}

/// `projection-refresh` (hourly): recompute cached projections whenever the
/// graph has changed.
#[must_use]
pub fn projection_refresh_launcher(ontology: impl Into<String>) -> CounterGatedLauncher {
    CounterGatedLauncher::new(
        "projection-refresh",
        JobType::ProjectionRefresh,
        ontology,
        1,
        |s| s.graph_change_counter,
        noop,
    )
}

/// `epistemic-remeasurement` (hourly, gated on `vocabulary_change_counter`
/// delta, spec §4.2/§4.7). The re-measurement itself belongs to an external
/// epistemics subsystem out of scope here; this launcher only decides
/// whether one is due and records the watermark.
#[must_use]
pub fn epistemic_remeasurement_launcher(ontology: impl Into<String>, threshold: u64) -> CounterGatedLauncher {
    CounterGatedLauncher::new(
        "epistemic-remeasurement",
        JobType::Other("epistemic_remeasurement".to_string()),
        ontology,
        threshold,
        |s| s.vocabulary_change_counter,
        GraphMetrics::record_breathing_epoch,
    )
}

/// `ontology-annealing` (every 6h, gated on `last_annealing_epoch` delta,
/// spec §4.2/§4.7). As with epistemic re-measurement, the distributed
/// annealing protocol itself is out of scope; this launcher only decides
/// whether a round is due.
#[must_use]
pub fn ontology_annealing_launcher(ontology: impl Into<String>, threshold: u64) -> CounterGatedLauncher {
    CounterGatedLauncher::new(
        "ontology-annealing",
        JobType::Other("ontology_annealing".to_string()),
        ontology,
        threshold,
        |s| s.graph_change_counter,
        GraphMetrics::record_annealing_epoch,
    )
}

/// `artifact-cleanup` (daily): run [`ArtifactStore::cleanup`] directly.
/// Unconditional: deleting nothing when there is nothing to delete is
/// already idempotent, so there is no counter to gate on.
pub struct ArtifactCleanupLauncher;

#[async_trait]
impl Launcher for ArtifactCleanupLauncher {
    fn name(&self) -> &str {
        "artifact-cleanup"
    }

    async fn tick(&self, _now: UtcTime, ctx: &LauncherContext) -> Result<Vec<EnqueueSpec>, KgError> {
        let report = ctx.artifacts.cleanup(&ctx.live_query_definition_ids).await;
        if !report.expired.is_empty() || !report.orphaned.is_empty() || !report.superseded.is_empty() {
            info!(
                target: "kg_scheduler",
                expired = report.expired.len(),
                orphaned = report.orphaned.len(),
                superseded = report.superseded.len(),
                "artifact cleanup swept stale artifacts"
            );
        }
        Ok(Vec::new())
    }
}

/// Registry of `launcher_class` name to [`Launcher`] instance. Schedules
/// reference launchers by name so new launchers can be registered without
/// touching the `ScheduledJob` rows.
#[derive(Clone, Default)]
pub struct LauncherRegistry {
    launchers: BTreeMap<String, Arc<dyn Launcher>>,
}

impl LauncherRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a launcher under its own [`Launcher::name`].
    pub fn register(&mut self, launcher: Arc<dyn Launcher>) {
        self.launchers.insert(launcher.name().to_string(), launcher);
    }

    /// Look up a launcher by `launcher_class`.
    #[must_use]
    pub fn get(&self, launcher_class: &str) -> Option<Arc<dyn Launcher>> {
        self.launchers.get(launcher_class).cloned()
    }
}

/// Outcome of one schedule's evaluation during a tick, returned for
/// logging/testing. Not itself persisted; the updated [`ScheduledJob`] row
/// carries the durable effect.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// `next_run` was in the future; nothing happened.
    NotDue,
    /// The schedule is disabled; nothing happened.
    Disabled,
    /// No launcher is registered under this schedule's `launcher_class`.
    UnknownLauncher,
    /// The launcher ran and enqueued `jobs_enqueued` jobs.
    Ran {
        /// Number of jobs the launcher asked to enqueue.
        jobs_enqueued: usize,
    },
    /// The launcher returned an error; the schedule's retry budget was
    /// charged.
    Failed {
        /// `true` if this failure exhausted `max_retries` and disabled the
        /// schedule.
        auto_disabled: bool,
    },
}

/// Backoff applied to a failed schedule's `next_run`: `2^retry_count`
/// minutes, capped at 24h, so a flaky launcher does not spin.
fn backoff_for(retry_count: u32) -> Duration {
    let minutes = 1u64.checked_shl(retry_count.min(10)).unwrap_or(u64::MAX).min(24 * 60);
    Duration::minutes(minutes as i64)
}

fn next_cron_run(schedule_cron: &str, after: UtcTime) -> Result<UtcTime, KgError> {
    let schedule = cron::Schedule::from_str(schedule_cron).map_err(|e| {
        KgError::new(ErrorCode::Internal, format!("invalid cron expression {schedule_cron:?}: {e}"))
    })?;
    schedule
        .after(&after.as_chrono())
        .next()
        .map(UtcTime::new)
        .ok_or_else(|| KgError::new(ErrorCode::Internal, format!("cron expression {schedule_cron:?} has no future occurrence")))
}

/// The scheduled-jobs dispatcher: holds the live set of [`ScheduledJob`]
/// rows and drives them against a [`LauncherRegistry`] on each tick.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    queue: Arc<JobQueue>,
    registry: LauncherRegistry,
    schedules: std::sync::RwLock<BTreeMap<String, ScheduledJob>>,
}

impl Scheduler {
    /// Build a dispatcher with no schedules registered yet.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, queue: Arc<JobQueue>, registry: LauncherRegistry) -> Self {
        Self { clock, queue, registry, schedules: std::sync::RwLock::new(BTreeMap::new()) }
    }

    /// Add or replace a schedule row by name.
    pub fn upsert_schedule(&self, schedule: ScheduledJob) {
        self.schedules.write().expect("scheduler lock poisoned").insert(schedule.name.clone(), schedule);
    }

    /// Construct and register a new schedule, computing its first
    /// `next_run` from `schedule_cron` evaluated against the clock's
    /// current time.
    pub fn add_schedule(
        &self,
        name: impl Into<String>,
        launcher_class: impl Into<String>,
        schedule_cron: impl Into<String>,
        max_retries: u32,
    ) -> Result<(), KgError> {
        let schedule_cron = schedule_cron.into();
        let now = self.clock.now();
        let next_run = next_cron_run(&schedule_cron, now)?;
        self.upsert_schedule(ScheduledJob {
            name: name.into(),
            launcher_class: launcher_class.into(),
            schedule_cron,
            enabled: true,
            max_retries,
            retry_count: 0,
            last_run: None,
            last_success: None,
            last_failure: None,
            next_run,
        });
        Ok(())
    }

    /// Current snapshot of every schedule row, sorted by name.
    #[must_use]
    pub fn schedules(&self) -> Vec<ScheduledJob> {
        self.schedules.read().expect("scheduler lock poisoned").values().cloned().collect()
    }

    /// Look up one schedule row by name.
    #[must_use]
    pub fn schedule(&self, name: &str) -> Option<ScheduledJob> {
        self.schedules.read().expect("scheduler lock poisoned").get(name).cloned()
    }

    /// Evaluate every due schedule once. Intended to be called from a
    /// `tokio::time::interval` loop in the daemon binary; a single call
    /// advances every schedule whose `next_run` has passed, in name order.
    pub async fn tick(&self, ctx: &LauncherContext) -> BTreeMap<String, TickOutcome> {
        let now = self.clock.now();
        let due: Vec<ScheduledJob> = {
            let schedules = self.schedules.read().expect("scheduler lock poisoned");
            schedules.values().filter(|s| s.enabled && now >= s.next_run).cloned().collect()
        };

        let mut outcomes = BTreeMap::new();
        for schedule in due {
            let outcome = self.run_one(&schedule, now, ctx).await;
            outcomes.insert(schedule.name.clone(), outcome);
        }
        outcomes
    }

    async fn run_one(&self, schedule: &ScheduledJob, now: UtcTime, ctx: &LauncherContext) -> TickOutcome {
        let Some(launcher) = self.registry.get(&schedule.launcher_class) else {
            warn!(target: "kg_scheduler", schedule = %schedule.name, launcher_class = %schedule.launcher_class, "no launcher registered for schedule");
            return TickOutcome::UnknownLauncher;
        };

        match launcher.tick(now, ctx).await {
            Ok(specs) => {
                let jobs_enqueued = specs.len();
                for EnqueueSpec { spec, analysis } in specs {
                    if let Err(e) = self.queue.enqueue(spec, analysis) {
                        warn!(target: "kg_scheduler", schedule = %schedule.name, error = %e, "scheduled launcher's job failed to enqueue");
                    }
                }

                let next_run = match next_cron_run(&schedule.schedule_cron, now) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(target: "kg_scheduler", schedule = %schedule.name, error = %e, "could not compute next cron occurrence");
                        now.plus(Duration::hours(1))
                    }
                };
                self.update_schedule(&schedule.name, |row| {
                    row.last_run = Some(now);
                    row.last_success = Some(now);
                    row.retry_count = 0;
                    row.next_run = next_run;
                });
                info!(target: "kg_scheduler", schedule = %schedule.name, jobs_enqueued, "scheduled launcher ran");
                TickOutcome::Ran { jobs_enqueued }
            }
            Err(e) => {
                warn!(target: "kg_scheduler", schedule = %schedule.name, error = %e, "scheduled launcher failed");
                let mut auto_disabled = false;
                self.update_schedule(&schedule.name, |row| {
                    row.last_run = Some(now);
                    row.last_failure = Some(now);
                    row.retry_count += 1;
                    if row.retry_count >= row.max_retries {
                        row.enabled = false;
                        auto_disabled = true;
                    } else {
                        row.next_run = now.plus(backoff_for(row.retry_count));
                    }
                });
                TickOutcome::Failed { auto_disabled }
            }
        }
    }

    fn update_schedule(&self, name: &str, f: impl FnOnce(&mut ScheduledJob)) {
        if let Some(row) = self.schedules.write().expect("scheduler lock poisoned").get_mut(name) {
            f(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_artifacts::ArtifactStore;
    use kg_blob::InMemoryBlobStore;
    use kg_clock::FixedClock;
    use kg_config::ArtifactsConfig;
    use kg_graph::{GraphObjectCounts, InMemoryGraph};
    use kg_queue::JobQueue;

    fn ctx(clock: Arc<FixedClock>) -> (LauncherContext, Arc<JobQueue>) {
        let telemetry = Arc::new(GraphMetrics::new());
        let graph: Arc<dyn GraphFacade> = Arc::new(InMemoryGraph::new());
        let artifacts =
            Arc::new(ArtifactStore::new(Arc::new(InMemoryBlobStore::new()), clock.clone(), ArtifactsConfig::default()));
        let queue = Arc::new(JobQueue::new(clock.clone(), Default::default(), Default::default()));
        let context = LauncherContext {
            telemetry,
            graph,
            artifacts,
            live_query_definition_ids: HashSet::new(),
        };
        (context, queue)
    }

    #[tokio::test]
    async fn counter_gated_launcher_is_idempotent_on_unchanged_state() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, _queue) = ctx(clock.clone());
        context.telemetry.refresh_from_counts(&GraphObjectCounts {
            concept_count: 1,
            ..Default::default()
        });

        let launcher = projection_refresh_launcher("default");
        let first = launcher.tick(clock.now(), &context).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = launcher.tick(clock.now(), &context).await.unwrap();
        assert!(second.is_empty(), "re-running on unchanged state must enqueue nothing");
    }

    #[tokio::test]
    async fn counter_gated_launcher_fires_again_after_further_change() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, _queue) = ctx(clock.clone());
        context.telemetry.record_document_ingested();

        let launcher = category_refresh_launcher("default");
        assert_eq!(launcher.tick(clock.now(), &context).await.unwrap().len(), 1);
        assert!(launcher.tick(clock.now(), &context).await.unwrap().is_empty());

        context.telemetry.record_document_ingested();
        assert_eq!(launcher.tick(clock.now(), &context).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scheduler_runs_due_schedule_and_advances_next_run() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, queue) = ctx(clock.clone());
        context.telemetry.record_document_ingested();

        let mut registry = LauncherRegistry::new();
        registry.register(Arc::new(category_refresh_launcher("default")));
        let scheduler = Scheduler::new(clock.clone(), queue.clone(), registry);
        scheduler.add_schedule("category-refresh", "category-refresh", "0 0 */6 * * *", 3).unwrap();

        let outcomes = scheduler.tick(&context).await;
        assert_eq!(outcomes.get("category-refresh"), Some(&TickOutcome::Ran { jobs_enqueued: 1 }));

        let row = scheduler.schedule("category-refresh").unwrap();
        assert_eq!(row.retry_count, 0);
        assert!(row.next_run > UtcTime::epoch());
        assert_eq!(row.last_success, Some(UtcTime::epoch()));
    }

    #[tokio::test]
    async fn scheduler_not_due_yet_is_skipped() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, queue) = ctx(clock.clone());

        let mut registry = LauncherRegistry::new();
        registry.register(Arc::new(category_refresh_launcher("default")));
        let scheduler = Scheduler::new(clock.clone(), queue, registry);
        scheduler.upsert_schedule(ScheduledJob {
            name: "category-refresh".to_string(),
            launcher_class: "category-refresh".to_string(),
            schedule_cron: "0 0 */6 * * *".to_string(),
            enabled: true,
            max_retries: 3,
            retry_count: 0,
            last_run: None,
            last_success: None,
            last_failure: None,
            next_run: clock.now().plus(Duration::hours(1)),
        });

        let outcomes = scheduler.tick(&context).await;
        assert!(outcomes.is_empty(), "schedule not yet due must not run");
    }

    struct FailingLauncher;

    #[async_trait]
    impl Launcher for FailingLauncher {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn tick(&self, _now: UtcTime, _ctx: &LauncherContext) -> Result<Vec<EnqueueSpec>, KgError> {
            Err(KgError::new(ErrorCode::Internal, "simulated launcher failure"))
        }
    }

    #[tokio::test]
    async fn repeated_failures_auto_disable_after_max_retries() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, queue) = ctx(clock.clone());

        let mut registry = LauncherRegistry::new();
        registry.register(Arc::new(FailingLauncher));
        let scheduler = Scheduler::new(clock.clone(), queue, registry);
        scheduler.add_schedule("flaky", "always-fails", "0 * * * * *", 2).unwrap();

        for _ in 0..2 {
            let row = scheduler.schedule("flaky").unwrap();
            clock.set(row.next_run);
            scheduler.tick(&context).await;
        }

        let row = scheduler.schedule("flaky").unwrap();
        assert_eq!(row.retry_count, 2);
        assert!(!row.enabled, "schedule must auto-disable once retry budget is exhausted");

        clock.advance(Duration::days(1));
        let outcomes = scheduler.tick(&context).await;
        assert!(outcomes.is_empty(), "disabled schedule must not run even when due");
    }

    #[tokio::test]
    async fn unknown_launcher_class_reports_cleanly() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, queue) = ctx(clock.clone());
        let scheduler = Scheduler::new(clock.clone(), queue, LauncherRegistry::new());
        scheduler.add_schedule("orphan", "does-not-exist", "0 * * * * *", 3).unwrap();

        let outcomes = scheduler.tick(&context).await;
        assert_eq!(outcomes.get("orphan"), Some(&TickOutcome::UnknownLauncher));
    }

    #[tokio::test]
    async fn artifact_cleanup_launcher_runs_unconditionally() {
        let clock = Arc::new(FixedClock::new(UtcTime::epoch()));
        let (context, _queue) = ctx(clock.clone());
        let launcher = ArtifactCleanupLauncher;
        assert!(launcher.tick(clock.now(), &context).await.unwrap().is_empty());
        assert!(launcher.tick(clock.now(), &context).await.unwrap().is_empty());
    }
}
