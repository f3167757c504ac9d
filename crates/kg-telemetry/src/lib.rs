// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! kg-telemetry
//!
//! Graph-change epoch counters (spec §4.7) and ingestion job run metrics.
//! Structured telemetry collection, generalised from the workspace's run
//! metrics collector to a knowledge-graph job shape.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kg_graph::GraphObjectCounts;
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------------------------------------------------------------------
// Graph-change epoch
// ---------------------------------------------------------------------------

/// A snapshot of every named counter in [`GraphMetrics`], suitable for
/// embedding in a `stats_snapshot` artifact or exposing over the HTTP
/// surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMetricsSnapshot {
    /// Composite freshness epoch: the sum of current object counts.
    pub graph_change_counter: u64,
    /// Current concept count.
    pub concept_count: u64,
    /// Current relationship-edge count.
    pub total_edges: u64,
    /// Current distinct relationship-type count.
    pub vocabulary_type_count: u64,
    /// Current source (chunk/image) count.
    pub source_count: u64,
    /// Current evidence-instance count.
    pub instance_count: u64,
    /// Cumulative count of documents ingested.
    pub document_ingestion_counter: u64,
    /// Cumulative count of vocabulary substitutions/consolidations.
    pub vocabulary_change_counter: u64,
    /// `graph_change_counter` value at the last ontology-annealing run.
    pub last_annealing_epoch: u64,
    /// `graph_change_counter` value at the last epistemic re-measurement.
    pub last_breathing_epoch: u64,
}

/// Process-wide table of named counters backing the graph-change epoch
/// (spec §4.7). `graph_change_counter` is refreshed from the graph
/// facade's reported object counts; the remaining application-incremented
/// counters are cumulative and reconciled the same way.
#[derive(Debug, Default)]
pub struct GraphMetrics {
    graph_change_counter: AtomicU64,
    concept_count: AtomicU64,
    total_edges: AtomicU64,
    vocabulary_type_count: AtomicU64,
    source_count: AtomicU64,
    instance_count: AtomicU64,
    document_ingestion_counter: AtomicU64,
    vocabulary_change_counter: AtomicU64,
    last_annealing_epoch: AtomicU64,
    last_breathing_epoch: AtomicU64,
}

impl GraphMetrics {
    /// Create a table with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute `graph_change_counter` and the per-category object counts
    /// from the graph facade's current reported state. Called after
    /// ingestion completion, after backup-restore, and periodically
    /// (spec §4.7).
    pub fn refresh_from_counts(&self, counts: &GraphObjectCounts) {
        self.concept_count.store(counts.concept_count, Ordering::Release);
        self.total_edges.store(counts.total_edges, Ordering::Release);
        self.vocabulary_type_count
            .store(counts.vocabulary_type_count, Ordering::Release);
        self.source_count.store(counts.source_count, Ordering::Release);
        self.instance_count.store(counts.instance_count, Ordering::Release);

        let composite = counts.concept_count
            + counts.total_edges
            + counts.vocabulary_type_count
            + counts.source_count
            + counts.instance_count;
        self.graph_change_counter.store(composite, Ordering::Release);
    }

    /// Increment `document_ingestion_counter` and return its new value.
    pub fn record_document_ingested(&self) -> u64 {
        self.document_ingestion_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Increment `vocabulary_change_counter` and return its new value.
    pub fn record_vocabulary_change(&self) -> u64 {
        self.vocabulary_change_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record the `graph_change_counter` value at the time of the most
    /// recent ontology-annealing run.
    pub fn record_annealing_epoch(&self) {
        let current = self.graph_change_counter.load(Ordering::Acquire);
        self.last_annealing_epoch.store(current, Ordering::Release);
    }

    /// Record the `graph_change_counter` value at the time of the most
    /// recent epistemic re-measurement run.
    pub fn record_breathing_epoch(&self) {
        let current = self.graph_change_counter.load(Ordering::Acquire);
        self.last_breathing_epoch.store(current, Ordering::Release);
    }

    /// Current `graph_change_counter` value, for [`kg_core::Artifact::is_fresh`].
    #[must_use]
    pub fn graph_change_counter(&self) -> u64 {
        self.graph_change_counter.load(Ordering::Acquire)
    }

    /// Full snapshot of every counter.
    #[must_use]
    pub fn snapshot(&self) -> GraphMetricsSnapshot {
        GraphMetricsSnapshot {
            graph_change_counter: self.graph_change_counter.load(Ordering::Acquire),
            concept_count: self.concept_count.load(Ordering::Acquire),
            total_edges: self.total_edges.load(Ordering::Acquire),
            vocabulary_type_count: self.vocabulary_type_count.load(Ordering::Acquire),
            source_count: self.source_count.load(Ordering::Acquire),
            instance_count: self.instance_count.load(Ordering::Acquire),
            document_ingestion_counter: self.document_ingestion_counter.load(Ordering::Acquire),
            vocabulary_change_counter: self.vocabulary_change_counter.load(Ordering::Acquire),
            last_annealing_epoch: self.last_annealing_epoch.load(Ordering::Acquire),
            last_breathing_epoch: self.last_breathing_epoch.load(Ordering::Acquire),
        }
    }
}

/// Returns `true` when `current - last_measured >= threshold`, the gating
/// rule scheduled jobs use to decide whether a delta-gated launcher
/// (ontology annealing, epistemic re-measurement) should run (spec §4.2).
#[must_use]
pub fn exceeds_threshold(current: u64, last_measured: u64, threshold: u64) -> bool {
    current.saturating_sub(last_measured) >= threshold
}

// ---------------------------------------------------------------------------
// Job run metrics
// ---------------------------------------------------------------------------

/// Metrics captured for a single completed job run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobRunMetrics {
    /// The job this run corresponds to.
    pub job_id: String,
    /// Job type tag, e.g. `"ingestion"`.
    pub job_type: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Chunks processed (ingestion jobs only; `0` otherwise).
    pub chunks_processed: u64,
    /// Concepts newly created.
    pub concepts_created: u64,
    /// Relationship edges newly created.
    pub relationships_created: u64,
    /// Provider (LLM/embedding) errors encountered, including retried ones.
    pub provider_errors_count: u64,
    /// Retry attempts consumed across all provider calls in this run.
    pub retries_count: u64,
}

/// Aggregated statistics across multiple job runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetricsSummary {
    /// Number of runs recorded.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Median (p50) duration in milliseconds.
    pub p50_duration_ms: f64,
    /// 99th-percentile duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Total concepts created across all runs.
    pub total_concepts_created: u64,
    /// Total relationships created across all runs.
    pub total_relationships_created: u64,
    /// Provider error rate (`provider_errors_count` summed / runs).
    pub provider_error_rate: f64,
    /// Per-job-type run counts (deterministic ordering).
    pub job_type_counts: BTreeMap<String, usize>,
}

impl Default for JobMetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            total_concepts_created: 0,
            total_relationships_created: 0,
            provider_error_rate: 0.0,
            job_type_counts: BTreeMap::new(),
        }
    }
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector for job run metrics. Wrap in an [`Arc`] to share
/// across the worker pool.
#[derive(Debug, Clone, Default)]
pub struct JobMetricsCollector {
    inner: Arc<Mutex<Vec<JobRunMetrics>>>,
}

impl JobMetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed run's metrics.
    pub fn record(&self, metrics: JobRunMetrics) {
        self.inner.lock().expect("job metrics lock poisoned").push(metrics);
    }

    /// Return all recorded run metrics.
    #[must_use]
    pub fn runs(&self) -> Vec<JobRunMetrics> {
        self.inner.lock().expect("job metrics lock poisoned").clone()
    }

    /// Number of runs recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("job metrics lock poisoned").len()
    }

    /// Whether the collector has no recorded runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of all recorded runs.
    #[must_use]
    pub fn summary(&self) -> JobMetricsSummary {
        let data = self.inner.lock().expect("job metrics lock poisoned");
        if data.is_empty() {
            return JobMetricsSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let mean_duration_ms = durations.iter().sum::<u64>() as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);
        let p99_duration_ms = percentile(&durations, 99.0);

        let total_concepts_created = data.iter().map(|r| r.concepts_created).sum();
        let total_relationships_created = data.iter().map(|r| r.relationships_created).sum();
        let provider_errors: u64 = data.iter().map(|r| r.provider_errors_count).sum();
        let provider_error_rate = provider_errors as f64 / count as f64;

        let mut job_type_counts: BTreeMap<String, usize> = BTreeMap::new();
        for r in data.iter() {
            *job_type_counts.entry(r.job_type.clone()).or_insert(0) += 1;
        }

        JobMetricsSummary {
            count,
            mean_duration_ms,
            p50_duration_ms,
            p99_duration_ms,
            total_concepts_created,
            total_relationships_created,
            provider_error_rate,
            job_type_counts,
        }
    }

    /// Clear all recorded metrics.
    pub fn clear(&self) {
        self.inner.lock().expect("job metrics lock poisoned").clear();
    }
}

// ---------------------------------------------------------------------------
// Structured tracing helper
// ---------------------------------------------------------------------------

/// A structured log event, emitted via `tracing::info!` with a stable
/// target so log pipelines can filter on it independent of module path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event name, e.g. `"job.completed"`.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetryEvent {
    /// Create a new event with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attributes: BTreeMap::new() }
    }

    /// Attach an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit via `tracing::info!` under the `kg_telemetry` target.
    pub fn emit(&self) {
        info!(target: "kg_telemetry", name = %self.name, attributes = ?self.attributes, "telemetry event");
    }
}
