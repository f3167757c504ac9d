//! Injection point for relationships dropped by vocabulary enforcement
//! (spec §4.4 "a skipped-relationships log"). The daemon wires this to a
//! file or metrics counter; tests use [`NoopSink`] or a `Vec`-backed
//! collector.

use kg_clock::UtcTime;

/// A relationship dropped because its proposed type could not be resolved
/// to a canonical vocabulary entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRelationship {
    /// The type as extracted, not in the controlled vocabulary.
    pub proposed_type: String,
    /// Label of the source concept as extracted.
    pub from_label: String,
    /// Label of the target concept as extracted.
    pub to_label: String,
    /// The ingestion job this skip was observed during.
    pub job_id: String,
    /// When the skip was recorded.
    pub at: UtcTime,
}

/// Receives items a pipeline stage wants to log without owning storage
/// details itself.
pub trait Sink<T>: Send + Sync {
    /// Record one item.
    fn record(&self, item: T);
}

/// A sink that discards everything, for callers with nowhere to put skips.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl<T> Sink<T> for NoopSink {
    fn record(&self, _item: T) {}
}
