//! UTC time source and opaque ID generation for the knowledge graph control plane.
//!
//! Every persisted timestamp in this system flows through [`UtcTime`] so that
//! naive/aware confusion is a compile error rather than a runtime bug. Callers
//! needing a controllable clock in tests should depend on the [`Clock`] trait
//! instead of calling [`chrono::Utc::now`] directly.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A UTC timestamp. The only timestamp type used anywhere in this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtcTime(DateTime<Utc>);

impl UtcTime {
    /// Wrap an existing `DateTime<Utc>`.
    #[must_use]
    pub fn new(inner: DateTime<Utc>) -> Self {
        Self(inner)
    }

    /// The Unix epoch, useful as a sentinel "never" value.
    #[must_use]
    pub fn epoch() -> Self {
        Self(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Return this timestamp plus `duration`.
    #[must_use]
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }

    /// Return the number of seconds between `self` and `other` (`self - other`).
    #[must_use]
    pub fn seconds_since(&self, other: Self) -> i64 {
        (self.0 - other.0).num_seconds()
    }

    /// Render as RFC 3339 (e.g. `2026-07-28T12:00:00Z`).
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Borrow the underlying `chrono` value for interop with external crates
    /// (e.g. the graph facade's wire format).
    #[must_use]
    pub fn as_chrono(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for UtcTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

/// Source of the current time. Production code takes `Arc<dyn Clock>` so that
/// tests can substitute [`FixedClock`] and assert on exact timestamps instead
/// of tolerating skew.
pub trait Clock: Send + Sync {
    /// Return the current UTC time.
    fn now(&self) -> UtcTime;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcTime {
        UtcTime(Utc::now())
    }
}

/// A clock that returns a fixed (but externally advanceable) time.
///
/// Intended for deterministic tests of retention sweeps, `expires_at`
/// handling, and scheduled-job cron ticks.
pub struct FixedClock {
    current: Mutex<UtcTime>,
}

impl FixedClock {
    /// Create a clock starting at `start`.
    #[must_use]
    pub fn new(start: UtcTime) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut guard = self.current.lock().expect("fixed clock mutex poisoned");
        *guard = guard.plus(duration);
    }

    /// Set the clock to an arbitrary point in time.
    pub fn set(&self, time: UtcTime) {
        *self.current.lock().expect("fixed clock mutex poisoned") = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> UtcTime {
        *self.current.lock().expect("fixed clock mutex poisoned")
    }
}

/// The kind of entity an opaque ID was generated for. Used only to choose a
/// human-legible prefix; it carries no semantic weight once generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// A [`Job`](https://docs.rs/kg-core) record.
    Job,
    /// An artifact record.
    Artifact,
    /// An authenticated session / access token.
    Session,
    /// An HTTP request, for correlation in logs.
    Request,
    /// A query definition.
    QueryDefinition,
    /// A checkpoint snapshot taken by the checkpoint guard.
    Checkpoint,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Artifact => "artifact",
            Self::Session => "session",
            Self::Request => "req",
            Self::QueryDefinition => "qdef",
            Self::Checkpoint => "ckpt",
        }
    }
}

/// Generate a new opaque ID of the given kind, e.g. `job_3fa2…`.
#[must_use]
pub fn new_id(kind: IdKind) -> String {
    format!("{}_{}", kind.prefix(), Uuid::new_v4())
}

/// Reserved user ID for the system principal (never logs in).
pub const SYSTEM_USER_ID: i64 = 1;

/// Reserved user ID attributed to unauthenticated (`public`-group) callers.
/// Distinct from [`SYSTEM_USER_ID`] so anonymous activity is never
/// mistaken for genuine system-originated activity.
pub const PUBLIC_USER_ID: i64 = 2;

/// Reserved user ID for the initial administrator account seeded at migration time.
pub const INITIAL_ADMIN_USER_ID: i64 = 1000;

/// Reserved group ID for the implicit `public` group every authenticated user belongs to.
pub const PUBLIC_GROUP_ID: i64 = 1;

/// Reserved group ID for the built-in `admins` group.
pub const ADMINS_GROUP_ID: i64 = 2;

/// Upper bound (inclusive) of the user-ID range reserved for system principals.
pub const MAX_RESERVED_USER_ID: i64 = 999;

/// Returns `true` if `user_id` falls in the reserved system-principal range (1-999).
#[must_use]
pub fn is_reserved_user_id(user_id: i64) -> bool {
    (1..=MAX_RESERVED_USER_ID).contains(&user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_deterministically() {
        let clock = FixedClock::new(UtcTime::epoch());
        assert_eq!(clock.now(), UtcTime::epoch());
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now().seconds_since(UtcTime::epoch()), 30);
    }

    #[test]
    fn ids_carry_a_legible_prefix_and_are_unique() {
        let a = new_id(IdKind::Job);
        let b = new_id(IdKind::Job);
        assert!(a.starts_with("job_"));
        assert_ne!(a, b);
    }

    #[test]
    fn reserved_user_ids_are_bounded() {
        assert!(is_reserved_user_id(SYSTEM_USER_ID));
        assert!(is_reserved_user_id(MAX_RESERVED_USER_ID));
        assert!(!is_reserved_user_id(1000));
        assert!(!is_reserved_user_id(0));
    }

    #[test]
    fn system_and_public_user_ids_are_distinct() {
        assert_ne!(SYSTEM_USER_ID, PUBLIC_USER_ID);
        assert!(is_reserved_user_id(PUBLIC_USER_ID));
    }

    #[test]
    fn utc_time_serializes_transparently() {
        let t = UtcTime::epoch();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"1970-01-01T00:00:00Z\"");
    }
}
