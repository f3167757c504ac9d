//! Backoff/jitter retry policy, per-provider circuit breaker, and
//! concurrency limiter shared by the LLM and embedding clients (spec
//! §4.3 "Rate-limiting & concurrency", §5 "Shared resources").
//!
//! LLM and embedding providers are flaky in two different ways: transient
//! rate limits that a short backoff clears, and sustained outages that a
//! backoff only makes slower to discover. [`RetryPolicy`] handles the
//! former; [`CircuitBreaker`] handles the latter by giving up on a
//! provider for a cooldown window instead of retrying into a wall.
//! [`ProviderLimiter`] bounds in-flight requests per provider
//! (`max_concurrent_requests`), serialised to one for `ollama`-style
//! single-GPU backends and parallel for cloud providers.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kg_clock::{Clock, UtcTime};
use kg_error::KgError;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Configuration for exponential-backoff retry with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial attempt. `0`
    /// means only the initial attempt (no retries).
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap for exponential backoff, in milliseconds.
    pub max_delay_ms: u64,
    /// Overall wall-clock budget across all attempts, in milliseconds.
    pub overall_timeout_ms: u64,
    /// Jitter factor in `[0.0, 1.0]`. `0` = no jitter, `1` = full jitter.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            overall_timeout_ms: 60_000,
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

/// Record of a single failed attempt, kept for diagnostic context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// Error message from this attempt.
    pub error: String,
    /// Backoff delay applied before the next attempt.
    pub delay_ms: u64,
}

/// Metadata captured across all attempts of a [`retry`] call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Total number of attempts made (including the successful one, if any).
    pub total_attempts: u32,
    /// Records of each failed attempt.
    pub failed_attempts: Vec<RetryAttempt>,
}

/// Result of a retry-wrapped operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Metadata about attempts prior to success (empty if the first
    /// attempt succeeded).
    pub metadata: RetryMetadata,
}

/// Compute the backoff delay for a zero-indexed attempt number.
///
/// Jitter is derived from a counter seeded by the current time rather than
/// a dedicated RNG dependency: good enough to avoid thundering-herd retries
/// without pulling in `rand` for a single call site.
#[must_use]
pub fn compute_delay(policy: &RetryPolicy, attempt: u32, now: UtcTime) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = policy.base_delay_ms.saturating_mul(exp);
    let capped_ms = delay_ms.min(policy.max_delay_ms);

    let jitter_factor = policy.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor <= 0.0 || capped_ms == 0 {
        return Duration::from_millis(capped_ms);
    }

    let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
    if jitter_range == 0 {
        return Duration::from_millis(capped_ms);
    }
    let seed = now.as_chrono().timestamp_nanos_opt().unwrap_or(0) as u64;
    let pseudo = seed.wrapping_mul(attempt as u64 + 1).wrapping_add(attempt as u64);
    let jitter = pseudo % jitter_range;
    Duration::from_millis(capped_ms.saturating_sub(jitter))
}

/// Retry `op` up to `policy.max_retries + 1` times with exponential backoff
/// and jitter, stopping early when `op`'s error is not retryable (per
/// [`kg_error::ErrorCode::is_retryable`]) or the overall timeout elapses.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<RetryOutcome<T>, KgError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KgError>>,
{
    let start = clock.now();
    let max_attempts = policy.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        let elapsed = clock.now().seconds_since(start);
        if elapsed >= 0 && Duration::from_secs(elapsed as u64) >= policy.overall_timeout() {
            warn!(target: "kg_retry", attempt, "overall retry timeout exceeded");
            return Err(KgError::new(
                kg_error::ErrorCode::ProviderUnavailable,
                "retry budget exhausted before success",
            ));
        }

        match op().await {
            Ok(value) => {
                debug!(target: "kg_retry", attempt, "operation succeeded");
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                    },
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;
                if !err.code.is_retryable() {
                    debug!(target: "kg_retry", code = %err.code, "non-retryable error, giving up");
                    return Err(err);
                }
                if is_last {
                    warn!(target: "kg_retry", code = %err.code, attempt, "max retries exhausted");
                    return Err(err);
                }

                let delay = compute_delay(policy, attempt, clock.now());
                warn!(
                    target: "kg_retry",
                    code = %err.code,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable error, backing off"
                );
                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: err.message.clone(),
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(KgError::new(
        kg_error::ErrorCode::ProviderUnavailable,
        "retry budget exhausted",
    ))
}

/// Circuit-breaker state, observable for metrics/logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through normally.
    Closed,
    /// Requests are rejected without attempting the call.
    Open,
    /// A single probe request is allowed through to test recovery.
    HalfOpen,
}

/// Per-provider circuit breaker. Opens after `failure_threshold` consecutive
/// failures, rejects calls for `cooldown` afterwards, then allows a single
/// half-open probe; a probe success closes the circuit, a probe failure
/// reopens it.
///
/// Intentionally process-local (`AtomicU32`/`AtomicU64`, not a mutex over a
/// struct) so that `is_call_permitted`/`record_*` never block a worker
/// behind another worker's provider call.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at_epoch_ms: AtomicU64,
    half_open_probe_in_flight: std::sync::atomic::AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive
    /// failures and stays open for `cooldown` before allowing a probe.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicU64::new(0),
            half_open_probe_in_flight: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Current state given the current time.
    #[must_use]
    pub fn state(&self, now: UtcTime) -> CircuitState {
        let opened_at_ms = self.opened_at_epoch_ms.load(Ordering::Acquire);
        if opened_at_ms == 0 {
            return CircuitState::Closed;
        }
        let elapsed_ms = (now.seconds_since(UtcTime::epoch()) * 1000) - opened_at_ms as i64;
        if elapsed_ms >= self.cooldown.as_millis() as i64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Returns `true` if a call should be attempted right now. Claims the
    /// single half-open probe slot as a side effect, so callers that get
    /// `true` in the half-open state must report the outcome via
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn is_call_permitted(&self, now: UtcTime) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.half_open_probe_in_flight.swap(true, Ordering::AcqRel),
        }
    }

    /// Record a successful call, closing the circuit.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_epoch_ms.store(0, Ordering::Release);
        self.half_open_probe_in_flight.store(false, Ordering::Release);
    }

    /// Record a failed call. Opens the circuit once `failure_threshold`
    /// consecutive failures have accumulated.
    pub fn record_failure(&self, now: UtcTime) {
        self.half_open_probe_in_flight.store(false, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            let now_ms = now.seconds_since(UtcTime::epoch()) * 1000;
            self.opened_at_epoch_ms.store(now_ms as u64, Ordering::Release);
            warn!(target: "kg_retry", failures, "circuit breaker opened");
        }
    }
}

/// Bounds concurrent in-flight requests to a provider.
///
/// Sized from `max_concurrent_requests` (spec §4.3); set to `1` for
/// single-GPU backends like `ollama` to serialise requests, left higher for
/// cloud providers that handle genuine concurrency.
pub struct ProviderLimiter {
    semaphore: Arc<Semaphore>,
}

impl ProviderLimiter {
    /// Create a limiter allowing up to `max_concurrent` simultaneous calls.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Acquire a permit, waiting if the provider is already at capacity.
    ///
    /// # Panics
    /// Panics if the underlying semaphore has been closed, which this type
    /// never does.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("provider semaphore is never closed")
    }
}
