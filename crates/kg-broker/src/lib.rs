//! Single-writer-per-job progress broker (spec §4.6): holds the
//! last-emitted [`ProgressSnapshot`] per job and fans it out to SSE
//! subscribers, shaping it into the named events of spec §6.2
//! (`progress`, `completed`, `failed`, `error`, `keepalive`).
#![warn(missing_docs)]

use std::collections::HashMap;
use std::time::Duration;

use futures::Stream;
use kg_config::StreamingConfig;
use kg_core::{JobResult, ProgressSnapshot};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

/// One broker-emitted event, named after the SSE event names of spec §6.2.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A changed progress snapshot.
    Progress(ProgressSnapshot),
    /// Terminal success.
    Completed(JobResult),
    /// Terminal failure.
    Failed(String),
    /// A retrieval problem; does not by itself end the job.
    Error(String),
    /// Idle keepalive, sent every `sse_keepalive_seconds` while quiet.
    Keepalive,
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed(JobResult),
    Failed(String),
}

#[derive(Debug, Clone, Default)]
struct BrokerState {
    progress: Option<ProgressSnapshot>,
    terminal: Option<Terminal>,
}

/// Holds the last-emitted progress snapshot per `job_id` and fans it out to
/// subscribers over a `tokio::sync::watch` channel (single-writer,
/// multi-reader, last-value-wins — spec §4.6 wants "replace the last
/// snapshot", not an event log subscribers can lag behind, so a broadcast
/// channel would be the wrong tool here).
pub struct Broker {
    channels: RwLock<HashMap<String, watch::Sender<BrokerState>>>,
    config: StreamingConfig,
}

impl Broker {
    /// Build a broker using `config`'s keepalive/idle-timeout cadence.
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        Self { channels: RwLock::new(HashMap::new()), config }
    }

    async fn sender_for(&self, job_id: &str) -> watch::Sender<BrokerState> {
        let mut channels = self.channels.write().await;
        channels.entry(job_id.to_string()).or_insert_with(|| watch::channel(BrokerState::default()).0).clone()
    }

    /// Publish a progress snapshot for `job_id`. A snapshot that is not a
    /// monotonic successor of the one currently held is dropped rather than
    /// replacing it (spec §4.6 "Ordering": "late snapshots discovered out
    /// of order are dropped").
    pub async fn publish_progress(&self, job_id: &str, snapshot: ProgressSnapshot) {
        let tx = self.sender_for(job_id).await;
        tx.send_if_modified(|state| {
            if let Some(prior) = &state.progress {
                if !snapshot.is_monotonic_successor_of(prior) {
                    tracing::trace!(job_id, stage = %snapshot.stage, percent = snapshot.percent, "dropping out-of-order progress snapshot");
                    return false;
                }
            }
            state.progress = Some(snapshot.clone());
            true
        });
    }

    /// Publish terminal success; every open subscriber's stream emits one
    /// `completed` event and then closes.
    pub async fn publish_completed(&self, job_id: &str, result: JobResult) {
        let tx = self.sender_for(job_id).await;
        tx.send_modify(|state| state.terminal = Some(Terminal::Completed(result)));
    }

    /// Publish terminal failure; every open subscriber's stream emits one
    /// `failed` event and then closes.
    pub async fn publish_failed(&self, job_id: &str, message: impl Into<String>) {
        let tx = self.sender_for(job_id).await;
        tx.send_modify(|state| state.terminal = Some(Terminal::Failed(message.into())));
    }

    /// Drop the channel for `job_id`. Called once a terminal job's result
    /// has been durably recorded and its stream has had a chance to
    /// observe the terminal event; holding the channel open longer than
    /// that only wastes memory.
    pub async fn retire(&self, job_id: &str) {
        self.channels.write().await.remove(job_id);
    }

    /// Open a subscription to `job_id`'s progress stream. The channel is
    /// created on first touch (by either a writer or a subscriber), so a
    /// subscriber that arrives before the worker has reported anything
    /// still gets a stream, just one that starts quiet.
    pub async fn subscribe(&self, job_id: &str) -> BrokerSubscription {
        let rx = self.sender_for(job_id).await.subscribe();
        BrokerSubscription {
            rx,
            last_progress: None,
            ended: false,
            last_activity: Instant::now(),
            keepalive: Duration::from_secs(u64::from(self.config.sse_keepalive_seconds)),
            idle_timeout: Duration::from_secs(u64::from(self.config.sse_idle_timeout_seconds)),
        }
    }
}

/// A live subscription to one job's progress stream. Consume it with
/// [`BrokerSubscription::into_stream`].
pub struct BrokerSubscription {
    rx: watch::Receiver<BrokerState>,
    last_progress: Option<ProgressSnapshot>,
    ended: bool,
    last_activity: Instant,
    keepalive: Duration,
    idle_timeout: Duration,
}

impl BrokerSubscription {
    /// Turn the subscription into a stream of dedup'd, ordered
    /// [`BrokerEvent`]s. The stream ends after a terminal event, after the
    /// writer's channel is dropped (job retired), or after
    /// `sse_idle_timeout_seconds` of silence (spec §4.6) — in the last case
    /// readers are expected to reconnect and resume from `GET
    /// /jobs/{job_id}`.
    pub fn into_stream(self) -> impl Stream<Item = BrokerEvent> {
        futures::stream::unfold(self, |mut state| async move {
            loop {
                if state.ended {
                    return None;
                }
                tokio::select! {
                    changed = state.rx.changed() => {
                        match changed {
                            Ok(()) => {
                                let snapshot = state.rx.borrow_and_update().clone();
                                state.last_activity = Instant::now();
                                if let Some(terminal) = snapshot.terminal {
                                    state.ended = true;
                                    let event = match terminal {
                                        Terminal::Completed(result) => BrokerEvent::Completed(result),
                                        Terminal::Failed(message) => BrokerEvent::Failed(message),
                                    };
                                    return Some((event, state));
                                }
                                if let Some(progress) = snapshot.progress {
                                    if state.last_progress.as_ref() != Some(&progress) {
                                        state.last_progress = Some(progress.clone());
                                        return Some((BrokerEvent::Progress(progress), state));
                                    }
                                }
                                // Same snapshot re-sent (e.g. a writer woke the
                                // channel without changing anything); keep waiting.
                            }
                            Err(_closed) => {
                                state.ended = true;
                                return Some((BrokerEvent::Error("progress channel closed".to_string()), state));
                            }
                        }
                    }
                    () = tokio::time::sleep(state.keepalive) => {
                        if state.last_activity.elapsed() >= state.idle_timeout {
                            state.ended = true;
                            return None;
                        }
                        return Some((BrokerEvent::Keepalive, state));
                    }
                }
            }
        })
    }
}
