//! Per-batch completion tracker actor
//!
//! One actor per batch owns the batch's `CompletionState`. Signals arrive on
//! an unbounded FIFO mailbox and are applied strictly one at a time; every
//! state change is committed to the `TrackerStore` before the next message
//! is taken, so a restarted actor resumes from exactly what it applied.
//!
//! Actors are transient. Once its batch is terminal, or after its mailbox
//! has sat empty for `idle_timeout`, an actor asks to retire and exits. The
//! registry respawns it from committed state when the batch is addressed
//! again.
//!
//! ```text
//! Splitter ──┐
//! Processor ─┤──► mailbox ──► apply ──► persist ──► publish status / observer
//! Admin ─────┘
//! ```

use super::state::{ApplyOutcome, BatchStatus, CompletionState, TrackerSignal};
use super::BatchObserver;
use crate::batch::BatchId;
use crate::fanout::config::TrackerConfig;
use crate::storage::TrackerStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Messages for a tracker actor
pub enum TrackerMessage {
    /// Fire-and-forget signal
    Signal(TrackerSignal),
    /// Current committed state
    Snapshot {
        response_tx: oneshot::Sender<CompletionState>,
    },
    /// Discard in-memory state and reload the last committed state
    Restart,
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Asked by an actor that wants to exit. Returns true, after unregistering
/// the actor and closing its mailbox, only if the mailbox is empty.
pub type RetireCheck =
    Box<dyn Fn(&mut mpsc::UnboundedReceiver<TrackerMessage>) -> bool + Send + Sync>;

/// Actor owning one batch's completion state
pub struct TrackerActor {
    batch_id: BatchId,
    state: CompletionState,
    store: Arc<dyn TrackerStore>,
    observer: Arc<dyn BatchObserver>,
    config: TrackerConfig,
    rx: mpsc::UnboundedReceiver<TrackerMessage>,
    status_tx: watch::Sender<BatchStatus>,
    retire: RetireCheck,
}

impl TrackerActor {
    pub fn new(
        batch_id: BatchId,
        store: Arc<dyn TrackerStore>,
        observer: Arc<dyn BatchObserver>,
        config: TrackerConfig,
        rx: mpsc::UnboundedReceiver<TrackerMessage>,
        status_tx: watch::Sender<BatchStatus>,
        retire: RetireCheck,
    ) -> Self {
        TrackerActor {
            state: CompletionState::new(batch_id.clone()),
            batch_id,
            store,
            observer,
            config,
            rx,
            status_tx,
            retire,
        }
    }

    /// Run the actor loop
    pub async fn run(mut self) {
        self.state = self.load_committed().await;
        self.status_tx.send_replace(self.state.status);

        loop {
            let next = tokio::time::timeout(self.config.idle_timeout, self.rx.recv()).await;
            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => {
                    if (self.retire)(&mut self.rx) {
                        debug!(
                            batch = %self.batch_id,
                            status = %self.state.status,
                            "Idle tracker retired"
                        );
                        break;
                    }
                    continue;
                }
            };

            match msg {
                TrackerMessage::Signal(signal) => self.handle_signal(signal).await,
                TrackerMessage::Snapshot { response_tx } => {
                    let _ = response_tx.send(self.state.clone());
                }
                TrackerMessage::Restart => {
                    self.state = self.load_committed().await;
                    self.status_tx.send_replace(self.state.status);
                    info!(
                        batch = %self.batch_id,
                        status = %self.state.status,
                        applied = self.state.applied_signals,
                        "Tracker restarted from committed state"
                    );
                }
                TrackerMessage::Shutdown { response_tx } => {
                    debug!(batch = %self.batch_id, "Tracker shutting down");
                    let _ = response_tx.send(());
                    break;
                }
            }

            if self.state.status.is_terminal() && (self.retire)(&mut self.rx) {
                debug!(
                    batch = %self.batch_id,
                    status = %self.state.status,
                    "Finished tracker retired"
                );
                break;
            }
        }
    }

    async fn handle_signal(&mut self, signal: TrackerSignal) {
        let kind = signal.kind();
        let settles_chunk = matches!(signal, TrackerSignal::FileProcessed { .. });
        let owned_subject = signal.subject().map(str::to_owned);
        let outcome = self.state.apply(signal);

        let subject = owned_subject.as_deref();
        match &outcome {
            ApplyOutcome::Applied { .. } => {}
            ApplyOutcome::Duplicate => {
                debug!(batch = %self.batch_id, signal = kind, subject, "Duplicate signal ignored");
            }
            ApplyOutcome::Ignored => {
                debug!(
                    batch = %self.batch_id,
                    signal = kind,
                    subject,
                    "Signal for terminated batch dropped"
                );
            }
            ApplyOutcome::Rejected(reason) => {
                warn!(batch = %self.batch_id, signal = kind, subject, %reason, "Signal rejected");
            }
        }
        if !outcome.changed_state() {
            return;
        }

        // Only an applied file signal grows the settled set
        let settled = match outcome {
            ApplyOutcome::Applied { .. } if settles_chunk => subject,
            _ => None,
        };
        self.persist(settled).await;

        if let ApplyOutcome::Applied { transitions } = outcome {
            for transition in &transitions {
                self.status_tx.send_replace(transition.to);
                self.observer
                    .on_transition(&self.batch_id, transition, &self.state);
            }
        }
    }

    /// Commit the current state, retrying with capped backoff until it sticks
    async fn persist(&self, settled: Option<&str>) {
        let mut attempt = 0u32;
        loop {
            match self.store.commit(&self.state, settled).await {
                Ok(()) => return,
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        batch = %self.batch_id,
                        attempt,
                        error = %e,
                        "Tracker state persist failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn load_committed(&self) -> CompletionState {
        let mut attempt = 0u32;
        loop {
            match self.store.load(&self.batch_id).await {
                Ok(Some(state)) => {
                    state.check_invariants();
                    return state;
                }
                Ok(None) => return CompletionState::new(self.batch_id.clone()),
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        batch = %self.batch_id,
                        attempt,
                        error = %e,
                        "Tracker state load failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
