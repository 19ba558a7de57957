//! Completion state machine
//!
//! Pure, synchronous bookkeeping for one batch. The actor owns one
//! `CompletionState` and feeds it signals one at a time; the model checker
//! drives the very same `apply`.

use crate::batch::BatchId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Batch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BatchStatus {
    Initialized,
    /// Chunks are still being split or fanned out
    Enqueuing,
    /// Every chunk is settled; items are still being processed
    Running,
    Completed,
    Terminated,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Terminated)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchStatus::Initialized => "initialized",
            BatchStatus::Enqueuing => "enqueuing",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Signals accepted by a batch's tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackerSignal {
    Initialise {
        /// Informational; completion is driven by queued item counts
        expected_item_hint: u64,
    },
    /// A chunk was consumed: either split into `new_chunks` children or
    /// fanned out into `queued_items` item tasks
    FileProcessed {
        chunk: String,
        new_chunks: u64,
        queued_items: u64,
    },
    ItemProcessed {
        item_id: String,
    },
    Terminate,
}

impl TrackerSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerSignal::Initialise { .. } => "initialise",
            TrackerSignal::FileProcessed { .. } => "file_processed",
            TrackerSignal::ItemProcessed { .. } => "item_processed",
            TrackerSignal::Terminate => "terminate",
        }
    }

    /// Chunk name or item id the signal reports on
    pub fn subject(&self) -> Option<&str> {
        match self {
            TrackerSignal::FileProcessed { chunk, .. } => Some(chunk),
            TrackerSignal::ItemProcessed { item_id } => Some(item_id),
            TrackerSignal::Initialise { .. } | TrackerSignal::Terminate => None,
        }
    }
}

/// A status change caused by one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    pub from: BatchStatus,
    pub to: BatchStatus,
}

/// Result of applying one signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed; `transitions` lists status changes in order
    Applied { transitions: Vec<Transition> },
    /// Signal already reflected in the state
    Duplicate,
    /// Batch terminated; signal dropped
    Ignored,
    /// Applying would break a state invariant; state unchanged but counted
    Rejected(String),
}

impl ApplyOutcome {
    pub fn changed_state(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. } | ApplyOutcome::Rejected(_))
    }
}

/// Per-batch completion bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionState {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    /// Chunks written but not yet consumed
    pub files_remaining: i64,
    /// Cumulative items queued so far
    pub expected_item_count: u64,
    pub processed_item_count: u64,
    pub expected_item_hint: u64,
    /// Chunks whose `FileProcessed` has been applied
    pub settled_chunks: BTreeSet<String>,
    pub applied_signals: u64,
    pub rejected_signals: u64,
}

impl CompletionState {
    pub fn new(batch_id: BatchId) -> Self {
        CompletionState {
            batch_id,
            status: BatchStatus::Initialized,
            files_remaining: 0,
            expected_item_count: 0,
            processed_item_count: 0,
            expected_item_hint: 0,
            settled_chunks: BTreeSet::new(),
            applied_signals: 0,
            rejected_signals: 0,
        }
    }

    /// No chunk outstanding and every queued item processed
    pub fn all_work_done(&self) -> bool {
        self.files_remaining == 0 && self.processed_item_count == self.expected_item_count
    }

    pub fn apply(&mut self, signal: TrackerSignal) -> ApplyOutcome {
        let outcome = match signal {
            TrackerSignal::Initialise { expected_item_hint } => {
                self.apply_initialise(expected_item_hint)
            }
            TrackerSignal::FileProcessed {
                chunk,
                new_chunks,
                queued_items,
            } => self.apply_file_processed(chunk, new_chunks, queued_items),
            TrackerSignal::ItemProcessed { .. } => self.apply_item_processed(),
            TrackerSignal::Terminate => self.apply_terminate(),
        };

        match &outcome {
            ApplyOutcome::Applied { .. } => self.applied_signals += 1,
            ApplyOutcome::Rejected(_) => self.rejected_signals += 1,
            ApplyOutcome::Duplicate | ApplyOutcome::Ignored => {}
        }
        self.check_invariants();
        outcome
    }

    fn apply_initialise(&mut self, hint: u64) -> ApplyOutcome {
        if self.status != BatchStatus::Initialized {
            return ApplyOutcome::Duplicate;
        }
        self.files_remaining = 1;
        self.expected_item_hint = hint;
        let mut transitions = vec![self.transition_to(BatchStatus::Enqueuing)];
        transitions.extend(self.advance());
        ApplyOutcome::Applied { transitions }
    }

    fn apply_file_processed(
        &mut self,
        chunk: String,
        new_chunks: u64,
        queued_items: u64,
    ) -> ApplyOutcome {
        match self.status {
            BatchStatus::Initialized => {
                return ApplyOutcome::Rejected(format!(
                    "file {} processed before initialise",
                    chunk
                ))
            }
            BatchStatus::Terminated => return ApplyOutcome::Ignored,
            _ => {}
        }
        if self.settled_chunks.contains(&chunk) {
            return ApplyOutcome::Duplicate;
        }
        if self.status == BatchStatus::Completed {
            return ApplyOutcome::Rejected(format!("file {} processed after completion", chunk));
        }

        let files_after = self.files_remaining + new_chunks as i64 - 1;
        if files_after < 0 {
            return ApplyOutcome::Rejected(format!(
                "file {} would drive files_remaining to {}",
                chunk, files_after
            ));
        }

        self.files_remaining = files_after;
        self.expected_item_count += queued_items;
        self.settled_chunks.insert(chunk);
        ApplyOutcome::Applied {
            transitions: self.advance(),
        }
    }

    fn apply_item_processed(&mut self) -> ApplyOutcome {
        match self.status {
            BatchStatus::Initialized => {
                return ApplyOutcome::Rejected("item processed before initialise".to_string())
            }
            BatchStatus::Terminated => return ApplyOutcome::Ignored,
            _ => {}
        }
        if self.processed_item_count + 1 > self.expected_item_count {
            return ApplyOutcome::Rejected(format!(
                "processed count would exceed expected count {}",
                self.expected_item_count
            ));
        }

        self.processed_item_count += 1;
        ApplyOutcome::Applied {
            transitions: self.advance(),
        }
    }

    fn apply_terminate(&mut self) -> ApplyOutcome {
        if self.status.is_terminal() {
            return ApplyOutcome::Duplicate;
        }
        ApplyOutcome::Applied {
            transitions: vec![self.transition_to(BatchStatus::Terminated)],
        }
    }

    /// Completion is checked after every signal, whichever drove the last
    /// unmet condition.
    fn advance(&mut self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        if self.files_remaining == 0 && self.status == BatchStatus::Enqueuing {
            transitions.push(self.transition_to(BatchStatus::Running));
        }
        if self.status == BatchStatus::Running && self.all_work_done() {
            transitions.push(self.transition_to(BatchStatus::Completed));
        }
        transitions
    }

    fn transition_to(&mut self, to: BatchStatus) -> Transition {
        let from = self.status;
        debug_assert!(!from.is_terminal(), "transition out of terminal {}", from);
        self.status = to;
        Transition { from, to }
    }

    /// Verify state invariants (debug builds)
    #[inline]
    pub fn check_invariants(&self) {
        debug_assert!(
            self.files_remaining >= 0,
            "Invariant: files_remaining {} is negative",
            self.files_remaining
        );
        debug_assert!(
            self.processed_item_count <= self.expected_item_count,
            "Invariant: processed {} exceeds expected {}",
            self.processed_item_count,
            self.expected_item_count
        );
        debug_assert!(
            self.status != BatchStatus::Completed || self.all_work_done(),
            "Invariant: completed with files_remaining={} processed={} expected={}",
            self.files_remaining,
            self.processed_item_count,
            self.expected_item_count
        );
    }
}
