//! Durable completion-state persistence
//!
//! The tracker actor commits after every signal that changed its state. A
//! commit writes exactly one small object, whatever the batch size:
//!
//! - a settled chunk gets its own marker `_settled.{revision}.{chunk}`
//!   carrying the counters as of that signal;
//! - any other signal overwrites the counters object `_tracker.json`.
//!
//! Loading lists the batch namespace once. The settled set is the set of
//! marker names, and the counters come from whichever object carries the
//! highest revision. Neither name can ever collide with a chunk name.

use crate::batch::BatchId;
use crate::fanout::tracker::{BatchStatus, CompletionState};
use crate::storage::ChunkStore;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;

/// Object name holding a batch's latest counters
pub const TRACKER_STATE_OBJECT: &str = "_tracker.json";

/// Name prefix of per-chunk settle markers
pub const SETTLED_MARKER_PREFIX: &str = "_settled.";

/// Whether an object name in a batch namespace is a chunk (not tracker state)
pub fn is_chunk_name(name: &str) -> bool {
    !name.starts_with('_') && !name.starts_with('.')
}

/// Marker name for `chunk`, settled by the signal committed at `revision`
pub fn settled_marker_name(revision: u64, chunk: &str) -> String {
    format!("{}{:020}.{}", SETTLED_MARKER_PREFIX, revision, chunk)
}

/// Split a marker name into its revision and chunk name
fn parse_settled_marker(name: &str) -> Option<(u64, &str)> {
    let rest = name.strip_prefix(SETTLED_MARKER_PREFIX)?;
    let (revision, chunk) = rest.split_once('.')?;
    Some((revision.parse().ok()?, chunk))
}

/// Completion state persistence
pub trait TrackerStore: Send + Sync + 'static {
    /// Last committed state, or `None` if the batch never committed one
    fn load<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Option<CompletionState>>> + Send + 'a>>;

    /// Commit `state` as left by one signal. `settled` names the chunk that
    /// signal added to the settled set, if any.
    fn commit<'a>(
        &'a self,
        state: &'a CompletionState,
        settled: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;
}

/// Everything in a `CompletionState` except the settled chunk set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CommittedCounters {
    batch_id: BatchId,
    status: BatchStatus,
    files_remaining: i64,
    expected_item_count: u64,
    processed_item_count: u64,
    expected_item_hint: u64,
    applied_signals: u64,
    rejected_signals: u64,
}

impl CommittedCounters {
    fn of(state: &CompletionState) -> Self {
        CommittedCounters {
            batch_id: state.batch_id.clone(),
            status: state.status,
            files_remaining: state.files_remaining,
            expected_item_count: state.expected_item_count,
            processed_item_count: state.processed_item_count,
            expected_item_hint: state.expected_item_hint,
            applied_signals: state.applied_signals,
            rejected_signals: state.rejected_signals,
        }
    }

    /// Grows by one with every committed signal
    fn revision(&self) -> u64 {
        self.applied_signals + self.rejected_signals
    }

    fn into_state(self, settled_chunks: BTreeSet<String>) -> CompletionState {
        CompletionState {
            batch_id: self.batch_id,
            status: self.status,
            files_remaining: self.files_remaining,
            expected_item_count: self.expected_item_count,
            processed_item_count: self.processed_item_count,
            expected_item_hint: self.expected_item_hint,
            settled_chunks,
            applied_signals: self.applied_signals,
            rejected_signals: self.rejected_signals,
        }
    }
}

/// Tracker store backed by any chunk store
#[derive(Debug, Clone)]
pub struct BlobTrackerStore<S: ChunkStore> {
    store: S,
}

impl<S: ChunkStore> BlobTrackerStore<S> {
    pub fn new(store: S) -> Self {
        BlobTrackerStore { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    async fn read_counters(
        &self,
        batch_id: &BatchId,
        name: &str,
    ) -> IoResult<Option<CommittedCounters>> {
        let data = match self.store.read(batch_id, name).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let counters: CommittedCounters = serde_json::from_slice(&data)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        if &counters.batch_id != batch_id {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "tracker state for {} stored under {}",
                    counters.batch_id, batch_id
                ),
            ));
        }
        Ok(Some(counters))
    }
}

impl<S: ChunkStore> TrackerStore for BlobTrackerStore<S> {
    fn load<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Option<CompletionState>>> + Send + 'a>> {
        Box::pin(async move {
            let mut settled = BTreeSet::new();
            let mut latest_marker: Option<(u64, String)> = None;
            for name in self.store.list(batch_id).await? {
                if let Some((revision, chunk)) = parse_settled_marker(&name) {
                    settled.insert(chunk.to_string());
                    if latest_marker.as_ref().map_or(true, |(r, _)| revision > *r) {
                        latest_marker = Some((revision, name.clone()));
                    }
                }
            }

            let mut counters = self.read_counters(batch_id, TRACKER_STATE_OBJECT).await?;
            if let Some((_, name)) = latest_marker {
                let from_marker = self.read_counters(batch_id, &name).await?.ok_or_else(|| {
                    IoError::new(ErrorKind::NotFound, format!("settle marker {} vanished", name))
                })?;
                if counters
                    .as_ref()
                    .map_or(true, |c| from_marker.revision() > c.revision())
                {
                    counters = Some(from_marker);
                }
            }

            Ok(counters.map(|c| c.into_state(settled)))
        })
    }

    fn commit<'a>(
        &'a self,
        state: &'a CompletionState,
        settled: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let counters = CommittedCounters::of(state);
            let data = serde_json::to_vec(&counters)
                .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
            let name = match settled {
                Some(chunk) => settled_marker_name(counters.revision(), chunk),
                None => TRACKER_STATE_OBJECT.to_string(),
            };
            self.store
                .write(&state.batch_id, &name, Bytes::from(data))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::tracker::{ApplyOutcome, TrackerSignal};
    use crate::storage::InMemoryChunkStore;

    fn file(chunk: &str, new_chunks: u64, queued_items: u64) -> TrackerSignal {
        TrackerSignal::FileProcessed {
            chunk: chunk.to_string(),
            new_chunks,
            queued_items,
        }
    }

    /// Apply `signal` and commit the result the way the tracker actor does
    async fn apply_and_commit(
        store: &BlobTrackerStore<InMemoryChunkStore>,
        state: &mut CompletionState,
        signal: TrackerSignal,
    ) {
        let settled = match &signal {
            TrackerSignal::FileProcessed { chunk, .. } => Some(chunk.clone()),
            _ => None,
        };
        let outcome = state.apply(signal);
        assert!(outcome.changed_state(), "{:?}", outcome);
        let settled = match outcome {
            ApplyOutcome::Applied { .. } => settled,
            _ => None,
        };
        store.commit(state, settled.as_deref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = BlobTrackerStore::new(InMemoryChunkStore::new());
        assert!(store.load(&BatchId::from("b1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_then_load() {
        let store = BlobTrackerStore::new(InMemoryChunkStore::new());
        let batch = BatchId::from("b1");
        let mut state = CompletionState::new(batch.clone());

        apply_and_commit(
            &store,
            &mut state,
            TrackerSignal::Initialise {
                expected_item_hint: 0,
            },
        )
        .await;
        assert_eq!(store.load(&batch).await.unwrap().unwrap(), state);

        apply_and_commit(&store, &mut state, file("1.json", 2, 0)).await;
        apply_and_commit(&store, &mut state, file("1-0.json", 0, 2)).await;
        apply_and_commit(
            &store,
            &mut state,
            TrackerSignal::ItemProcessed {
                item_id: "a".to_string(),
            },
        )
        .await;
        // Latest counters come from a marker, not the counters object
        apply_and_commit(&store, &mut state, file("1-1.json", 0, 1)).await;

        let loaded = store.load(&batch).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.settled_chunks.len(), 3);
        assert_eq!(loaded.processed_item_count, 1);
        assert_eq!(loaded.expected_item_count, 3);
    }

    #[tokio::test]
    async fn test_item_commit_size_independent_of_settled_chunks() {
        let store = BlobTrackerStore::new(InMemoryChunkStore::new());
        let batch = BatchId::from("b1");
        let mut state = CompletionState::new(batch.clone());
        let leaves = 2000u64;

        apply_and_commit(
            &store,
            &mut state,
            TrackerSignal::Initialise {
                expected_item_hint: leaves,
            },
        )
        .await;
        apply_and_commit(&store, &mut state, file("1.json", leaves, 0)).await;
        for i in 0..leaves {
            apply_and_commit(&store, &mut state, file(&format!("1-{}.json", i), 0, 1)).await;
        }
        apply_and_commit(
            &store,
            &mut state,
            TrackerSignal::ItemProcessed {
                item_id: "0".to_string(),
            },
        )
        .await;

        let written = store
            .inner()
            .read(&batch, TRACKER_STATE_OBJECT)
            .await
            .unwrap();
        assert!(
            written.len() < 512,
            "item commit wrote {} bytes with {} settled chunks",
            written.len(),
            state.settled_chunks.len()
        );

        let loaded = store.load(&batch).await.unwrap().unwrap();
        assert_eq!(loaded.settled_chunks.len(), leaves as usize + 1);
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_marker_names() {
        let name = settled_marker_name(7, "1-0-1.json");
        assert!(!is_chunk_name(&name));
        assert_eq!(parse_settled_marker(&name), Some((7, "1-0-1.json")));
        assert_eq!(parse_settled_marker(TRACKER_STATE_OBJECT), None);
        assert_eq!(parse_settled_marker("_settled.x.1.json"), None);
    }

    #[test]
    fn test_state_object_is_not_a_chunk() {
        assert!(!is_chunk_name(TRACKER_STATE_OBJECT));
        assert!(is_chunk_name("1-0.json"));
    }
}
