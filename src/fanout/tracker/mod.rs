//! Completion Tracker
//!
//! Aggregates the asynchronous, out-of-order signals of splitters and item
//! processors into one completion decision per batch. Each batch gets its own
//! actor (see [`actor`]); actors for different batches run in parallel, and
//! all mutation of one batch's counters happens sequentially inside its actor.
//! No locks or CAS loops guard the counters.
//!
//! Callers address a batch through the [`TrackerRegistry`], which spawns the
//! actor on demand and forgets it once it retires. Signals are
//! fire-and-forget; status changes can be awaited through a `watch` channel
//! instead of polling.

pub mod actor;
pub mod state;

pub use actor::{RetireCheck, TrackerActor, TrackerMessage};
pub use state::{ApplyOutcome, BatchStatus, CompletionState, TrackerSignal, Transition};

use crate::batch::{BatchId, ChunkRef};
use crate::fanout::config::TrackerConfig;
use crate::fanout::error::{FanoutError, FanoutResult};
use crate::storage::TrackerStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

/// Receives every batch status transition, after it is committed
pub trait BatchObserver: Send + Sync + 'static {
    fn on_transition(&self, batch_id: &BatchId, transition: &Transition, state: &CompletionState);
}

/// Default observer: log each transition
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl BatchObserver for LoggingObserver {
    fn on_transition(&self, batch_id: &BatchId, transition: &Transition, state: &CompletionState) {
        info!(
            batch = %batch_id,
            from = %transition.from,
            to = %transition.to,
            files_remaining = state.files_remaining,
            expected = state.expected_item_count,
            processed = state.processed_item_count,
            "Batch status changed"
        );
    }
}

/// Registry entry for one live actor
struct ActorSlot {
    /// Distinguishes this actor from earlier and later ones for the batch
    generation: u64,
    tx: mpsc::UnboundedSender<TrackerMessage>,
    status_rx: watch::Receiver<BatchStatus>,
}

struct RegistryInner {
    trackers: Mutex<RegistryState>,
    store: Arc<dyn TrackerStore>,
    observer: Arc<dyn BatchObserver>,
    config: TrackerConfig,
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<BatchId, ActorSlot>,
    next_generation: u64,
    closed: bool,
}

impl RegistryInner {
    /// Retirement request from the actor of `generation`. Runs under the
    /// registry lock, which message delivery also holds, so no message can
    /// slip into the mailbox between the emptiness check and the close.
    fn retire(
        &self,
        batch_id: &BatchId,
        generation: u64,
        rx: &mut mpsc::UnboundedReceiver<TrackerMessage>,
    ) -> bool {
        let mut trackers = self.trackers.lock();
        if !rx.is_empty() {
            return false;
        }
        let registered = trackers
            .slots
            .get(batch_id)
            .map_or(false, |slot| slot.generation == generation);
        if registered {
            trackers.slots.remove(batch_id);
        }
        rx.close();
        true
    }
}

/// Addresses tracker actors by batch id, spawning them on demand
///
/// Only batches with a live actor hold registry memory. Actors retire once
/// their batch is terminal or idle, and are respawned from the tracker store
/// the next time their batch is addressed.
#[derive(Clone)]
pub struct TrackerRegistry {
    inner: Arc<RegistryInner>,
}

impl TrackerRegistry {
    pub fn new(store: Arc<dyn TrackerStore>, config: TrackerConfig) -> Self {
        Self::with_observer(store, config, Arc::new(LoggingObserver))
    }

    pub fn with_observer(
        store: Arc<dyn TrackerStore>,
        config: TrackerConfig,
        observer: Arc<dyn BatchObserver>,
    ) -> Self {
        TrackerRegistry {
            inner: Arc::new(RegistryInner {
                trackers: Mutex::new(RegistryState::default()),
                store,
                observer,
                config,
            }),
        }
    }

    /// The batch's live actor, spawning one (from committed state) if needed
    fn slot<'a>(
        &self,
        trackers: &'a mut RegistryState,
        batch_id: &BatchId,
    ) -> FanoutResult<&'a ActorSlot> {
        let live = trackers
            .slots
            .get(batch_id)
            .map_or(false, |slot| !slot.tx.is_closed());
        if !live {
            if trackers.closed {
                return Err(FanoutError::TrackerUnavailable(batch_id.clone()));
            }
            let slot = self.spawn(batch_id, trackers.next_generation);
            trackers.next_generation += 1;
            trackers.slots.insert(batch_id.clone(), slot);
        }
        trackers
            .slots
            .get(batch_id)
            .ok_or_else(|| FanoutError::TrackerUnavailable(batch_id.clone()))
    }

    fn spawn(&self, batch_id: &BatchId, generation: u64) -> ActorSlot {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BatchStatus::Initialized);

        let registry = Arc::downgrade(&self.inner);
        let retiring = batch_id.clone();
        let retire: RetireCheck = Box::new(
            move |rx: &mut mpsc::UnboundedReceiver<TrackerMessage>| match registry.upgrade() {
                Some(inner) => inner.retire(&retiring, generation, rx),
                None => true,
            },
        );

        let actor = TrackerActor::new(
            batch_id.clone(),
            self.inner.store.clone(),
            self.inner.observer.clone(),
            self.inner.config.clone(),
            rx,
            status_tx,
            retire,
        );
        tokio::spawn(actor.run());

        ActorSlot {
            generation,
            tx,
            status_rx,
        }
    }

    /// Deliver `msg` to the batch's actor, respawning it if it just retired
    fn send(&self, batch_id: &BatchId, msg: TrackerMessage) -> FanoutResult<()> {
        let mut trackers = self.inner.trackers.lock();
        let sent = self.slot(&mut trackers, batch_id)?.tx.send(msg);
        match sent {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                trackers.slots.remove(batch_id);
                self.slot(&mut trackers, batch_id)?
                    .tx
                    .send(msg)
                    .map_err(|_| FanoutError::TrackerUnavailable(batch_id.clone()))
            }
        }
    }

    /// Fire-and-forget: fails only if the registry is shut down
    pub fn signal(&self, batch_id: &BatchId, signal: TrackerSignal) -> FanoutResult<()> {
        self.send(batch_id, TrackerMessage::Signal(signal))
    }

    pub fn initialise(&self, batch_id: &BatchId, expected_item_hint: u64) -> FanoutResult<()> {
        self.signal(batch_id, TrackerSignal::Initialise { expected_item_hint })
    }

    pub fn file_processed(
        &self,
        chunk: &ChunkRef,
        new_chunks: u64,
        queued_items: u64,
    ) -> FanoutResult<()> {
        self.signal(
            &chunk.batch_id,
            TrackerSignal::FileProcessed {
                chunk: chunk.name.clone(),
                new_chunks,
                queued_items,
            },
        )
    }

    pub fn item_processed(&self, batch_id: &BatchId, item_id: &str) -> FanoutResult<()> {
        self.signal(
            batch_id,
            TrackerSignal::ItemProcessed {
                item_id: item_id.to_string(),
            },
        )
    }

    /// Administrative stop: the batch moves to `Terminated` and ignores
    /// further signals
    pub fn terminate(&self, batch_id: &BatchId) -> FanoutResult<()> {
        self.signal(batch_id, TrackerSignal::Terminate)
    }

    /// State after every signal sent before this call
    pub async fn snapshot(&self, batch_id: &BatchId) -> FanoutResult<CompletionState> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(batch_id, TrackerMessage::Snapshot { response_tx })?;
        response_rx
            .await
            .map_err(|_| FanoutError::TrackerUnavailable(batch_id.clone()))
    }

    pub async fn status(&self, batch_id: &BatchId) -> FanoutResult<BatchStatus> {
        Ok(self.snapshot(batch_id).await?.status)
    }

    /// Status updates of the batch's current actor. The channel closes when
    /// that actor retires; [`wait_for_status`](Self::wait_for_status)
    /// resubscribes transparently.
    pub fn subscribe(&self, batch_id: &BatchId) -> FanoutResult<watch::Receiver<BatchStatus>> {
        let mut trackers = self.inner.trackers.lock();
        let status_rx = self.slot(&mut trackers, batch_id)?.status_rx.clone();
        Ok(status_rx)
    }

    /// Wait until the batch reaches `target` or a terminal status
    pub async fn wait_for_status(
        &self,
        batch_id: &BatchId,
        target: BatchStatus,
    ) -> FanoutResult<BatchStatus> {
        loop {
            let mut rx = self.subscribe(batch_id)?;
            if let Ok(status) = rx.wait_for(|s| *s == target || s.is_terminal()).await {
                return Ok(*status);
            };
            // The actor retired while idle; its successor reloads the state
        }
    }

    /// Make the batch's actor drop its in-memory state and reload
    pub fn restart(&self, batch_id: &BatchId) -> FanoutResult<()> {
        self.send(batch_id, TrackerMessage::Restart)
    }

    /// Batches with a live actor, sorted
    pub fn batches(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.inner.trackers.lock().slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every actor, waiting for each to finish its current message.
    /// Later calls for any batch fail.
    pub async fn shutdown(&self) {
        let slots: Vec<ActorSlot> = {
            let mut trackers = self.inner.trackers.lock();
            trackers.closed = true;
            trackers.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let (response_tx, response_rx) = oneshot::channel();
            if slot.tx.send(TrackerMessage::Shutdown { response_tx }).is_ok() {
                let _ = response_rx.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::storage::{
        BlobTrackerStore, ChunkStore, InMemoryChunkStore, SimulatedChunkStore,
        SimulatedChunkStoreConfig, TRACKER_STATE_OBJECT,
    };
    use std::time::Duration;

    /// Records every transition it sees
    #[derive(Default)]
    struct RecordingObserver {
        transitions: Mutex<Vec<(BatchId, Transition)>>,
    }

    impl BatchObserver for RecordingObserver {
        fn on_transition(&self, batch_id: &BatchId, transition: &Transition, _: &CompletionState) {
            self.transitions.lock().push((batch_id.clone(), *transition));
        }
    }

    fn registry() -> (TrackerRegistry, InMemoryChunkStore, Arc<RecordingObserver>) {
        let backing = InMemoryChunkStore::new();
        let observer = Arc::new(RecordingObserver::default());
        let registry = TrackerRegistry::with_observer(
            Arc::new(BlobTrackerStore::new(backing.clone())),
            TrackerConfig::test(),
            observer.clone(),
        );
        (registry, backing, observer)
    }

    fn chunk(batch: &BatchId, name: &str) -> ChunkRef {
        ChunkRef::new(batch.clone(), name)
    }

    #[tokio::test]
    async fn test_signals_complete_batch() {
        let (registry, _, observer) = registry();
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 0, 3).unwrap();
        for i in 0..3 {
            registry.item_processed(&batch, &i.to_string()).unwrap();
        }

        let status = registry
            .wait_for_status(&batch, BatchStatus::Completed)
            .await
            .unwrap();
        assert_eq!(status, BatchStatus::Completed);

        let completed = observer
            .transitions
            .lock()
            .iter()
            .filter(|(_, t)| t.to == BatchStatus::Completed)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_signals_never_break_invariants() {
        let (registry, _, _) = registry();
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 2, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1-0.json"), 0, 100).unwrap();
        registry.file_processed(&chunk(&batch, "1-1.json"), 0, 100).unwrap();

        let mut tasks = Vec::new();
        for worker in 0..20 {
            let registry = registry.clone();
            let batch = batch.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    registry
                        .item_processed(&batch, &format!("{}-{}", worker, i))
                        .unwrap();
                }
            }));
        }
        futures::future::join_all(tasks).await;

        registry
            .wait_for_status(&batch, BatchStatus::Completed)
            .await
            .unwrap();
        let state = registry.snapshot(&batch).await.unwrap();
        assert_eq!(state.processed_item_count, 200);
        assert_eq!(state.expected_item_count, 200);
        assert_eq!(state.files_remaining, 0);
        assert_eq!(state.rejected_signals, 0);
    }

    #[tokio::test]
    async fn test_independent_batches() {
        let (registry, _, _) = registry();
        let a = BatchId::from("a");
        let b = BatchId::from("b");

        registry.initialise(&a, 0).unwrap();
        registry.initialise(&b, 0).unwrap();
        registry.file_processed(&chunk(&a, "1.json"), 0, 0).unwrap();

        assert_eq!(
            registry.wait_for_status(&a, BatchStatus::Completed).await.unwrap(),
            BatchStatus::Completed
        );
        let snapshot = registry.snapshot(&b).await.unwrap();
        assert_eq!(snapshot.status, BatchStatus::Enqueuing);
        assert_eq!(registry.snapshot(&a).await.unwrap().status, BatchStatus::Completed);
    }

    async fn wait_until_no_live_actors(registry: &TrackerRegistry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.batches().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("live actors remain: {:?}", registry.batches()));
    }

    #[tokio::test]
    async fn test_finished_and_idle_actors_retire() {
        let (registry, _, observer) = registry();
        let batches: Vec<BatchId> = (0..200)
            .map(|i| BatchId::from(format!("b{}", i)))
            .collect();

        for batch in &batches {
            registry.initialise(batch, 0).unwrap();
            registry.file_processed(&chunk(batch, "1.json"), 0, 1).unwrap();
            registry.item_processed(batch, "only").unwrap();
        }
        // Never initialised: the signal is rejected and the actor idles out
        let unknown = BatchId::from("unknown");
        registry.item_processed(&unknown, "stray").unwrap();

        wait_until_no_live_actors(&registry).await;

        // Retired batches answer from committed state
        let state = registry.snapshot(&batches[0]).await.unwrap();
        assert_eq!(state.status, BatchStatus::Completed);
        assert_eq!(state.processed_item_count, 1);
        assert_eq!(
            registry.wait_for_status(&batches[7], BatchStatus::Completed).await.unwrap(),
            BatchStatus::Completed
        );

        // A redelivered file signal is still recognised after respawn
        registry.file_processed(&chunk(&batches[1], "1.json"), 0, 1).unwrap();
        let state = registry.snapshot(&batches[1]).await.unwrap();
        assert_eq!(state.rejected_signals, 0);
        assert_eq!(state.expected_item_count, 1);

        let unknown_state = registry.snapshot(&unknown).await.unwrap();
        assert_eq!(unknown_state.status, BatchStatus::Initialized);
        assert_eq!(unknown_state.rejected_signals, 1);

        // Respawning never replays a transition
        let completed = observer
            .transitions
            .lock()
            .iter()
            .filter(|(_, t)| t.to == BatchStatus::Completed)
            .count();
        assert_eq!(completed, batches.len());
    }

    #[tokio::test]
    async fn test_waiter_survives_idle_retirement() {
        let (registry, _, _) = registry();
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 0, 2).unwrap();
        registry.item_processed(&batch, "a").unwrap();

        let waiter = {
            let registry = registry.clone();
            let batch = batch.clone();
            tokio::spawn(async move {
                registry
                    .wait_for_status(&batch, BatchStatus::Completed)
                    .await
            })
        };
        // Longer than the idle timeout, so the actor retires at least once
        tokio::time::sleep(Duration::from_millis(300)).await;
        registry.item_processed(&batch, "b").unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(registry.snapshot(&batch).await.unwrap().processed_item_count, 2);
    }

    #[tokio::test]
    async fn test_item_commits_do_not_rewrite_settled_chunks() {
        let (registry, backing, _) = registry();
        let batch = BatchId::from("b1");
        let leaves = 500u64;

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), leaves, 0).unwrap();
        for i in 0..leaves {
            registry
                .file_processed(&chunk(&batch, &format!("1-{}.json", i)), 0, 1)
                .unwrap();
        }
        registry.item_processed(&batch, "0").unwrap();

        let state = registry.snapshot(&batch).await.unwrap();
        assert_eq!(state.settled_chunks.len(), leaves as usize + 1);
        assert_eq!(state.processed_item_count, 1);

        let counters = backing.read(&batch, TRACKER_STATE_OBJECT).await.unwrap();
        assert!(
            counters.len() < 512,
            "item commit wrote {} bytes",
            counters.len()
        );
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let (registry, _, _) = registry();
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 0, 2).unwrap();
        registry.item_processed(&batch, "x").unwrap();
        registry.restart(&batch).unwrap();

        // A repeated file signal after restart is still recognised
        registry.file_processed(&chunk(&batch, "1.json"), 0, 2).unwrap();
        let state = registry.snapshot(&batch).await.unwrap();
        assert_eq!(state.expected_item_count, 2);
        assert_eq!(state.processed_item_count, 1);
        assert_eq!(state.status, BatchStatus::Running);
    }

    #[tokio::test]
    async fn test_new_registry_resumes_from_store() {
        let (registry, backing, _) = registry();
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 0, 1).unwrap();
        registry.snapshot(&batch).await.unwrap();
        registry.shutdown().await;

        let resumed = TrackerRegistry::new(
            Arc::new(BlobTrackerStore::new(backing)),
            TrackerConfig::test(),
        );
        resumed.item_processed(&batch, "only").unwrap();
        assert_eq!(
            resumed.wait_for_status(&batch, BatchStatus::Completed).await.unwrap(),
            BatchStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_persist_retries_through_store_failures() {
        let flaky = SimulatedChunkStore::new(
            InMemoryChunkStore::new(),
            SimulatedRng::new(11),
            SimulatedChunkStoreConfig {
                put_fail_prob: 0.5,
                get_fail_prob: 0.5,
                ..SimulatedChunkStoreConfig::no_faults()
            },
        );
        let registry = TrackerRegistry::new(
            Arc::new(BlobTrackerStore::new(flaky)),
            TrackerConfig::test(),
        );
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 0, 5).unwrap();
        for i in 0..5 {
            registry.item_processed(&batch, &i.to_string()).unwrap();
        }
        registry.restart(&batch).unwrap();

        let status = tokio::time::timeout(
            Duration::from_secs(10),
            registry.wait_for_status(&batch, BatchStatus::Completed),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminate_stops_progress() {
        let (registry, _, observer) = registry();
        let batch = BatchId::from("b1");

        registry.initialise(&batch, 0).unwrap();
        registry.file_processed(&chunk(&batch, "1.json"), 0, 1).unwrap();
        registry.terminate(&batch).unwrap();
        registry.item_processed(&batch, "late").unwrap();

        assert_eq!(
            registry.wait_for_status(&batch, BatchStatus::Completed).await.unwrap(),
            BatchStatus::Terminated
        );
        let state = registry.snapshot(&batch).await.unwrap();
        assert_eq!(state.processed_item_count, 0);
        assert!(observer
            .transitions
            .lock()
            .iter()
            .all(|(_, t)| t.to != BatchStatus::Completed));
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_new_batches() {
        let (registry, _, _) = registry();
        registry.shutdown().await;
        assert!(matches!(
            registry.initialise(&BatchId::from("late"), 0),
            Err(FanoutError::TrackerUnavailable(_))
        ));
    }
}
