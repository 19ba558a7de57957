//! Deterministic Simulation Testing for the fan-out engine
//!
//! Runs a whole batch through the engine with every collaborator wrapped in
//! its fault-injecting simulation: chunk store and tracker state (failed,
//! ambiguous and corrupted I/O), record store (failed and ambiguous creates),
//! both queues (failed enqueues, duplicate deliveries, reordering, lost acks),
//! a flaky item handler, and random tracker restarts.
//!
//! ## Key Invariants
//!
//! 1. The batch reaches `Completed` exactly once
//! 2. `files_remaining == 0` and `processed == expected == items`
//! 3. Every chunk of the split plan was settled exactly once
//! 4. Every item has a record with `processed = true`
//! 5. No tracker signal was rejected
//! 6. Nothing is dead-lettered except a creator that lost its flip to a
//!    concurrent duplicate delivery (its item is still processed)

use crate::batch::BatchId;
use crate::buggify::faults;
use crate::fanout::config::{FanoutConfig, QueueConfig, TrackerConfig, WorkerConfig};
use crate::fanout::engine::{EngineComponents, FanoutEngine};
use crate::fanout::error::FanoutResult;
use crate::fanout::processor::{HandlerError, ItemHandler};
use crate::fanout::splitter::SplitPlan;
use crate::fanout::tracker::{BatchObserver, BatchStatus, CompletionState, Transition};
use crate::io::simulation::SimulatedRng;
use crate::queue::{DeadLetter, InMemoryWorkQueue, SimulatedQueueConfig, SimulatedWorkQueue};
use crate::storage::{
    is_chunk_name, BlobTrackerStore, ChunkStore, InMemoryChunkStore, InMemoryRecordStore,
    SimulatedChunkStore, SimulatedChunkStoreConfig, SimulatedRecordStore,
    SimulatedRecordStoreConfig,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reason prefix of a dead letter left by a creator that lost its flip
const LOST_FLIP_PREFIX: &str = "Fatal consistency violation";

/// Configuration for fan-out DST
#[derive(Debug, Clone)]
pub struct FanoutDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Items in the batch
    pub items: usize,
    pub split_threshold: usize,
    pub workers: WorkerConfig,
    pub chunk_store: SimulatedChunkStoreConfig,
    pub tracker_store: SimulatedChunkStoreConfig,
    pub record_store: SimulatedRecordStoreConfig,
    pub queue: SimulatedQueueConfig,
    /// Probability that one handler invocation fails
    pub handler_fail_prob: f64,
    /// Probability, per poll tick, of restarting the batch's tracker
    pub tracker_restart_prob: f64,
    /// Deliveries before dead-lettering; high so faults alone never exhaust it
    pub max_deliveries: u32,
    /// Wall-clock bound on one run
    pub timeout: Duration,
}

impl Default for FanoutDSTConfig {
    fn default() -> Self {
        FanoutDSTConfig {
            seed: 0,
            items: 200,
            split_threshold: 16,
            workers: WorkerConfig::test(),
            chunk_store: SimulatedChunkStoreConfig::default(),
            tracker_store: SimulatedChunkStoreConfig::default(),
            record_store: SimulatedRecordStoreConfig::default(),
            queue: SimulatedQueueConfig::default(),
            handler_fail_prob: 0.01,
            tracker_restart_prob: 0.0,
            max_deliveries: 1_000,
            timeout: Duration::from_secs(30),
        }
    }
}

impl FanoutDSTConfig {
    pub fn new(seed: u64) -> Self {
        FanoutDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults - baseline
    pub fn calm(seed: u64) -> Self {
        FanoutDSTConfig {
            seed,
            chunk_store: SimulatedChunkStoreConfig::no_faults(),
            tracker_store: SimulatedChunkStoreConfig::no_faults(),
            record_store: SimulatedRecordStoreConfig::no_faults(),
            queue: SimulatedQueueConfig::no_faults(),
            handler_fail_prob: 0.0,
            ..Default::default()
        }
    }

    /// Default fault rates plus occasional tracker restarts
    pub fn moderate(seed: u64) -> Self {
        FanoutDSTConfig {
            seed,
            tracker_restart_prob: 0.05,
            ..Default::default()
        }
    }

    /// High fault rates everywhere
    pub fn chaos(seed: u64) -> Self {
        FanoutDSTConfig {
            seed,
            items: 120,
            split_threshold: 7,
            chunk_store: SimulatedChunkStoreConfig::high_chaos(),
            tracker_store: SimulatedChunkStoreConfig::high_chaos(),
            record_store: SimulatedRecordStoreConfig::high_chaos(),
            queue: SimulatedQueueConfig::high_chaos(),
            handler_fail_prob: 0.1,
            tracker_restart_prob: 0.2,
            ..Default::default()
        }
    }

    fn engine_config(&self) -> FanoutConfig {
        FanoutConfig {
            split_threshold: self.split_threshold,
            workers: self.workers.clone(),
            queue: QueueConfig {
                max_deliveries: self.max_deliveries,
                redelivery_delay: Duration::ZERO,
            },
            tracker: TrackerConfig::test(),
            ..FanoutConfig::test()
        }
    }
}

/// Item handler that records invocations and fails on a seeded schedule
pub struct RecordingHandler {
    rng: Mutex<SimulatedRng>,
    fail_prob: f64,
    invocations: Mutex<HashMap<String, u64>>,
    successes: Mutex<HashMap<String, u64>>,
}

impl RecordingHandler {
    pub fn new(seed: u64, fail_prob: f64) -> Self {
        RecordingHandler {
            rng: Mutex::new(SimulatedRng::new(seed)),
            fail_prob,
            invocations: Mutex::new(HashMap::new()),
            successes: Mutex::new(HashMap::new()),
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.lock().values().sum()
    }

    pub fn failures(&self) -> u64 {
        self.invocations() - self.successes.lock().values().sum::<u64>()
    }

    pub fn succeeded(&self, item_id: &str) -> bool {
        self.successes.lock().get(item_id).copied().unwrap_or(0) > 0
    }
}

impl ItemHandler for RecordingHandler {
    fn process<'a>(
        &'a self,
        _batch_id: &'a BatchId,
        item_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            *self
                .invocations
                .lock()
                .entry(item_id.to_string())
                .or_insert(0) += 1;

            let fail = {
                let mut rng = self.rng.lock();
                crate::buggify!(&mut *rng, faults::handler::FAIL, self.fail_prob)
            };
            if fail {
                return Err(HandlerError(format!("simulated failure for {}", item_id)));
            }

            *self.successes.lock().entry(item_id.to_string()).or_insert(0) += 1;
            Ok(())
        })
    }
}

/// Observer that keeps every transition
#[derive(Default)]
struct TransitionLog {
    transitions: Mutex<Vec<Transition>>,
}

impl TransitionLog {
    fn count_to(&self, status: BatchStatus) -> usize {
        self.transitions
            .lock()
            .iter()
            .filter(|t| t.to == status)
            .count()
    }
}

impl BatchObserver for TransitionLog {
    fn on_transition(&self, _: &BatchId, transition: &Transition, _: &CompletionState) {
        self.transitions.lock().push(*transition);
    }
}

/// Result of a fan-out DST run
#[derive(Debug, Clone)]
pub struct FanoutDSTResult {
    /// Seed used
    pub seed: u64,
    pub items: usize,
    pub final_status: Option<BatchStatus>,
    /// Chunks the split plan produces, root included
    pub planned_chunks: usize,
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub tracker_restarts: u64,
    pub start_attempts: u64,
    /// Faults injected across stores, queues and the handler
    pub injected_faults: u64,
    /// Consumed chunks whose deletion failed
    pub leftover_chunks: usize,
    pub dead_letters: Vec<DeadLetter>,
    /// Invariant violations found
    pub invariant_violations: Vec<String>,
    pub elapsed: Duration,
}

impl FanoutDSTResult {
    pub fn new(seed: u64, items: usize) -> Self {
        FanoutDSTResult {
            seed,
            items,
            final_status: None,
            planned_chunks: 0,
            handler_invocations: 0,
            handler_failures: 0,
            tracker_restarts: 0,
            start_attempts: 0,
            injected_faults: 0,
            leftover_chunks: 0,
            dead_letters: Vec::new(),
            invariant_violations: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} items, {} chunks, status {:?}, {} handler calls ({} failed), {} faults, {} restarts, {} leftover chunks, {} dead letters, {} violations in {:?}",
            self.seed,
            self.items,
            self.planned_chunks,
            self.final_status,
            self.handler_invocations,
            self.handler_failures,
            self.injected_faults,
            self.tracker_restarts,
            self.leftover_chunks,
            self.dead_letters.len(),
            self.invariant_violations.len(),
            self.elapsed
        )
    }
}

type SimQueue = SimulatedWorkQueue<SimulatedRng>;

/// DST harness for one batch
pub struct FanoutDSTHarness {
    config: FanoutDSTConfig,
    rng: SimulatedRng,
    engine: FanoutEngine,
    chunks: InMemoryChunkStore,
    records: InMemoryRecordStore,
    split_queue: Arc<SimQueue>,
    item_queue: Arc<SimQueue>,
    handler: Arc<RecordingHandler>,
    transitions: Arc<TransitionLog>,
    batch_id: BatchId,
    item_ids: Vec<String>,
    result: FanoutDSTResult,
}

impl FanoutDSTHarness {
    pub fn new(config: FanoutDSTConfig) -> FanoutResult<Self> {
        let seed = config.seed;
        crate::buggify::reset_stats();
        let chunks = InMemoryChunkStore::new();
        let records = InMemoryRecordStore::new();
        let transitions = Arc::new(TransitionLog::default());
        let handler = Arc::new(RecordingHandler::new(
            seed.wrapping_add(1),
            config.handler_fail_prob,
        ));

        let queue = |offset: u64| {
            Arc::new(SimulatedWorkQueue::new(
                InMemoryWorkQueue::new(config.max_deliveries, Duration::ZERO),
                SimulatedRng::new(seed.wrapping_add(offset)),
                config.queue.clone(),
            ))
        };
        let split_queue = queue(2);
        let item_queue = queue(3);

        let components = EngineComponents {
            chunks: Arc::new(SimulatedChunkStore::new(
                chunks.clone(),
                SimulatedRng::new(seed.wrapping_add(4)),
                config.chunk_store.clone(),
            )),
            tracker_store: Arc::new(BlobTrackerStore::new(SimulatedChunkStore::new(
                chunks.clone(),
                SimulatedRng::new(seed.wrapping_add(5)),
                config.tracker_store.clone(),
            ))),
            records: Arc::new(SimulatedRecordStore::new(
                records.clone(),
                SimulatedRng::new(seed.wrapping_add(6)),
                config.record_store.clone(),
            )),
            split_queue: split_queue.clone(),
            item_queue: item_queue.clone(),
            observer: transitions.clone(),
        };

        let engine = FanoutEngine::start(config.engine_config(), components, handler.clone())?;

        let batch_id = BatchId::from(format!("dst-{}", seed));
        let item_ids = (0..config.items).map(|i| format!("cust-{:05}", i)).collect();
        let mut result = FanoutDSTResult::new(seed, config.items);
        result.planned_chunks = SplitPlan::compute(config.items, config.split_threshold).chunks;

        Ok(FanoutDSTHarness {
            rng: SimulatedRng::new(seed),
            config,
            engine,
            chunks,
            records,
            split_queue,
            item_queue,
            handler,
            transitions,
            batch_id,
            item_ids,
            result,
        })
    }

    /// Start the batch (retrying failed starts) and drive it to a
    /// terminal status or the timeout
    pub async fn run(&mut self) {
        let started = Instant::now();
        let deadline = started + self.config.timeout;

        while !self.start_batch().await {
            if Instant::now() >= deadline {
                self.violation("batch never started".to_string());
                return;
            }
        }

        let tick = Duration::from_millis(5);
        let trackers = self.engine.trackers().clone();
        loop {
            let waited = tokio::time::timeout(
                tick,
                trackers.wait_for_status(&self.batch_id, BatchStatus::Completed),
            )
            .await;
            match waited {
                Ok(Ok(status)) => {
                    self.result.final_status = Some(status);
                    break;
                }
                Ok(Err(e)) => {
                    self.violation(format!("tracker unavailable: {}", e));
                    break;
                }
                Err(_) => {}
            }

            if Instant::now() >= deadline {
                self.result.final_status = tokio::time::timeout(tick, trackers.status(&self.batch_id))
                    .await
                    .ok()
                    .and_then(Result::ok);
                self.violation(format!(
                    "batch did not complete within {:?}",
                    self.config.timeout
                ));
                break;
            }
            if crate::buggify!(
                &mut self.rng,
                faults::tracker::RESTART,
                self.config.tracker_restart_prob
            )
                && trackers.restart(&self.batch_id).is_ok()
            {
                self.result.tracker_restarts += 1;
            }
        }
        self.result.elapsed = started.elapsed();
    }

    async fn start_batch(&mut self) -> bool {
        self.result.start_attempts += 1;
        self.engine
            .start_batch_with_id(self.batch_id.clone(), self.item_ids.clone())
            .await
            .is_ok()
    }

    /// Check all invariants against the final state
    pub async fn check_invariants(&mut self) {
        self.check_completion().await;
        self.check_records();
        self.check_dead_letters();
        self.check_leftovers().await;

        self.result.handler_invocations = self.handler.invocations();
        self.result.handler_failures = self.handler.failures();
        self.result.injected_faults = crate::buggify::stats().total_triggers();
    }

    async fn check_completion(&mut self) {
        let completed = self.transitions.count_to(BatchStatus::Completed);
        if completed != 1 {
            self.violation(format!("Completed reached {} times", completed));
        }

        let state = match self.engine.snapshot(&self.batch_id).await {
            Ok(state) => state,
            Err(e) => {
                self.violation(format!("snapshot failed: {}", e));
                return;
            }
        };
        let items = self.item_ids.len() as u64;
        if state.status != BatchStatus::Completed {
            self.violation(format!("final status {}", state.status));
        }
        if state.files_remaining != 0 {
            self.violation(format!("files_remaining = {}", state.files_remaining));
        }
        if state.expected_item_count != items || state.processed_item_count != items {
            self.violation(format!(
                "expected {} / processed {} for {} items",
                state.expected_item_count, state.processed_item_count, items
            ));
        }
        if state.settled_chunks.len() != self.result.planned_chunks {
            self.violation(format!(
                "settled {} chunks, plan has {}",
                state.settled_chunks.len(),
                self.result.planned_chunks
            ));
        }
        if state.rejected_signals != 0 {
            self.violation(format!("{} signals rejected", state.rejected_signals));
        }
    }

    fn check_records(&mut self) {
        let records = self.records.records_for(&self.batch_id);
        if records.len() != self.item_ids.len() {
            self.violation(format!(
                "{} records for {} items",
                records.len(),
                self.item_ids.len()
            ));
        }
        let unprocessed: Vec<String> = records
            .iter()
            .filter(|r| !r.processed)
            .map(|r| r.item_id.clone())
            .collect();
        if !unprocessed.is_empty() {
            self.violation(format!("unprocessed records: {:?}", unprocessed));
        }
        let never_succeeded: Vec<&String> = self
            .item_ids
            .iter()
            .filter(|id| !self.handler.succeeded(id))
            .collect();
        if !never_succeeded.is_empty() {
            let msg = format!("handler never succeeded for {:?}", never_succeeded);
            self.violation(msg);
        }
    }

    fn check_dead_letters(&mut self) {
        let mut dead = self.split_queue.inner().dead_letters();
        dead.extend(self.item_queue.inner().dead_letters());

        for letter in &dead {
            if !letter.reason.starts_with(LOST_FLIP_PREFIX) {
                let msg = format!("unexpected dead letter {:?}: {}", letter.body, letter.reason);
                self.violation(msg);
            }
        }
        self.result.dead_letters = dead;
    }

    async fn check_leftovers(&mut self) {
        match self.chunks.list(&self.batch_id).await {
            Ok(names) => {
                self.result.leftover_chunks = names.iter().filter(|n| is_chunk_name(n)).count();
            }
            Err(e) => self.violation(format!("listing chunks failed: {}", e)),
        }
    }

    fn violation(&mut self, msg: String) {
        self.result
            .invariant_violations
            .push(format!("[seed {}] {}", self.config.seed, msg));
    }

    pub fn result(&self) -> &FanoutDSTResult {
        &self.result
    }

    pub async fn into_result(self) -> FanoutDSTResult {
        self.engine.shutdown().await;
        self.result
    }
}

/// Run a batch of fan-out DST runs with different seeds
pub async fn run_fanout_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> FanoutDSTConfig,
) -> Vec<FanoutDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = match FanoutDSTHarness::new(config_fn(seed)) {
            Ok(harness) => harness,
            Err(e) => {
                let config = config_fn(seed);
                let mut result = FanoutDSTResult::new(seed, config.items);
                result
                    .invariant_violations
                    .push(format!("[seed {}] engine failed to start: {}", seed, e));
                results.push(result);
                continue;
            }
        };
        harness.run().await;
        harness.check_invariants().await;
        results.push(harness.into_result().await);
    }

    results
}

/// Summary of batch results
pub fn summarize_fanout_batch(results: &[FanoutDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_items: usize = results.iter().map(|r| r.items).sum();
    let total_calls: u64 = results.iter().map(|r| r.handler_invocations).sum();
    let total_restarts: u64 = results.iter().map(|r| r.tracker_restarts).sum();

    let mut summary = format!(
        "Fan-out DST Batch: {}/{} passed, {} items, {} handler calls, {} tracker restarts",
        passed, total, total_items, total_calls, total_restarts
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
        if let Some(first_failure) = results.iter().find(|r| !r.is_success()) {
            summary.push_str(&format!(
                "\nFirst failure violations:\n  {}",
                first_failure.invariant_violations.join("\n  ")
            ));
        }
    }

    summary
}
