//! Worker Pool
//!
//! Queue consumers: split workers drive the [`BatchSplitter`], item workers
//! drive the [`ItemProcessor`]. Each delivery is settled from the outcome:
//!
//! | Outcome                         | Settlement  |
//! |---------------------------------|-------------|
//! | `Ok`                            | ack         |
//! | retryable error                 | abandon     |
//! | undecodable / wrong queue       | dead letter |
//! | any other error                 | dead letter |
//!
//! Workers exit once their queue is closed and drained of waiters.

use crate::batch::BatchId;
use crate::fanout::config::WorkerConfig;
use crate::fanout::error::FanoutError;
use crate::fanout::processor::{ItemOutcome, ItemProcessor};
use crate::fanout::splitter::{BatchSplitter, SplitOutcome};
use crate::queue::{Delivery, WorkMessage, WorkQueue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Counters across all workers of a pool
#[derive(Debug, Default)]
pub struct WorkerStats {
    chunks_split: AtomicU64,
    chunks_fanned_out: AtomicU64,
    chunks_already_consumed: AtomicU64,
    items_processed: AtomicU64,
    items_duplicate: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub chunks_split: u64,
    pub chunks_fanned_out: u64,
    pub chunks_already_consumed: u64,
    pub items_processed: u64,
    pub items_duplicate: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            chunks_split: self.chunks_split.load(Ordering::Relaxed),
            chunks_fanned_out: self.chunks_fanned_out.load(Ordering::Relaxed),
            chunks_already_consumed: self.chunks_already_consumed.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            items_duplicate: self.items_duplicate.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Running split and item workers
pub struct WorkerPool {
    split_queue: Arc<dyn WorkQueue>,
    item_queue: Arc<dyn WorkQueue>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    pub fn start(
        config: &WorkerConfig,
        split_queue: Arc<dyn WorkQueue>,
        item_queue: Arc<dyn WorkQueue>,
        splitter: Arc<BatchSplitter>,
        processor: Arc<ItemProcessor>,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let mut handles = Vec::with_capacity(config.split_workers + config.item_workers);

        for worker_id in 0..config.split_workers {
            handles.push(tokio::spawn(run_split_worker(
                worker_id,
                split_queue.clone(),
                splitter.clone(),
                stats.clone(),
            )));
        }
        for worker_id in 0..config.item_workers {
            handles.push(tokio::spawn(run_item_worker(
                worker_id,
                item_queue.clone(),
                processor.clone(),
                stats.clone(),
            )));
        }

        debug!(
            split_workers = config.split_workers,
            item_workers = config.item_workers,
            "Worker pool started"
        );
        WorkerPool {
            split_queue,
            item_queue,
            handles,
            stats,
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close both queues and wait for every worker to exit
    pub async fn shutdown(self) -> WorkerStatsSnapshot {
        self.split_queue.close();
        self.item_queue.close();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        self.stats.snapshot()
    }
}

async fn run_split_worker(
    worker_id: usize,
    queue: Arc<dyn WorkQueue>,
    splitter: Arc<BatchSplitter>,
    stats: Arc<WorkerStats>,
) {
    while let Some(delivery) = queue.receive().await {
        let chunk = match WorkMessage::decode(delivery.body()) {
            Ok(WorkMessage::Split(chunk)) => chunk,
            Ok(misrouted @ WorkMessage::Item { .. }) => {
                reject(
                    delivery,
                    Some(misrouted.batch_id()),
                    "item task on split queue",
                    &stats,
                );
                continue;
            }
            Err(e) => {
                reject(delivery, None, &e.to_string(), &stats);
                continue;
            }
        };

        match splitter.handle(&chunk).await {
            Ok(outcome) => {
                match outcome {
                    SplitOutcome::Split { .. } => WorkerStats::bump(&stats.chunks_split),
                    SplitOutcome::Queued { .. } => WorkerStats::bump(&stats.chunks_fanned_out),
                    SplitOutcome::AlreadyConsumed => {
                        WorkerStats::bump(&stats.chunks_already_consumed)
                    }
                }
                delivery.ack();
            }
            Err(e) => settle_failure(delivery, &chunk.batch_id, e, &stats),
        }
    }
    debug!(worker_id, "Split worker exiting");
}

async fn run_item_worker(
    worker_id: usize,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<ItemProcessor>,
    stats: Arc<WorkerStats>,
) {
    while let Some(delivery) = queue.receive().await {
        let (batch_id, item_id) = match WorkMessage::decode(delivery.body()) {
            Ok(WorkMessage::Item { batch_id, item_id }) => (batch_id, item_id),
            Ok(misrouted @ WorkMessage::Split(_)) => {
                reject(
                    delivery,
                    Some(misrouted.batch_id()),
                    "split task on item queue",
                    &stats,
                );
                continue;
            }
            Err(e) => {
                reject(delivery, None, &e.to_string(), &stats);
                continue;
            }
        };

        match processor.process(&batch_id, &item_id).await {
            Ok(ItemOutcome::Processed) => {
                WorkerStats::bump(&stats.items_processed);
                delivery.ack();
            }
            Ok(ItemOutcome::Duplicate) => {
                WorkerStats::bump(&stats.items_duplicate);
                delivery.ack();
            }
            Err(e) => settle_failure(delivery, &batch_id, e, &stats),
        }
    }
    debug!(worker_id, "Item worker exiting");
}

/// `batch_id` is known only when the body decoded
fn reject(delivery: Delivery, batch_id: Option<&BatchId>, reason: &str, stats: &WorkerStats) {
    error!(
        batch = batch_id.map(tracing::field::display),
        body = delivery.body(),
        reason,
        "Dead-lettering malformed message"
    );
    WorkerStats::bump(&stats.dead_lettered);
    delivery.dead_letter(reason);
}

fn settle_failure(
    delivery: Delivery,
    batch_id: &BatchId,
    err: FanoutError,
    stats: &WorkerStats,
) {
    if err.is_retryable() {
        warn!(
            batch = %batch_id,
            body = delivery.body(),
            delivery_count = delivery.delivery_count(),
            error = %err,
            "Task failed, returning for redelivery"
        );
        WorkerStats::bump(&stats.retried);
        delivery.abandon();
    } else {
        error!(
            batch = %batch_id,
            body = delivery.body(),
            redelivered = delivery.is_redelivery(),
            error = %err,
            "Task failed permanently"
        );
        WorkerStats::bump(&stats.dead_lettered);
        delivery.dead_letter(err.to_string());
    }
}
