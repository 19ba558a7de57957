//! Batch Splitter
//!
//! Consumes one chunk per split task. Chunks above the threshold are halved
//! by position into two child chunks; chunks at or below it are fanned out
//! into one item task per entry. Every consumed chunk is reported to the
//! batch's tracker exactly once (repeats are de-duplicated by chunk name).
//!
//! Effect order for one task:
//!
//! 1. write child chunks (split case only)
//! 2. signal `FileProcessed` into the tracker mailbox
//! 3. release child split tasks / item tasks to the queue
//! 4. best-effort delete of the consumed chunk
//!
//! Step 2 precedes step 3, so any signal caused by released work lands in
//! the tracker's FIFO mailbox after the signal that accounts for it. A task
//! that fails after step 2 is redelivered; its repeated signal is ignored and
//! its re-released work is de-duplicated downstream.

use crate::batch::ChunkRef;
use crate::fanout::error::FanoutResult;
use crate::fanout::tracker::TrackerRegistry;
use crate::queue::{WorkMessage, WorkQueue};
use crate::storage::{decode_items, encode_items, ChunkStore};
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Split a chunk into `ceil(n/2)` and `floor(n/2)` items by position
pub fn split_in_half<T>(items: &[T]) -> (&[T], &[T]) {
    let mid = (items.len() + 1) / 2;
    items.split_at(mid)
}

/// Shape of the split tree for `n` items at threshold `t`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    /// Leaf chunk sizes in split order (left before right)
    pub leaf_sizes: Vec<usize>,
    /// Number of halvings on the deepest path
    pub depth: usize,
    /// Chunks written in total, the root included
    pub chunks: usize,
}

impl SplitPlan {
    pub fn compute(n: usize, threshold: usize) -> Self {
        debug_assert!(threshold >= 1, "threshold must be at least 1");
        let threshold = threshold.max(1);

        let mut plan = SplitPlan {
            leaf_sizes: Vec::new(),
            depth: 0,
            chunks: 0,
        };
        // Depth-first, left child first
        let mut stack = vec![(n, 0usize)];
        while let Some((size, depth)) = stack.pop() {
            plan.chunks += 1;
            plan.depth = plan.depth.max(depth);
            if size > threshold {
                let left = (size + 1) / 2;
                stack.push((size - left, depth + 1));
                stack.push((left, depth + 1));
            } else {
                plan.leaf_sizes.push(size);
            }
        }
        plan
    }

    /// Items across all leaves (equals `n`)
    pub fn total_items(&self) -> usize {
        self.leaf_sizes.iter().sum()
    }
}

/// What handling one split task did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Split { children: [ChunkRef; 2] },
    Queued { items: usize },
    /// The chunk was already consumed by an earlier delivery
    AlreadyConsumed,
}

/// Recursive chunk splitter
pub struct BatchSplitter {
    chunks: Arc<dyn ChunkStore>,
    split_queue: Arc<dyn WorkQueue>,
    item_queue: Arc<dyn WorkQueue>,
    trackers: TrackerRegistry,
    threshold: usize,
}

impl BatchSplitter {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        split_queue: Arc<dyn WorkQueue>,
        item_queue: Arc<dyn WorkQueue>,
        trackers: TrackerRegistry,
        threshold: usize,
    ) -> Self {
        debug_assert!(threshold >= 1, "split threshold must be at least 1");
        BatchSplitter {
            chunks,
            split_queue,
            item_queue,
            trackers,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub async fn handle(&self, chunk: &ChunkRef) -> FanoutResult<SplitOutcome> {
        let data = match self.chunks.read(&chunk.batch_id, &chunk.name).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(chunk = %chunk, "Chunk already consumed, skipping");
                return Ok(SplitOutcome::AlreadyConsumed);
            }
            Err(e) => return Err(e.into()),
        };
        let items = decode_items(&data)?;

        if items.len() > self.threshold {
            self.split(chunk, &items).await
        } else {
            self.fan_out(chunk, &items).await
        }
    }

    async fn split(&self, chunk: &ChunkRef, items: &[String]) -> FanoutResult<SplitOutcome> {
        let (left, right) = split_in_half(items);
        debug_assert!(!left.is_empty() && !right.is_empty());

        let children = [chunk.child(0), chunk.child(1)];
        let payloads = [encode_items(left)?, encode_items(right)?];
        futures::future::try_join_all(
            children
                .iter()
                .zip(payloads)
                .map(|(child, payload)| self.chunks.write(&child.batch_id, &child.name, payload)),
        )
        .await?;

        self.trackers.file_processed(chunk, 2, 0)?;

        for child in &children {
            self.split_queue
                .enqueue(WorkMessage::split(child.clone()).encode())
                .await?;
        }

        info!(
            chunk = %chunk,
            depth = chunk.depth(),
            items = items.len(),
            left = left.len(),
            right = right.len(),
            "Split chunk"
        );
        self.release(chunk).await;
        Ok(SplitOutcome::Split { children })
    }

    async fn fan_out(&self, chunk: &ChunkRef, items: &[String]) -> FanoutResult<SplitOutcome> {
        self.trackers
            .file_processed(chunk, 0, items.len() as u64)?;

        for item_id in items {
            self.item_queue
                .enqueue(WorkMessage::item(chunk.batch_id.clone(), item_id.as_str()).encode())
                .await?;
        }

        debug!(chunk = %chunk, items = items.len(), "Queued item tasks");
        self.release(chunk).await;
        Ok(SplitOutcome::Queued { items: items.len() })
    }

    /// Delete a consumed chunk; failure leaves garbage but is not an error
    async fn release(&self, chunk: &ChunkRef) {
        if let Err(e) = self.chunks.delete_if_exists(&chunk.batch_id, &chunk.name).await {
            warn!(chunk = %chunk, error = %e, "Failed to delete consumed chunk");
        }
    }
}
