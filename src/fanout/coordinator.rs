//! Batch Coordinator
//!
//! Entry point for a new batch: persist the root chunk, initialise the
//! batch's tracker, then release the first split task.

use crate::batch::{BatchId, ChunkRef};
use crate::fanout::error::{FanoutError, FanoutResult};
use crate::fanout::tracker::TrackerRegistry;
use crate::queue::{WorkMessage, WorkQueue};
use crate::storage::{encode_items, ChunkStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct BatchCoordinator {
    chunks: Arc<dyn ChunkStore>,
    split_queue: Arc<dyn WorkQueue>,
    trackers: TrackerRegistry,
}

impl BatchCoordinator {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        split_queue: Arc<dyn WorkQueue>,
        trackers: TrackerRegistry,
    ) -> Self {
        BatchCoordinator {
            chunks,
            split_queue,
            trackers,
        }
    }

    /// Start a batch under a freshly generated id
    pub async fn start_batch(&self, items: Vec<String>) -> FanoutResult<BatchId> {
        self.start_batch_with_id(BatchId::generate(), items).await
    }

    /// Start a batch under a caller-chosen id
    pub async fn start_batch_with_id(
        &self,
        batch_id: BatchId,
        items: Vec<String>,
    ) -> FanoutResult<BatchId> {
        if !BatchId::is_valid(batch_id.as_str()) {
            return Err(FanoutError::InvalidBatch(format!(
                "batch id {:?} is empty or contains a reserved separator",
                batch_id.as_str()
            )));
        }
        reject_duplicates(&items)?;

        let root = ChunkRef::root(batch_id.clone());
        let payload = encode_items(&items)?;
        self.chunks
            .write(&root.batch_id, &root.name, payload)
            .await?;

        // The initialise signal must sit in the mailbox before any signal
        // caused by the root split task.
        self.trackers.initialise(&batch_id, 0)?;
        self.split_queue
            .enqueue(WorkMessage::split(root).encode())
            .await?;

        info!(batch = %batch_id, items = items.len(), "Batch started");
        Ok(batch_id)
    }
}

/// One idempotency record per `(batch, item)` means a repeated id could
/// never be counted twice, leaving the batch short of completion forever.
fn reject_duplicates(items: &[String]) -> FanoutResult<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.as_str()) {
            return Err(FanoutError::InvalidBatch(format!(
                "duplicate item id {:?}",
                item
            )));
        }
    }
    Ok(())
}
