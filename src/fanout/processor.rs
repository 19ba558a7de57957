//! Item Processor
//!
//! Runs the user-supplied [`ItemHandler`] for one `(batchId, itemId)` at most
//! semantically once despite at-least-once delivery, using an idempotency
//! record with optimistic concurrency:
//!
//! - create the record (`processed = false`); on success run the handler and
//!   flip the record with the creation token
//! - on conflict, read the record: already processed means a duplicate; not
//!   processed means a racing or crashed delivery, so run the handler and try
//!   to flip with the freshly read token. Losing that race is a duplicate.
//!
//! Exactly one delivery per item wins the flip to `processed = true`, and
//! only the winner signals the tracker.

use crate::batch::BatchId;
use crate::fanout::error::{FanoutError, FanoutResult};
use crate::fanout::tracker::TrackerRegistry;
use crate::storage::{ConcurrencyToken, ItemRecord, ItemRecordStore, RecordKey, RecordStoreError};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Failure reported by an item handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

/// The per-item processing action
pub trait ItemHandler: Send + Sync + 'static {
    fn process<'a>(
        &'a self,
        batch_id: &'a BatchId,
        item_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Handler that just waits, standing in for real per-item work
#[derive(Debug, Clone)]
pub struct DelayHandler {
    delay: Duration,
}

impl DelayHandler {
    pub fn new(delay: Duration) -> Self {
        DelayHandler { delay }
    }
}

impl ItemHandler for DelayHandler {
    fn process<'a>(
        &'a self,
        _batch_id: &'a BatchId,
        _item_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        })
    }
}

/// What processing one item task did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// This delivery flipped the record and signaled the tracker
    Processed,
    /// Another delivery already did (or is winning) the work
    Duplicate,
}

/// Idempotent item processor
pub struct ItemProcessor {
    records: Arc<dyn ItemRecordStore>,
    handler: Arc<dyn ItemHandler>,
    trackers: TrackerRegistry,
}

impl ItemProcessor {
    pub fn new(
        records: Arc<dyn ItemRecordStore>,
        handler: Arc<dyn ItemHandler>,
        trackers: TrackerRegistry,
    ) -> Self {
        ItemProcessor {
            records,
            handler,
            trackers,
        }
    }

    pub async fn process(&self, batch_id: &BatchId, item_id: &str) -> FanoutResult<ItemOutcome> {
        let key = RecordKey::for_item(batch_id, item_id);
        let pending = ItemRecord::pending(batch_id.clone(), item_id);

        match self.records.create_if_absent(&key, pending.clone()).await {
            Ok(token) => self.process_as_creator(&key, pending, token).await,
            Err(RecordStoreError::Conflict) => self.process_existing(&key, batch_id, item_id).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn process_as_creator(
        &self,
        key: &RecordKey,
        record: ItemRecord,
        token: ConcurrencyToken,
    ) -> FanoutResult<ItemOutcome> {
        self.run_handler(&record.batch_id, &record.item_id).await?;

        match self
            .records
            .update_if_token_matches(key, record.mark_processed(), token)
            .await
        {
            Ok(_) => {
                self.signal(&record.batch_id, &record.item_id)?;
                Ok(ItemOutcome::Processed)
            }
            Err(RecordStoreError::StaleToken) => {
                error!(
                    batch = %record.batch_id,
                    item = %record.item_id,
                    key = %key,
                    "Creation token went stale before the creator's update"
                );
                Err(FanoutError::FatalConsistency(format!(
                    "creation token for {} is stale",
                    key
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn process_existing(
        &self,
        key: &RecordKey,
        batch_id: &BatchId,
        item_id: &str,
    ) -> FanoutResult<ItemOutcome> {
        let (existing, token) = self.records.read(key).await?;
        if existing.processed {
            debug!(batch = %batch_id, item = %item_id, "Item already processed, skipping");
            return Ok(ItemOutcome::Duplicate);
        }

        self.run_handler(batch_id, item_id).await?;

        match self
            .records
            .update_if_token_matches(key, existing.mark_processed(), token)
            .await
        {
            Ok(_) => {
                self.signal(batch_id, item_id)?;
                Ok(ItemOutcome::Processed)
            }
            Err(RecordStoreError::StaleToken) => {
                debug!(batch = %batch_id, item = %item_id, "Lost processing race, skipping");
                Ok(ItemOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_handler(&self, batch_id: &BatchId, item_id: &str) -> FanoutResult<()> {
        self.handler
            .process(batch_id, item_id)
            .await
            .map_err(|e| FanoutError::Processing(format!("item {}: {}", item_id, e)))
    }

    fn signal(&self, batch_id: &BatchId, item_id: &str) -> FanoutResult<()> {
        self.trackers.item_processed(batch_id, item_id)
    }
}
