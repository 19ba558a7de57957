//! Item Record Store
//!
//! Keyed idempotency records with optimistic concurrency: creation fails if
//! the key exists, updates fail unless the caller presents the record's
//! current token.

use crate::batch::BatchId;
use fnv::FnvHasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hasher;
use std::pin::Pin;
use std::sync::Arc;

/// Number of partitions item records are spread over within a batch
pub const RECORD_PARTITIONS: u64 = 16;

/// Storage key of an item record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub partition: String,
    pub row: String,
}

impl RecordKey {
    /// The only key derivation used for both writing and reading a record.
    pub fn for_item(batch_id: &BatchId, item_id: &str) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(item_id.as_bytes());
        let bucket = hasher.finish() % RECORD_PARTITIONS;
        RecordKey {
            partition: format!("{}-{:02x}", batch_id, bucket),
            row: item_id.to_string(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.row)
    }
}

/// Opaque optimistic-concurrency token, changes on every write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConcurrencyToken(u64);

impl ConcurrencyToken {
    pub fn new(value: u64) -> Self {
        ConcurrencyToken(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Idempotency marker for one item of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub batch_id: BatchId,
    pub item_id: String,
    pub processed: bool,
}

impl ItemRecord {
    pub fn pending(batch_id: BatchId, item_id: impl Into<String>) -> Self {
        ItemRecord {
            batch_id,
            item_id: item_id.into(),
            processed: false,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::for_item(&self.batch_id, &self.item_id)
    }

    pub fn mark_processed(&self) -> Self {
        ItemRecord {
            processed: true,
            ..self.clone()
        }
    }
}

/// Record store errors
#[derive(Debug)]
pub enum RecordStoreError {
    /// A record already exists under the key
    Conflict,
    /// The presented token is not the record's current token
    StaleToken,
    NotFound,
    Io(std::io::Error),
}

impl RecordStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RecordStoreError::Io(_))
    }
}

impl fmt::Display for RecordStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStoreError::Conflict => write!(f, "record already exists"),
            RecordStoreError::StaleToken => write!(f, "concurrency token is stale"),
            RecordStoreError::NotFound => write!(f, "record not found"),
            RecordStoreError::Io(e) => write!(f, "record store I/O error: {}", e),
        }
    }
}

impl std::error::Error for RecordStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordStoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RecordStoreError {
    fn from(e: std::io::Error) -> Self {
        RecordStoreError::Io(e)
    }
}

pub type RecordResult<T> = Result<T, RecordStoreError>;

/// Keyed record store with create-if-absent and compare-and-swap updates
pub trait ItemRecordStore: Send + Sync + 'static {
    /// Create a record. Fails with `Conflict` if the key already exists.
    fn create_if_absent<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>>;

    /// Read a record together with its current token
    fn read<'a>(
        &'a self,
        key: &'a RecordKey,
    ) -> Pin<Box<dyn Future<Output = RecordResult<(ItemRecord, ConcurrencyToken)>> + Send + 'a>>;

    /// Replace a record if `token` is still current. Returns the new token.
    fn update_if_token_matches<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
        token: ConcurrencyToken,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>>;
}

// ============================================================================
// InMemoryRecordStore
// ============================================================================

#[derive(Debug, Default)]
struct RecordTable {
    rows: HashMap<RecordKey, (ItemRecord, ConcurrencyToken)>,
    next_token: u64,
}

impl RecordTable {
    fn fresh_token(&mut self) -> ConcurrencyToken {
        self.next_token += 1;
        ConcurrencyToken(self.next_token)
    }
}

/// In-memory record store for tests and DST
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    table: Arc<Mutex<RecordTable>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().rows.is_empty()
    }

    /// All records belonging to a batch, sorted by item id
    pub fn records_for(&self, batch_id: &BatchId) -> Vec<ItemRecord> {
        let mut records: Vec<ItemRecord> = self
            .table
            .lock()
            .rows
            .values()
            .filter(|(r, _)| &r.batch_id == batch_id)
            .map(|(r, _)| r.clone())
            .collect();
        records.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        records
    }
}

impl ItemRecordStore for InMemoryRecordStore {
    fn create_if_absent<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>> {
        Box::pin(async move {
            let mut table = self.table.lock();
            if table.rows.contains_key(key) {
                return Err(RecordStoreError::Conflict);
            }
            let token = table.fresh_token();
            table.rows.insert(key.clone(), (record, token));
            Ok(token)
        })
    }

    fn read<'a>(
        &'a self,
        key: &'a RecordKey,
    ) -> Pin<Box<dyn Future<Output = RecordResult<(ItemRecord, ConcurrencyToken)>> + Send + 'a>>
    {
        Box::pin(async move {
            self.table
                .lock()
                .rows
                .get(key)
                .cloned()
                .ok_or(RecordStoreError::NotFound)
        })
    }

    fn update_if_token_matches<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
        token: ConcurrencyToken,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>> {
        Box::pin(async move {
            let mut table = self.table.lock();
            let current = match table.rows.get(key) {
                Some((existing, current)) => {
                    debug_assert!(
                        !(existing.processed && !record.processed),
                        "processed must never go back to false"
                    );
                    *current
                }
                None => return Err(RecordStoreError::NotFound),
            };
            if current != token {
                return Err(RecordStoreError::StaleToken);
            }
            let next = table.fresh_token();
            table.rows.insert(key.clone(), (record, next));
            Ok(next)
        })
    }
}
