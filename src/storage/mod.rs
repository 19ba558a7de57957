//! Storage collaborators
//!
//! - `ChunkStore`: durable chunk payloads addressed by `(batchId, name)`
//! - `ItemRecordStore`: idempotency records with optimistic concurrency
//! - `TrackerStore`: committed completion state per batch
//!
//! Each has an in-memory implementation for tests and a simulated wrapper
//! that injects faults for deterministic simulation testing.

pub mod chunk_store;
pub mod codec;
pub mod record_store;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod simulated;
pub mod tracker_store;

pub use chunk_store::{object_key, ChunkStore, InMemoryChunkStore, LocalFsChunkStore};
pub use codec::{decode_items, encode_items, CodecError};
pub use record_store::{
    ConcurrencyToken, InMemoryRecordStore, ItemRecord, ItemRecordStore, RecordKey, RecordResult,
    RecordStoreError,
};
#[cfg(feature = "s3")]
pub use s3_store::S3ChunkStore;
pub use simulated::{
    SimulatedChunkStore, SimulatedChunkStoreConfig, SimulatedChunkStoreStats, SimulatedRecordStore,
    SimulatedRecordStoreConfig, SimulatedRecordStoreStats,
};
pub use tracker_store::{is_chunk_name, BlobTrackerStore, TrackerStore, TRACKER_STATE_OBJECT};

use crate::batch::BatchId;
use bytes::Bytes;
use std::future::Future;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;

/// Shared handles to a store are stores themselves
impl<T: ChunkStore + ?Sized> ChunkStore for Arc<T> {
    fn write<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        (**self).write(batch_id, name, data)
    }

    fn read<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Bytes>> + Send + 'a>> {
        (**self).read(batch_id, name)
    }

    fn delete_if_exists<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        (**self).delete_if_exists(batch_id, name)
    }

    fn list<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<String>>> + Send + 'a>> {
        (**self).list(batch_id)
    }
}

impl<T: ItemRecordStore + ?Sized> ItemRecordStore for Arc<T> {
    fn create_if_absent<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>> {
        (**self).create_if_absent(key, record)
    }

    fn read<'a>(
        &'a self,
        key: &'a RecordKey,
    ) -> Pin<Box<dyn Future<Output = RecordResult<(ItemRecord, ConcurrencyToken)>> + Send + 'a>>
    {
        (**self).read(key)
    }

    fn update_if_token_matches<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
        token: ConcurrencyToken,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>> {
        (**self).update_if_token_matches(key, record, token)
    }
}
