//! Simulated Stores with Fault Injection
//!
//! DST-compatible wrappers around the chunk store and the item record store
//! that inject faults using buggify. Every decision draws from the wrapper's
//! seeded RNG, so a run is reproducible from its seed.

use crate::batch::BatchId;
use crate::buggify::faults::{chunk_store as chunk_faults, record_store as record_faults};
use crate::io::Rng;
use crate::storage::{
    ChunkStore, ConcurrencyToken, ItemRecord, ItemRecordStore, RecordKey, RecordResult,
    RecordStoreError,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated chunk store faults
#[derive(Debug, Clone)]
pub struct SimulatedChunkStoreConfig {
    /// Write rejected before anything is stored
    pub put_fail_prob: f64,
    /// Write stored, but the caller sees a timeout
    pub put_ambiguous_prob: f64,
    pub get_fail_prob: f64,
    /// Read returns one flipped byte
    pub get_corrupt_prob: f64,
    pub delete_fail_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedChunkStoreConfig {
    fn default() -> Self {
        SimulatedChunkStoreConfig {
            put_fail_prob: 0.01,         // 1%
            put_ambiguous_prob: 0.005,   // 0.5%
            get_fail_prob: 0.01,         // 1%
            get_corrupt_prob: 0.001,     // 0.1%
            delete_fail_prob: 0.01,      // 1%
            latency_range_us: (0, 500),
        }
    }
}

impl SimulatedChunkStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedChunkStoreConfig {
            put_fail_prob: 0.05,
            put_ambiguous_prob: 0.02,
            get_fail_prob: 0.05,
            get_corrupt_prob: 0.01,
            delete_fail_prob: 0.1,
            latency_range_us: (0, 2_000),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedChunkStoreConfig {
            put_fail_prob: 0.0,
            put_ambiguous_prob: 0.0,
            get_fail_prob: 0.0,
            get_corrupt_prob: 0.0,
            delete_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for chunk store fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedChunkStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub put_ambiguous: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub get_corruptions: u64,
    pub delete_attempts: u64,
    pub delete_failures: u64,
}

struct SimulatedInner<R: Rng, St> {
    rng: R,
    stats: St,
}

/// Draw a fault decision from the shared RNG
fn roll<R: Rng, St>(state: &Mutex<SimulatedInner<R, St>>, fault_id: &str, prob: f64) -> bool {
    let mut s = state.lock();
    crate::buggify!(&mut s.rng, fault_id, prob)
}

async fn simulate_latency<R: Rng, St>(state: &Mutex<SimulatedInner<R, St>>, range_us: (u64, u64)) {
    let (min, max) = range_us;
    if min == 0 && max == 0 {
        return;
    }
    let latency_us = {
        let mut s = state.lock();
        if max > min {
            s.rng.gen_range(min, max)
        } else {
            min
        }
    };
    if latency_us > 0 {
        tokio::time::sleep(Duration::from_micros(latency_us)).await;
    }
}

/// Simulated chunk store that wraps another store and injects faults
pub struct SimulatedChunkStore<S: ChunkStore, R: Rng> {
    inner_store: S,
    config: SimulatedChunkStoreConfig,
    state: Arc<Mutex<SimulatedInner<R, SimulatedChunkStoreStats>>>,
}

impl<S: ChunkStore, R: Rng> SimulatedChunkStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedChunkStoreConfig) -> Self {
        SimulatedChunkStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedInner {
                rng,
                stats: SimulatedChunkStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedChunkStoreStats {
        self.state.lock().stats.clone()
    }

    /// The wrapped store, bypassing fault injection
    pub fn inner(&self) -> &S {
        &self.inner_store
    }
}

impl<S: ChunkStore, R: Rng> ChunkStore for SimulatedChunkStore<S, R> {
    fn write<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.put_attempts += 1;

            if roll(&self.state, chunk_faults::PUT_FAIL, self.config.put_fail_prob) {
                self.state.lock().stats.put_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated put failure"));
            }

            simulate_latency(&self.state, self.config.latency_range_us).await;
            self.inner_store.write(batch_id, name, data).await?;

            if roll(&self.state, chunk_faults::PUT_AMBIGUOUS, self.config.put_ambiguous_prob) {
                self.state.lock().stats.put_ambiguous += 1;
                return Err(IoError::new(ErrorKind::TimedOut, "simulated put timeout"));
            }
            Ok(())
        })
    }

    fn read<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.get_attempts += 1;

            if roll(&self.state, chunk_faults::GET_FAIL, self.config.get_fail_prob) {
                self.state.lock().stats.get_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated get failure"));
            }

            simulate_latency(&self.state, self.config.latency_range_us).await;
            let data = self.inner_store.read(batch_id, name).await?;

            if !data.is_empty()
                && roll(&self.state, chunk_faults::GET_CORRUPT, self.config.get_corrupt_prob)
            {
                let mut corrupted = data.to_vec();
                let idx = {
                    let mut s = self.state.lock();
                    s.stats.get_corruptions += 1;
                    s.rng.gen_range(0, corrupted.len() as u64) as usize
                };
                corrupted[idx] ^= 0xFF;
                return Ok(Bytes::from(corrupted));
            }

            Ok(data)
        })
    }

    fn delete_if_exists<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.delete_attempts += 1;

            if roll(&self.state, chunk_faults::DELETE_FAIL, self.config.delete_fail_prob) {
                self.state.lock().stats.delete_failures += 1;
                return Err(IoError::new(ErrorKind::Other, "simulated delete failure"));
            }

            self.inner_store.delete_if_exists(batch_id, name).await
        })
    }

    fn list<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<String>>> + Send + 'a>> {
        self.inner_store.list(batch_id)
    }
}

// ============================================================================
// SimulatedRecordStore
// ============================================================================

/// Configuration for simulated record store faults
#[derive(Debug, Clone)]
pub struct SimulatedRecordStoreConfig {
    pub create_fail_prob: f64,
    /// Record created, but the caller sees a timeout
    pub create_ambiguous_prob: f64,
    pub read_fail_prob: f64,
    /// Update rejected before it is applied
    pub update_fail_prob: f64,
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedRecordStoreConfig {
    fn default() -> Self {
        SimulatedRecordStoreConfig {
            create_fail_prob: 0.01,
            create_ambiguous_prob: 0.005,
            read_fail_prob: 0.01,
            update_fail_prob: 0.01,
            latency_range_us: (0, 200),
        }
    }
}

impl SimulatedRecordStoreConfig {
    pub fn high_chaos() -> Self {
        SimulatedRecordStoreConfig {
            create_fail_prob: 0.05,
            create_ambiguous_prob: 0.03,
            read_fail_prob: 0.05,
            update_fail_prob: 0.05,
            latency_range_us: (0, 1_000),
        }
    }

    pub fn no_faults() -> Self {
        SimulatedRecordStoreConfig {
            create_fail_prob: 0.0,
            create_ambiguous_prob: 0.0,
            read_fail_prob: 0.0,
            update_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedRecordStoreStats {
    pub create_attempts: u64,
    pub create_failures: u64,
    pub create_ambiguous: u64,
    pub read_attempts: u64,
    pub read_failures: u64,
    pub update_attempts: u64,
    pub update_failures: u64,
}

/// Simulated record store that wraps another store and injects faults
pub struct SimulatedRecordStore<S: ItemRecordStore, R: Rng> {
    inner_store: S,
    config: SimulatedRecordStoreConfig,
    state: Arc<Mutex<SimulatedInner<R, SimulatedRecordStoreStats>>>,
}

impl<S: ItemRecordStore, R: Rng> SimulatedRecordStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedRecordStoreConfig) -> Self {
        SimulatedRecordStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedInner {
                rng,
                stats: SimulatedRecordStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedRecordStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }
}

impl<S: ItemRecordStore, R: Rng> ItemRecordStore for SimulatedRecordStore<S, R> {
    fn create_if_absent<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.create_attempts += 1;

            if roll(&self.state, record_faults::CREATE_FAIL, self.config.create_fail_prob) {
                self.state.lock().stats.create_failures += 1;
                return Err(RecordStoreError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated create failure",
                )));
            }

            simulate_latency(&self.state, self.config.latency_range_us).await;
            let token = self.inner_store.create_if_absent(key, record).await?;

            if roll(
                &self.state,
                record_faults::CREATE_AMBIGUOUS,
                self.config.create_ambiguous_prob,
            ) {
                self.state.lock().stats.create_ambiguous += 1;
                return Err(RecordStoreError::Io(IoError::new(
                    ErrorKind::TimedOut,
                    "simulated create timeout",
                )));
            }
            Ok(token)
        })
    }

    fn read<'a>(
        &'a self,
        key: &'a RecordKey,
    ) -> Pin<Box<dyn Future<Output = RecordResult<(ItemRecord, ConcurrencyToken)>> + Send + 'a>>
    {
        Box::pin(async move {
            self.state.lock().stats.read_attempts += 1;

            if roll(&self.state, record_faults::READ_FAIL, self.config.read_fail_prob) {
                self.state.lock().stats.read_failures += 1;
                return Err(RecordStoreError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated read failure",
                )));
            }

            simulate_latency(&self.state, self.config.latency_range_us).await;
            self.inner_store.read(key).await
        })
    }

    fn update_if_token_matches<'a>(
        &'a self,
        key: &'a RecordKey,
        record: ItemRecord,
        token: ConcurrencyToken,
    ) -> Pin<Box<dyn Future<Output = RecordResult<ConcurrencyToken>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.update_attempts += 1;

            if roll(&self.state, record_faults::UPDATE_FAIL, self.config.update_fail_prob) {
                self.state.lock().stats.update_failures += 1;
                return Err(RecordStoreError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated update failure",
                )));
            }

            simulate_latency(&self.state, self.config.latency_range_us).await;
            self.inner_store
                .update_if_token_matches(key, record, token)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::storage::{InMemoryChunkStore, InMemoryRecordStore};

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let store = SimulatedChunkStore::new(
            InMemoryChunkStore::new(),
            SimulatedRng::new(1),
            SimulatedChunkStoreConfig::no_faults(),
        );
        let batch = BatchId::from("b1");

        for i in 0..50 {
            let name = format!("{}.json", i);
            store.write(&batch, &name, Bytes::from_static(b"[]")).await.unwrap();
            assert_eq!(&store.read(&batch, &name).await.unwrap()[..], b"[]");
        }

        let stats = store.stats();
        assert_eq!(stats.put_attempts, 50);
        assert_eq!(stats.put_failures, 0);
        assert_eq!(stats.get_corruptions, 0);
    }

    #[tokio::test]
    async fn test_ambiguous_put_is_applied() {
        let config = SimulatedChunkStoreConfig {
            put_ambiguous_prob: 1.0,
            ..SimulatedChunkStoreConfig::no_faults()
        };
        let store = SimulatedChunkStore::new(InMemoryChunkStore::new(), SimulatedRng::new(2), config);
        let batch = BatchId::from("b1");

        let err = store
            .write(&batch, "1.json", Bytes::from_static(b"[\"a\"]"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(&store.inner().read(&batch, "1.json").await.unwrap()[..], b"[\"a\"]");
    }

    #[tokio::test]
    async fn test_corrupt_read_flips_a_byte() {
        let config = SimulatedChunkStoreConfig {
            get_corrupt_prob: 1.0,
            ..SimulatedChunkStoreConfig::no_faults()
        };
        let store = SimulatedChunkStore::new(InMemoryChunkStore::new(), SimulatedRng::new(3), config);
        let batch = BatchId::from("b1");

        store.write(&batch, "1.json", Bytes::from_static(b"[\"a\"]")).await.unwrap();
        let data = store.read(&batch, "1.json").await.unwrap();
        assert_ne!(&data[..], b"[\"a\"]");
        assert_eq!(store.stats().get_corruptions, 1);
    }

    #[tokio::test]
    async fn test_ambiguous_create_leaves_record() {
        let config = SimulatedRecordStoreConfig {
            create_ambiguous_prob: 1.0,
            ..SimulatedRecordStoreConfig::no_faults()
        };
        let store = SimulatedRecordStore::new(InMemoryRecordStore::new(), SimulatedRng::new(4), config);
        let record = ItemRecord::pending(BatchId::from("b1"), "i1");
        let key = record.key();

        let err = store.create_if_absent(&key, record.clone()).await.unwrap_err();
        assert!(err.is_transient());

        // A retry observes the record created by the "failed" attempt
        let err = store.inner().create_if_absent(&key, record).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Conflict));
    }

    #[tokio::test]
    async fn test_same_seed_same_faults() {
        async fn failures(seed: u64) -> Vec<bool> {
            let store = SimulatedChunkStore::new(
                InMemoryChunkStore::new(),
                SimulatedRng::new(seed),
                SimulatedChunkStoreConfig::high_chaos(),
            );
            let batch = BatchId::from("b1");
            let mut out = Vec::new();
            for i in 0..200 {
                let name = format!("{}.json", i);
                out.push(store.write(&batch, &name, Bytes::from_static(b"[]")).await.is_err());
            }
            out
        }

        assert_eq!(failures(42).await, failures(42).await);
    }
}
