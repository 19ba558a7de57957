//! Fan-out engine: wires stores, queues, trackers and workers together.

use crate::batch::BatchId;
use crate::fanout::config::{FanoutConfig, StoreType};
use crate::fanout::coordinator::BatchCoordinator;
use crate::fanout::error::{FanoutError, FanoutResult};
use crate::fanout::processor::{ItemHandler, ItemProcessor};
use crate::fanout::splitter::BatchSplitter;
use crate::fanout::tracker::{BatchObserver, BatchStatus, CompletionState, LoggingObserver, TrackerRegistry};
use crate::fanout::worker::{WorkerPool, WorkerStatsSnapshot};
use crate::queue::{InMemoryWorkQueue, WorkQueue};
use crate::storage::{
    BlobTrackerStore, ChunkStore, InMemoryChunkStore, InMemoryRecordStore, ItemRecordStore,
    LocalFsChunkStore, TrackerStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// External collaborators the engine runs against
#[derive(Clone)]
pub struct EngineComponents {
    pub chunks: Arc<dyn ChunkStore>,
    pub tracker_store: Arc<dyn TrackerStore>,
    pub records: Arc<dyn ItemRecordStore>,
    pub split_queue: Arc<dyn WorkQueue>,
    pub item_queue: Arc<dyn WorkQueue>,
    pub observer: Arc<dyn BatchObserver>,
}

impl EngineComponents {
    /// Everything in memory, queues configured from `config.queue`
    pub fn in_memory(config: &FanoutConfig) -> Self {
        let chunks: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
        Self::with_chunk_store(config, chunks)
    }

    /// Chunk store selected by `config.store`; tracker state shares it
    pub fn from_config(config: &FanoutConfig) -> FanoutResult<Self> {
        let chunks: Arc<dyn ChunkStore> = match config.store.store_type {
            StoreType::Memory => Arc::new(InMemoryChunkStore::new()),
            StoreType::LocalFs => {
                let path = config.store.local_path.clone().ok_or_else(|| {
                    FanoutError::Config("store.local_path is required for localfs".to_string())
                })?;
                Arc::new(LocalFsChunkStore::new(path))
            }
            #[cfg(feature = "s3")]
            StoreType::S3 => {
                let s3 = config.store.s3.as_ref().ok_or_else(|| {
                    FanoutError::Config("store.s3 is required for the s3 store".to_string())
                })?;
                Arc::new(
                    crate::storage::S3ChunkStore::new(s3)
                        .map_err(|e| FanoutError::Config(e.to_string()))?,
                )
            }
            #[cfg(not(feature = "s3"))]
            StoreType::S3 => {
                return Err(FanoutError::Config(
                    "s3 store requested but the s3 feature is not enabled".to_string(),
                ))
            }
        };
        Ok(Self::with_chunk_store(config, chunks))
    }

    fn with_chunk_store(config: &FanoutConfig, chunks: Arc<dyn ChunkStore>) -> Self {
        let queue = || InMemoryWorkQueue::new(config.queue.max_deliveries, config.queue.redelivery_delay);
        EngineComponents {
            tracker_store: Arc::new(BlobTrackerStore::new(chunks.clone())),
            chunks,
            records: Arc::new(InMemoryRecordStore::new()),
            split_queue: Arc::new(queue()),
            item_queue: Arc::new(queue()),
            observer: Arc::new(LoggingObserver),
        }
    }
}

/// A running fan-out engine
pub struct FanoutEngine {
    coordinator: BatchCoordinator,
    trackers: TrackerRegistry,
    workers: WorkerPool,
    config: FanoutConfig,
}

impl FanoutEngine {
    pub fn start(
        config: FanoutConfig,
        components: EngineComponents,
        handler: Arc<dyn ItemHandler>,
    ) -> FanoutResult<Self> {
        config.validate()?;

        let trackers = TrackerRegistry::with_observer(
            components.tracker_store,
            config.tracker.clone(),
            components.observer,
        );
        let coordinator = BatchCoordinator::new(
            components.chunks.clone(),
            components.split_queue.clone(),
            trackers.clone(),
        );
        let splitter = Arc::new(BatchSplitter::new(
            components.chunks,
            components.split_queue.clone(),
            components.item_queue.clone(),
            trackers.clone(),
            config.split_threshold,
        ));
        let processor = Arc::new(ItemProcessor::new(components.records, handler, trackers.clone()));
        let workers = WorkerPool::start(
            &config.workers,
            components.split_queue,
            components.item_queue,
            splitter,
            processor,
        );

        info!(
            split_threshold = config.split_threshold,
            split_workers = config.workers.split_workers,
            item_workers = config.workers.item_workers,
            "Fan-out engine started"
        );
        Ok(FanoutEngine {
            coordinator,
            trackers,
            workers,
            config,
        })
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn trackers(&self) -> &TrackerRegistry {
        &self.trackers
    }

    pub async fn start_batch(&self, items: Vec<String>) -> FanoutResult<BatchId> {
        self.coordinator.start_batch(items).await
    }

    pub async fn start_batch_with_id(
        &self,
        batch_id: BatchId,
        items: Vec<String>,
    ) -> FanoutResult<BatchId> {
        self.coordinator.start_batch_with_id(batch_id, items).await
    }

    /// Wait for the batch to finish. On timeout, the current status is
    /// returned instead.
    pub async fn wait_for_completion(
        &self,
        batch_id: &BatchId,
        timeout: Duration,
    ) -> FanoutResult<BatchStatus> {
        match tokio::time::timeout(
            timeout,
            self.trackers.wait_for_status(batch_id, BatchStatus::Completed),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => self.trackers.status(batch_id).await,
        }
    }

    pub async fn snapshot(&self, batch_id: &BatchId) -> FanoutResult<CompletionState> {
        self.trackers.snapshot(batch_id).await
    }

    pub fn terminate(&self, batch_id: &BatchId) -> FanoutResult<()> {
        self.trackers.terminate(batch_id)
    }

    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.workers.stats()
    }

    /// Stop workers, then trackers
    pub async fn shutdown(self) -> WorkerStatsSnapshot {
        let stats = self.workers.shutdown().await;
        self.trackers.shutdown().await;
        info!(?stats, "Fan-out engine stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::processor::DelayHandler;

    fn engine(config: FanoutConfig) -> FanoutEngine {
        let components = EngineComponents::in_memory(&config);
        FanoutEngine::start(config, components, Arc::new(DelayHandler::new(Duration::ZERO))).unwrap()
    }

    #[tokio::test]
    async fn test_engine_completes_batch() {
        let engine = engine(FanoutConfig::test());
        let items: Vec<String> = (0..57).map(|i| format!("cust-{}", i)).collect();

        let batch = engine.start_batch(items).await.unwrap();
        let status = engine
            .wait_for_completion(&batch, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status, BatchStatus::Completed);

        let state = engine.snapshot(&batch).await.unwrap();
        assert_eq!(state.expected_item_count, 57);
        assert_eq!(state.processed_item_count, 57);
        assert_eq!(state.files_remaining, 0);

        // The completing item is counted once its ack is settled
        for _ in 0..100 {
            if engine.worker_stats().items_processed == 57 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.worker_stats().items_processed, 57);

        let stats = engine.shutdown().await;
        assert_eq!(stats.items_processed, 57);
    }

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let engine = engine(FanoutConfig::test());
        let batch = engine.start_batch(Vec::new()).await.unwrap();
        assert_eq!(
            engine
                .wait_for_completion(&batch, Duration::from_secs(5))
                .await
                .unwrap(),
            BatchStatus::Completed
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminated_batch_does_not_complete() {
        let engine = engine(FanoutConfig::test());
        let batch = BatchId::from("halted");
        engine.terminate(&batch).unwrap();

        engine
            .start_batch_with_id(batch.clone(), vec!["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(
            engine
                .wait_for_completion(&batch, Duration::from_secs(5))
                .await
                .unwrap(),
            BatchStatus::Terminated
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let config = FanoutConfig {
            split_threshold: 0,
            ..FanoutConfig::test()
        };
        let components = EngineComponents::in_memory(&config);
        let result = FanoutEngine::start(config, components, Arc::new(DelayHandler::new(Duration::ZERO)));
        assert!(matches!(result, Err(FanoutError::Config(_))));
    }

    #[tokio::test]
    async fn test_localfs_components() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FanoutConfig::test();
        config.store.store_type = StoreType::LocalFs;
        config.store.local_path = Some(dir.path().to_path_buf());

        let components = EngineComponents::from_config(&config).unwrap();
        let engine =
            FanoutEngine::start(config, components, Arc::new(DelayHandler::new(Duration::ZERO))).unwrap();
        let batch = engine
            .start_batch((0..25).map(|i| i.to_string()).collect())
            .await
            .unwrap();
        assert_eq!(
            engine
                .wait_for_completion(&batch, Duration::from_secs(10))
                .await
                .unwrap(),
            BatchStatus::Completed
        );
        engine.shutdown().await;
    }
}
