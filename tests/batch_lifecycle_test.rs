//! Batch lifecycle tests through the public engine API

use batch_fanout::batch::BatchId;
use batch_fanout::fanout::{
    BatchStatus, EngineComponents, FanoutConfig, FanoutEngine, FanoutError, HandlerError,
    ItemHandler, SplitPlan,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Counts calls per (batch, item)
#[derive(Default)]
struct CountingHandler {
    calls: Mutex<HashMap<(String, String), u32>>,
}

impl CountingHandler {
    fn calls_for(&self, batch_id: &BatchId) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter(|((b, _), _)| b == batch_id.as_str())
            .map(|(_, n)| *n)
            .collect()
    }
}

impl ItemHandler for CountingHandler {
    fn process<'a>(
        &'a self,
        batch_id: &'a BatchId,
        item_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            *self
                .calls
                .lock()
                .entry((batch_id.to_string(), item_id.to_string()))
                .or_insert(0) += 1;
            Ok(())
        })
    }
}

fn start(config: FanoutConfig, handler: Arc<CountingHandler>) -> FanoutEngine {
    let components = EngineComponents::in_memory(&config);
    FanoutEngine::start(config, components, handler).unwrap()
}

fn customers(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-{}", prefix, i)).collect()
}

#[tokio::test]
async fn test_250_items_threshold_100() {
    let handler = Arc::new(CountingHandler::default());
    let config = FanoutConfig {
        split_threshold: 100,
        ..FanoutConfig::test()
    };
    let engine = start(config, handler.clone());

    let batch = engine.start_batch(customers("cust", 250)).await.unwrap();
    let status = engine
        .wait_for_completion(&batch, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, BatchStatus::Completed);

    // 250 -> 125,125 -> 63,62,63,62
    let plan = SplitPlan::compute(250, 100);
    assert_eq!(plan.leaf_sizes, vec![63, 62, 63, 62]);

    let state = engine.snapshot(&batch).await.unwrap();
    assert_eq!(state.expected_item_count, 250);
    assert_eq!(state.processed_item_count, 250);
    assert_eq!(state.files_remaining, 0);
    assert_eq!(state.settled_chunks.len(), plan.chunks);

    let calls = handler.calls_for(&batch);
    assert_eq!(calls.len(), 250);
    assert!(calls.iter().all(|n| *n == 1));

    let stats = engine.shutdown().await;
    assert_eq!(stats.chunks_split, 3);
    assert_eq!(stats.chunks_fanned_out, 4);
    assert_eq!(stats.items_processed, 250);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn test_batch_at_threshold_is_not_split() {
    let handler = Arc::new(CountingHandler::default());
    let engine = start(FanoutConfig::test(), handler.clone());

    let batch = engine.start_batch(customers("c", 10)).await.unwrap();
    assert_eq!(
        engine
            .wait_for_completion(&batch, Duration::from_secs(5))
            .await
            .unwrap(),
        BatchStatus::Completed
    );

    let stats = engine.shutdown().await;
    assert_eq!(stats.chunks_split, 0);
    assert_eq!(stats.chunks_fanned_out, 1);
    assert_eq!(stats.items_processed, 10);
}

#[tokio::test]
async fn test_concurrent_batches_complete_independently() {
    let handler = Arc::new(CountingHandler::default());
    let engine = start(FanoutConfig::test(), handler.clone());

    let sizes = [1usize, 37, 120];
    let mut batches = Vec::new();
    for (i, n) in sizes.iter().enumerate() {
        let batch = engine
            .start_batch(customers(&format!("b{}", i), *n))
            .await
            .unwrap();
        batches.push((batch, *n));
    }

    for (batch, n) in &batches {
        let status = engine
            .wait_for_completion(batch, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status, BatchStatus::Completed, "batch {}", batch);

        let state = engine.snapshot(batch).await.unwrap();
        assert_eq!(state.processed_item_count, *n as u64);
        assert_eq!(handler.calls_for(batch).len(), *n);
    }

    let stats = engine.shutdown().await;
    assert_eq!(stats.items_processed, 158);
}

#[tokio::test]
async fn test_duplicate_item_ids_rejected() {
    let engine = start(FanoutConfig::test(), Arc::new(CountingHandler::default()));

    let result = engine
        .start_batch(vec!["a".to_string(), "b".to_string(), "a".to_string()])
        .await;
    assert!(matches!(result, Err(FanoutError::InvalidBatch(_))));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_batch_id_rejected() {
    let engine = start(FanoutConfig::test(), Arc::new(CountingHandler::default()));

    let reserved: BatchId = serde_json::from_str("\"tenant/42\"").unwrap();
    let result = engine
        .start_batch_with_id(reserved, vec!["a".to_string()])
        .await;
    assert!(matches!(result, Err(FanoutError::InvalidBatch(_))));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_terminate_mid_batch() {
    let handler = Arc::new(CountingHandler::default());
    let engine = start(FanoutConfig::test(), handler);

    let batch = engine.start_batch(customers("t", 500)).await.unwrap();
    engine.terminate(&batch).unwrap();

    let status = engine
        .wait_for_completion(&batch, Duration::from_secs(10))
        .await
        .unwrap();
    // Termination races the workers; either way the status is terminal
    assert!(status.is_terminal());
    engine.shutdown().await;
}
