//! Recursive batch fan-out
//!
//! A batch of item ids is written as one root chunk. Split tasks halve
//! chunks until every chunk is at or below the split threshold, leaf chunks
//! fan out into one item task per id, and item tasks run the user handler
//! exactly once per item in effect. A per-batch tracker actor folds every
//! "file processed" and "item processed" signal into one completion decision.
//!
//! ```text
//!   start_batch ──► root chunk ──► split queue ──► BatchSplitter ─┬─► child chunks ─► split queue
//!                                                                 └─► item queue ──► ItemProcessor
//!                          │                          │                                   │
//!                          └──── Initialise ──────────┴──── FileProcessed ── ItemProcessed┘
//!                                                     ▼
//!                                              TrackerActor (per batch)
//! ```

pub mod config;
pub mod coordinator;
pub mod dst;
pub mod engine;
pub mod error;
pub mod processor;
pub mod splitter;
pub mod tracker;
pub mod worker;

pub use config::{FanoutConfig, QueueConfig, StoreConfig, StoreType, TrackerConfig, WorkerConfig};
pub use coordinator::BatchCoordinator;
pub use dst::{
    run_fanout_dst_batch, summarize_fanout_batch, FanoutDSTConfig, FanoutDSTHarness,
    FanoutDSTResult, RecordingHandler,
};
pub use engine::{EngineComponents, FanoutEngine};
pub use error::{FanoutError, FanoutResult};
pub use processor::{DelayHandler, HandlerError, ItemHandler, ItemOutcome, ItemProcessor};
pub use splitter::{split_in_half, BatchSplitter, SplitOutcome, SplitPlan};
pub use tracker::{
    BatchObserver, BatchStatus, CompletionState, LoggingObserver, TrackerRegistry, TrackerSignal,
    Transition,
};
pub use worker::{WorkerPool, WorkerStats, WorkerStatsSnapshot};
