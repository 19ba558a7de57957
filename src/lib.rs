pub mod io;
pub mod buggify;
pub mod batch;
pub mod storage;
pub mod queue;
pub mod fanout;
pub mod observability;

#[cfg(test)]
mod stateright;

pub use batch::{BatchId, ChunkRef};
pub use fanout::{
    BatchCoordinator, BatchSplitter, BatchStatus, EngineComponents, FanoutConfig, FanoutEngine, FanoutError,
    FanoutResult, ItemHandler, ItemProcessor,
};
pub use queue::{WorkMessage, WorkQueue};
pub use storage::{ChunkStore, ItemRecordStore, TrackerStore};
