//! Fault identifier catalogue
//!
//! Ids are `<component>.<fault>` strings so per-fault probabilities can be
//! configured in [`FaultConfig`](super::FaultConfig) and reported in stats.

pub mod chunk_store {
    /// Write rejected, nothing stored
    pub const PUT_FAIL: &str = "chunk_store.put_fail";
    /// Write stored but the caller sees a timeout
    pub const PUT_AMBIGUOUS: &str = "chunk_store.put_ambiguous";
    pub const GET_FAIL: &str = "chunk_store.get_fail";
    /// Read returns flipped bytes
    pub const GET_CORRUPT: &str = "chunk_store.get_corrupt";
    pub const DELETE_FAIL: &str = "chunk_store.delete_fail";
}

pub mod record_store {
    pub const CREATE_FAIL: &str = "record_store.create_fail";
    /// Record created but the caller sees a timeout
    pub const CREATE_AMBIGUOUS: &str = "record_store.create_ambiguous";
    pub const READ_FAIL: &str = "record_store.read_fail";
    pub const UPDATE_FAIL: &str = "record_store.update_fail";
}

pub mod queue {
    pub const ENQUEUE_FAIL: &str = "queue.enqueue_fail";
    /// Message is delivered one extra time
    pub const DUPLICATE_DELIVERY: &str = "queue.duplicate_delivery";
    /// Message lands at a random position instead of the tail
    pub const REORDER: &str = "queue.reorder";
    /// Consumer's ack is lost and the message is redelivered
    pub const ACK_LOST: &str = "queue.ack_lost";
}

pub mod handler {
    /// Item handler invocation fails
    pub const FAIL: &str = "handler.fail";
}

pub mod tracker {
    /// Tracker actor drops memory and reloads its committed state
    pub const RESTART: &str = "tracker.restart";
}

/// Every fault id, for configuration presets
pub const ALL_FAULTS: &[&str] = &[
    chunk_store::PUT_FAIL,
    chunk_store::PUT_AMBIGUOUS,
    chunk_store::GET_FAIL,
    chunk_store::GET_CORRUPT,
    chunk_store::DELETE_FAIL,
    record_store::CREATE_FAIL,
    record_store::CREATE_AMBIGUOUS,
    record_store::READ_FAIL,
    record_store::UPDATE_FAIL,
    queue::ENQUEUE_FAIL,
    queue::DUPLICATE_DELIVERY,
    queue::REORDER,
    queue::ACK_LOST,
    handler::FAIL,
    tracker::RESTART,
];
