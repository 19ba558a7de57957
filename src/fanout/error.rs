//! Error taxonomy for the fan-out engine

use crate::batch::BatchId;
use crate::queue::{InvalidMessage, QueueError};
use crate::storage::{CodecError, RecordStoreError};

/// Errors surfaced by splitting, item processing and coordination
#[derive(Debug)]
pub enum FanoutError {
    /// Record already exists or token is stale. Part of the normal
    /// idempotency protocol; callers that see it treat it as a skip.
    Conflict(String),
    /// Store or queue I/O failure; the operation is safe to redeliver
    TransientStore(String),
    /// A conditional update failed on a token this caller exclusively held
    FatalConsistency(String),
    /// The user-supplied item handler failed
    Processing(String),
    /// A chunk payload could not be decoded
    Codec(CodecError),
    InvalidMessage(InvalidMessage),
    /// `start_batch` input rejected
    InvalidBatch(String),
    /// The batch's tracker actor is gone
    TrackerUnavailable(BatchId),
    Config(String),
}

impl FanoutError {
    /// Whether redelivering the message may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FanoutError::TransientStore(_) | FanoutError::Processing(_) | FanoutError::Codec(_)
        )
    }
}

impl std::fmt::Display for FanoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanoutError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            FanoutError::TransientStore(msg) => write!(f, "Transient store error: {}", msg),
            FanoutError::FatalConsistency(msg) => write!(f, "Fatal consistency violation: {}", msg),
            FanoutError::Processing(msg) => write!(f, "Item processing failed: {}", msg),
            FanoutError::Codec(e) => write!(f, "{}", e),
            FanoutError::InvalidMessage(e) => write!(f, "{}", e),
            FanoutError::InvalidBatch(msg) => write!(f, "Invalid batch: {}", msg),
            FanoutError::TrackerUnavailable(batch) => {
                write!(f, "Completion tracker unavailable for batch {}", batch)
            }
            FanoutError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for FanoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FanoutError::Codec(e) => Some(e),
            FanoutError::InvalidMessage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FanoutError {
    fn from(e: std::io::Error) -> Self {
        FanoutError::TransientStore(e.to_string())
    }
}

impl From<QueueError> for FanoutError {
    fn from(e: QueueError) -> Self {
        FanoutError::TransientStore(e.to_string())
    }
}

impl From<CodecError> for FanoutError {
    fn from(e: CodecError) -> Self {
        FanoutError::Codec(e)
    }
}

impl From<InvalidMessage> for FanoutError {
    fn from(e: InvalidMessage) -> Self {
        FanoutError::InvalidMessage(e)
    }
}

impl From<RecordStoreError> for FanoutError {
    fn from(e: RecordStoreError) -> Self {
        match e {
            RecordStoreError::Conflict | RecordStoreError::StaleToken => {
                FanoutError::Conflict(e.to_string())
            }
            // A record vanishing mid-protocol is treated like any other
            // store failure: redelivery restarts the protocol from creation.
            RecordStoreError::NotFound | RecordStoreError::Io(_) => {
                FanoutError::TransientStore(e.to_string())
            }
        }
    }
}

pub type FanoutResult<T> = Result<T, FanoutError>;
