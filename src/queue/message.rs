//! Work message wire format
//!
//! - split task: `{batchId}/{chunkName}`
//! - item task: `{batchId}|{itemId}`
//!
//! Batch ids never contain `/` or `|`. Item ids may contain `/`, so the
//! item separator is checked first and only the first `|` splits.

use crate::batch::{BatchId, ChunkRef};
use std::fmt;

/// A unit of work carried by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkMessage {
    /// Split (or fan out) the referenced chunk
    Split(ChunkRef),
    /// Process one item of a batch
    Item { batch_id: BatchId, item_id: String },
}

/// Malformed message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMessage(pub String);

impl fmt::Display for InvalidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid work message: {:?}", self.0)
    }
}

impl std::error::Error for InvalidMessage {}

impl WorkMessage {
    pub fn split(chunk: ChunkRef) -> Self {
        WorkMessage::Split(chunk)
    }

    pub fn item(batch_id: BatchId, item_id: impl Into<String>) -> Self {
        WorkMessage::Item {
            batch_id,
            item_id: item_id.into(),
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        match self {
            WorkMessage::Split(chunk) => &chunk.batch_id,
            WorkMessage::Item { batch_id, .. } => batch_id,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            WorkMessage::Split(chunk) => format!("{}/{}", chunk.batch_id, chunk.name),
            WorkMessage::Item { batch_id, item_id } => format!("{}|{}", batch_id, item_id),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, InvalidMessage> {
        if let Some((batch, item)) = raw.split_once('|') {
            if !BatchId::is_valid(batch) {
                return Err(InvalidMessage(raw.to_string()));
            }
            return Ok(WorkMessage::item(BatchId::from(batch), item));
        }

        match raw.split_once('/') {
            Some((batch, name))
                if BatchId::is_valid(batch) && !name.is_empty() && !name.contains('/') =>
            {
                Ok(WorkMessage::Split(ChunkRef::new(BatchId::from(batch), name)))
            }
            _ => Err(InvalidMessage(raw.to_string())),
        }
    }
}

impl fmt::Display for WorkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
