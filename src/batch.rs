//! Batch and chunk identities shared by storage, queue and fan-out code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the chunk holding a batch's full item list
pub const ROOT_CHUNK: &str = "1.json";

const CHUNK_EXT: &str = ".json";

/// Opaque, unique batch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Allocate a fresh random id
    pub fn generate() -> Self {
        BatchId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids appear in `{batch}/{chunk}` and `{batch}|{item}` messages, so
    /// neither separator may occur inside one.
    pub fn is_valid(raw: &str) -> bool {
        !raw.is_empty() && !raw.contains('/') && !raw.contains('|')
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        debug_assert!(BatchId::is_valid(s), "invalid batch id: {:?}", s);
        BatchId(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        debug_assert!(BatchId::is_valid(&s), "invalid batch id: {:?}", s);
        BatchId(s)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a stored chunk: `(batchId, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub batch_id: BatchId,
    pub name: String,
}

impl ChunkRef {
    pub fn new(batch_id: BatchId, name: impl Into<String>) -> Self {
        ChunkRef {
            batch_id,
            name: name.into(),
        }
    }

    pub fn root(batch_id: BatchId) -> Self {
        ChunkRef::new(batch_id, ROOT_CHUNK)
    }

    /// Name of the `idx`-th child produced when this chunk is split.
    ///
    /// `1.json` -> `1-0.json`, `1-1.json`; `1-0.json` -> `1-0-0.json`, ...
    pub fn child(&self, idx: usize) -> ChunkRef {
        let stem = self.name.strip_suffix(CHUNK_EXT).unwrap_or(&self.name);
        ChunkRef::new(self.batch_id.clone(), format!("{}-{}{}", stem, idx, CHUNK_EXT))
    }

    /// Number of splits between the root and this chunk
    pub fn depth(&self) -> usize {
        self.name.matches('-').count()
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.batch_id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = BatchId::generate();
        let b = BatchId::generate();
        assert_ne!(a, b);
        assert!(BatchId::is_valid(a.as_str()));
    }

    #[test]
    fn test_child_naming() {
        let root = ChunkRef::root(BatchId::from("b1"));
        assert_eq!(root.depth(), 0);

        let left = root.child(0);
        let right = root.child(1);
        assert_eq!(left.name, "1-0.json");
        assert_eq!(right.name, "1-1.json");
        assert_eq!(right.child(0).name, "1-1-0.json");
        assert_eq!(right.child(0).depth(), 2);
        assert_eq!(left.to_string(), "b1/1-0.json");
    }

    #[test]
    fn test_invalid_batch_ids() {
        assert!(!BatchId::is_valid(""));
        assert!(!BatchId::is_valid("a/b"));
        assert!(!BatchId::is_valid("a|b"));
    }
}
