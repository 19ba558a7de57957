//! Chunk Store Abstraction
//!
//! Durable blob storage addressed by `(batchId, name)`. Chunk payloads are
//! written once and never modified; a consumed chunk is deleted best-effort.
//!
//! Implementations:
//! - `InMemoryChunkStore`: For unit tests and DST
//! - `LocalFsChunkStore`: For development and single-host runs
//! - `S3ChunkStore`: For production (feature-gated)

use crate::batch::BatchId;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Flat object key for a chunk
pub fn object_key(batch_id: &BatchId, name: &str) -> String {
    format!("{}/{}", batch_id, name)
}

/// Chunk store abstraction trait
pub trait ChunkStore: Send + Sync + 'static {
    /// Write a chunk (create or overwrite)
    fn write<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Read a chunk's payload. Missing chunks fail with `ErrorKind::NotFound`.
    fn read<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Bytes>> + Send + 'a>>;

    /// Delete a chunk. Returns false if it did not exist.
    fn delete_if_exists<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>>;

    /// Names of all chunks stored for a batch, sorted
    fn list<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<String>>> + Send + 'a>>;
}

// ============================================================================
// InMemoryChunkStore - For tests and DST
// ============================================================================

/// In-memory chunk store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemoryChunkStore {
    data: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all batches
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn write<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.data.write().insert(object_key(batch_id, name), data);
            Ok(())
        })
    }

    fn read<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let key = object_key(batch_id, name);
            self.data
                .read()
                .get(&key)
                .cloned()
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Chunk not found: {}", key)))
        })
    }

    fn delete_if_exists<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.data.write().remove(&object_key(batch_id, name)).is_some()) })
    }

    fn list<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            let prefix = format!("{}/", batch_id);
            let mut names: Vec<String> = self
                .data
                .read()
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                .collect();
            names.sort();
            Ok(names)
        })
    }
}

// ============================================================================
// LocalFsChunkStore - For development
// ============================================================================

/// Local filesystem chunk store: one directory per batch
#[derive(Debug, Clone)]
pub struct LocalFsChunkStore {
    base_path: PathBuf,
}

impl LocalFsChunkStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsChunkStore { base_path }
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn batch_dir(&self, batch_id: &BatchId) -> PathBuf {
        self.base_path.join(batch_id.as_str())
    }

    fn full_path(&self, batch_id: &BatchId, name: &str) -> PathBuf {
        self.batch_dir(batch_id).join(name)
    }
}

impl ChunkStore for LocalFsChunkStore {
    fn write<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(self.batch_dir(batch_id)).await?;
            // Write to a temp file then rename, so readers never observe a
            // partially written chunk.
            let path = self.full_path(batch_id, name);
            let tmp = self.full_path(batch_id, &format!(".{}.tmp", name));
            tokio::fs::write(&tmp, &data).await?;
            tokio::fs::rename(&tmp, &path).await
        })
    }

    fn read<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let data = tokio::fs::read(self.full_path(batch_id, name)).await?;
            Ok(Bytes::from(data))
        })
    }

    fn delete_if_exists<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(batch_id, name)).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(self.batch_dir(batch_id)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };

            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with('.') {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
    }
}
