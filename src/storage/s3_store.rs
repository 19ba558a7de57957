//! S3 Chunk Store Implementation
//!
//! Uses the `object_store` crate. Works against AWS S3 and S3-compatible
//! services (MinIO, LocalStack) via a custom endpoint.

use crate::batch::BatchId;
use crate::fanout::config::S3Config;
use crate::storage::chunk_store::{object_key, ChunkStore};
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as ObjectStoreTrait;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;

/// S3-backed chunk store
#[derive(Clone)]
pub struct S3ChunkStore {
    store: Arc<dyn ObjectStoreTrait>,
    prefix: String,
}

impl S3ChunkStore {
    /// Create a new S3 chunk store
    ///
    /// Credentials come from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn new(config: &S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default())
            .with_secret_access_key(std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default());

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ChunkStore {
            store: Arc::new(store),
            prefix: config.prefix.clone(),
        })
    }

    /// Wrap an existing object store (for testing)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, prefix: String) -> Self {
        S3ChunkStore { store, prefix }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl std::fmt::Debug for S3ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ChunkStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ChunkStore for S3ChunkStore {
    fn write<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(&object_key(batch_id, name));
            self.store
                .put(&path, data.into())
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn read<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(&object_key(batch_id, name));
            let result = self.store.get(&path).await.map_err(Self::map_error)?;
            result.bytes().await.map_err(Self::map_error)
        })
    }

    fn delete_if_exists<'a>(
        &'a self,
        batch_id: &'a BatchId,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(&object_key(batch_id, name));
            // S3 DELETE does not report whether the object existed
            match self.store.head(&path).await {
                Ok(_) => {}
                Err(object_store::Error::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(Self::map_error(e)),
            }
            match self.store.delete(&path).await {
                Ok(()) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(
        &'a self,
        batch_id: &'a BatchId,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            use futures::TryStreamExt;

            let prefix = self.full_path(batch_id.as_str());
            let objects: Vec<_> = self
                .store
                .list(Some(&prefix))
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut names: Vec<String> = objects
                .into_iter()
                .filter_map(|meta| meta.location.filename().map(str::to_string))
                .collect();
            names.sort();
            Ok(names)
        })
    }
}
