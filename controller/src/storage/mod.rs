//! Blob storage interface for archived step logs.
//!
//! The real backend is an external service; the controller only needs a put
//! operation keyed by `<namespace>/<pod>/<container>`.

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, data: Vec<u8>) -> Result<(), StorageError>;
}

/// In-memory store for tests and local runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (String, Vec<u8>)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<(String, Vec<u8>)> {
        self.blobs.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, content_type: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.blobs
            .insert(key.to_owned(), (content_type.to_owned(), data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryBlobStore::new();
        store
            .put("ns/pod/container", "application/octet-stream", b"log line\n".to_vec())
            .await
            .unwrap();

        let (content_type, data) = store.get("ns/pod/container").unwrap();
        assert_eq!(content_type, "application/octet-stream");
        assert_eq!(data, b"log line\n");
    }
}
