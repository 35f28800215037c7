//! Storage factory for creating storage instances

use std::sync::Arc;

use super::backends::{FileBackend, MemoryBackend};
use super::config::{BackendType, StorageConfig};
use super::error::StorageResult;
use super::lock::LockBackend;
use super::traits::{BlobStore, MetadataStore};

/// The three storage capabilities the pipeline consumes
#[derive(Clone)]
pub struct StorageHandles {
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub locks: Arc<dyn LockBackend>,
}

impl StorageHandles {
    /// Use one backend for blobs, metadata and locks
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: BlobStore + MetadataStore + LockBackend + 'static,
    {
        Self {
            blobs: backend.clone(),
            metadata: backend.clone(),
            locks: backend,
        }
    }
}

/// Factory for creating storage instances
pub struct StorageFactory;

impl StorageFactory {
    /// Create storage from explicit configuration
    pub async fn from_config(config: &StorageConfig) -> StorageResult<StorageHandles> {
        match config.backend {
            BackendType::File => {
                let backend = FileBackend::new(&config.base_dir).await?;
                Ok(StorageHandles::from_backend(Arc::new(backend)))
            }
            BackendType::Memory => Ok(StorageHandles::from_backend(Arc::new(MemoryBackend::new()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_creates_file_backend() {
        let temp = tempfile::TempDir::new().unwrap();
        let storage = StorageFactory::from_config(&StorageConfig::file(temp.path()))
            .await
            .unwrap();
        let health = storage.metadata.health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.backend_type, "file");
    }

    #[tokio::test]
    async fn test_factory_creates_memory_backend() {
        let storage = StorageFactory::from_config(&StorageConfig::memory())
            .await
            .unwrap();
        let health = storage.metadata.health_check().await.unwrap();
        assert_eq!(health.backend_type, "memory");
    }
}
