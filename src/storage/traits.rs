//! Core trait definitions for the storage abstraction layer

use async_trait::async_trait;

use super::error::StorageResult;
use super::types::*;

/// Key/value byte store addressed by bucket + path
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `bucket/folder/name`; a name is generated when omitted
    async fn put(
        &self,
        bytes: Vec<u8>,
        bucket: &str,
        folder: &str,
        name: Option<&str>,
    ) -> StorageResult<BlobLocation>;

    /// Fetch the bytes at `bucket/path`, failing with `NotFound` when absent
    async fn get(&self, bucket: &str, path: &str) -> StorageResult<Vec<u8>>;

    /// Check whether a blob exists
    async fn exists(&self, bucket: &str, path: &str) -> StorageResult<bool>;
}

/// Record store for organizations, datasets and training runs
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create or replace an organization
    async fn save_organization(&self, organization: &Organization) -> StorageResult<()>;

    /// Load an organization by ID
    async fn load_organization(&self, id: &OrgId) -> StorageResult<Option<Organization>>;

    /// Create or replace a dataset record
    async fn save_dataset(&self, dataset: &RawDataset) -> StorageResult<()>;

    /// Load a dataset by ID
    async fn load_dataset(&self, id: &DatasetId) -> StorageResult<Option<RawDataset>>;

    /// Most recently created dataset matching the filter
    async fn latest_dataset(&self, filter: &DatasetFilter) -> StorageResult<Option<RawDataset>>;

    /// Create or replace a training run
    async fn save_training_run(&self, run: &TrainingRun) -> StorageResult<()>;

    /// Load a training run by ID
    async fn load_training_run(&self, id: &TrainingRunId) -> StorageResult<Option<TrainingRun>>;

    /// All training runs for an organization, newest first
    async fn list_training_runs(&self, organization_id: &OrgId) -> StorageResult<Vec<TrainingRun>>;

    /// Check the health of the storage backend
    async fn health_check(&self) -> StorageResult<HealthStatus>;
}

