//! Storage abstraction layer
//!
//! The pipeline consumes three capabilities: a blob store addressed by
//! bucket + path, a metadata store for organizations, datasets and training
//! runs, and a lease-lock backend. Memory and file backends implement all
//! three.

pub mod backends;
pub mod config;
pub mod error;
pub mod factory;
pub mod lock;
pub mod session;
pub mod traits;
pub mod types;


pub use backends::{FileBackend, MemoryBackend};
pub use config::{BackendType, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use factory::{StorageFactory, StorageHandles};
pub use lock::{LockBackend, LockManager, StorageLock, StorageLockGuard};
pub use session::{MetadataSession, SessionPool};
pub use traits::{BlobStore, MetadataStore};
pub use types::{
    BlobLocation, DatasetFilter, DatasetId, DatasetKind, DatasetStatus, HealthStatus, OrgId,
    Organization, RawDataset, TrainingRun, TrainingRunId, TrainingStatus,
};
