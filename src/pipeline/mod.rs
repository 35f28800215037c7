//! Pipeline orchestration
//!
//! The [`Pipeline`] drives ingest, feature derivation, training and
//! prediction for every organization. Feature and training stages run on a
//! bounded worker pool and report their outcome only through the records
//! they persist; a [`StageHandle`] is an optional in-process completion
//! signal on top of that.

pub mod orchestrator;
pub mod single_flight;
pub mod stages;
pub mod worker;

pub use orchestrator::{Pipeline, TrainingStatusReport, TrainingStatusView, TrainingTicket};
pub use single_flight::{SingleFlight, TrainingLease};
pub use stages::{DATASETS_BUCKET, FEATURES_BUCKET};
pub use worker::{CancellationToken, StageExecutor, StageHandle};

use crate::artifact::ArtifactStore;
use crate::config::PipelineConfig;
use crate::features::FeatureDeriver;
use crate::model::Trainer;
use crate::storage::{SessionPool, StorageHandles};

/// Everything a stage needs, shared by all invocations
pub(crate) struct StageContext {
    pub config: PipelineConfig,
    pub storage: StorageHandles,
    pub sessions: SessionPool,
    pub artifacts: ArtifactStore,
    pub deriver: FeatureDeriver,
    pub trainer: Trainer,
    pub single_flight: SingleFlight,
}

impl StageContext {
    pub fn new(config: PipelineConfig, storage: StorageHandles) -> Self {
        let sessions = SessionPool::new(
            storage.metadata.clone(),
            config.storage.connection_pool_size,
            config.storage.timeout,
        );
        let single_flight = SingleFlight::new(
            storage.locks.clone(),
            config.training_lock_ttl,
            config.training_lock_wait,
        );
        Self {
            artifacts: ArtifactStore::new(storage.blobs.clone()),
            deriver: FeatureDeriver::new(config.features.clone()),
            trainer: Trainer::new(config.training.clone()),
            sessions,
            single_flight,
            storage,
            config,
        }
    }
}
