//! # Churnwise
//!
//! Multi-tenant customer churn modeling: ingest per-customer event histories,
//! derive behavioral features, label customers against an inactivity
//! threshold, train a binary classifier and serve churn probabilities.
//!
//! ## Modules
//!
//! - `features` - Event model, CSV codecs and the feature deriver
//! - `labeling` - Inactivity threshold to churn label
//! - `split` - Random and temporal train/test partitioning
//! - `model` - Classifiers, evaluation metrics and the trainer
//! - `artifact` - Per-organization model persistence over a blob store
//! - `storage` - Blob, metadata and lock storage with memory and file backends
//! - `pipeline` - Orchestrator, stage worker pool and training single-flight
//! - `config` - TOML configuration with environment overrides
//! - `logging` - Tracing subscriber setup
//! - `error` - Error taxonomy and numeric error codes
pub mod artifact;
pub mod config;
pub mod error;
pub mod features;
pub mod labeling;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod split;
pub mod storage;

pub use config::PipelineConfig;
pub use error::ChurnError;
pub use features::{CustomerEvent, CustomerFeatureVector};
pub use model::{Algorithm, Prediction, RiskSegment, TrainingMetrics};
pub use pipeline::{Pipeline, TrainingStatusReport, TrainingTicket};

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ChurnError>;
