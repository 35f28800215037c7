//! Record types persisted by the metadata and blob stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ChurnError;
use crate::model::{Algorithm, TrainingMetrics};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ChurnError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| ChurnError::validation(format!("invalid identifier '{s}': {e}")))
            }
        }
    };
}

record_id!(
    /// Organization identifier; every record is tagged with one
    OrgId
);
record_id!(
    /// Dataset identifier
    DatasetId
);
record_id!(
    /// Training run identifier
    TrainingRunId
);

/// Organization record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    pub churn_threshold_days: u32,
    pub created_at: DateTime<Utc>,
}

/// Where a blob landed after a `put`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLocation {
    /// Backend-specific URI, e.g. `memory://datasets/org_x/raw/y.csv`
    pub location: String,
    pub bucket: String,
    pub path: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Raw,
    Features,
}

/// Lifecycle of a dataset record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Uploaded,
    Processing,
    FeaturesReady,
    Ready,
    Error,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::FeaturesReady => "features_ready",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    /// Whether the feature stage may move a raw dataset from `self` to `next`
    pub fn can_transition_to(&self, next: DatasetStatus) -> bool {
        use DatasetStatus::*;
        match (self, next) {
            // a fresh invocation may re-derive features from any settled state
            (Uploaded | FeaturesReady | Error, Processing) => true,
            (Processing, FeaturesReady | Error) => true,
            (Uploaded, Error) => true,
            (Uploaded | Processing | FeaturesReady | Ready | Error, _) => false,
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, immutable blob reference plus its processing status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataset {
    pub id: DatasetId,
    pub organization_id: OrgId,
    pub kind: DatasetKind,
    pub blob: BlobLocation,
    pub row_count: usize,
    pub has_churn_label: bool,
    pub status: DatasetStatus,
    /// The raw dataset a features dataset was derived from
    #[serde(default)]
    pub source_dataset_id: Option<DatasetId>,
    /// Last feature-stage failure, cleared when a new run starts
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RawDataset {
    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: DatasetStatus) -> Result<(), ChurnError> {
        if !self.status.can_transition_to(next) {
            return Err(ChurnError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next == DatasetStatus::Processing {
            self.error_message = None;
        }
        Ok(())
    }

    /// Record a failed feature stage; `processing|uploaded -> error`
    pub fn mark_error(&mut self, message: impl Into<String>) -> Result<(), ChurnError> {
        self.transition(DatasetStatus::Error)?;
        self.error_message = Some(message.into());
        Ok(())
    }
}

/// Training run status; metrics exist only on `Completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingStatus {
    Training,
    Completed { metrics: TrainingMetrics },
    Failed { error: String },
}

impl TrainingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Training)
    }
}

/// One training attempt for an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: TrainingRunId,
    pub organization_id: OrgId,
    pub algorithm: Algorithm,
    /// Artifact location, set once the model has been persisted
    pub model_path: Option<String>,
    #[serde(flatten)]
    pub status: TrainingStatus,
    pub trained_at: DateTime<Utc>,
    /// When the run obtained the organization's training lease
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingRun {
    pub fn new(organization_id: OrgId, algorithm: Algorithm) -> Self {
        Self {
            id: TrainingRunId::new(),
            organization_id,
            algorithm,
            model_path: None,
            status: TrainingStatus::Training,
            trained_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn metrics(&self) -> Option<&TrainingMetrics> {
        match &self.status {
            TrainingStatus::Completed { metrics } => Some(metrics),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            TrainingStatus::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// `training -> completed`; terminal runs never move again
    pub fn complete(
        &mut self,
        model_path: String,
        metrics: TrainingMetrics,
    ) -> Result<(), ChurnError> {
        self.ensure_in_flight("completed")?;
        self.model_path = Some(model_path);
        self.status = TrainingStatus::Completed { metrics };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `training -> failed`
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), ChurnError> {
        self.ensure_in_flight("failed")?;
        self.status = TrainingStatus::Failed {
            error: error.into(),
        };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_in_flight(&self, to: &str) -> Result<(), ChurnError> {
        if self.status.is_terminal() {
            return Err(ChurnError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}

/// Filter for "most recent dataset" queries
#[derive(Debug, Clone)]
pub struct DatasetFilter {
    pub organization_id: OrgId,
    pub kind: Option<DatasetKind>,
    /// Empty means any status
    pub statuses: Vec<DatasetStatus>,
}

impl DatasetFilter {
    pub fn new(organization_id: OrgId) -> Self {
        Self {
            organization_id,
            kind: None,
            statuses: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: DatasetKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn statuses(mut self, statuses: &[DatasetStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn matches(&self, dataset: &RawDataset) -> bool {
        dataset.organization_id == self.organization_id
            && self.kind.map_or(true, |kind| dataset.kind == kind)
            && (self.statuses.is_empty() || self.statuses.contains(&dataset.status))
    }
}

/// Health status of a storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub backend_type: String,
    pub latency: Duration,
    pub errors: Vec<String>,
}
