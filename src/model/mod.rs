//! Churn classifiers, evaluation metrics and the trainer

pub mod ensemble;
pub mod logistic;
pub mod metrics;
pub mod trainer;
pub mod tree;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ChurnError;
use crate::features::{CustomerFeatureVector, FEATURE_COUNT};
use crate::split::Timestamped;

pub use ensemble::{EnsembleSettings, ForestMember, GradientBoostingModel, RandomForestModel};
pub use logistic::{LogisticModel, LogisticSettings};
pub use metrics::TrainingMetrics;
pub use trainer::{Trainer, TrainerSettings};

/// Supported classifier families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    LogisticRegression,
    RandomForest,
    GradientBoosting,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [
        Algorithm::LogisticRegression,
        Algorithm::RandomForest,
        Algorithm::GradientBoosting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogisticRegression => "logistic_regression",
            Self::RandomForest => "random_forest",
            Self::GradientBoosting => "gradient_boosting",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ChurnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == wanted)
            .ok_or_else(|| ChurnError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// A feature vector joined with its churn label
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub features: CustomerFeatureVector,
    pub churn_label: u8,
}

impl Timestamped for LabeledRow {
    fn timestamp(&self) -> NaiveDate {
        self.features.last_event_date
    }
}

/// The fitted classifier persisted as an organization's artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum ChurnModel {
    LogisticRegression(LogisticModel),
    RandomForest(RandomForestModel),
    GradientBoosting(GradientBoostingModel),
}

impl ChurnModel {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::LogisticRegression(_) => Algorithm::LogisticRegression,
            Self::RandomForest(_) => Algorithm::RandomForest,
            Self::GradientBoosting(_) => Algorithm::GradientBoosting,
        }
    }

    /// Reject a deserialized model whose shape cannot score a feature vector
    pub fn check(&self) -> Result<(), String> {
        match self {
            Self::LogisticRegression(model) => model.check(),
            Self::RandomForest(model) => model.check(),
            Self::GradientBoosting(model) => model.check(),
        }
    }

    /// Probability of the churned class
    pub fn predict_proba(&self, values: &[f64; FEATURE_COUNT]) -> f64 {
        let p = match self {
            Self::LogisticRegression(model) => model.predict_proba(values),
            Self::RandomForest(model) => model.predict_proba(values),
            Self::GradientBoosting(model) => model.predict_proba(values),
        };
        if p.is_nan() {
            0.5
        } else {
            p.clamp(0.0, 1.0)
        }
    }

    pub fn predict(&self, features: &CustomerFeatureVector) -> Prediction {
        let churn_probability = metrics::round4(self.predict_proba(&features.values()));
        Prediction {
            customer_id: features.customer_id.clone(),
            churn_probability,
            risk_segment: RiskSegment::from_probability(churn_probability),
        }
    }
}

/// Coarse risk bucket for a churn probability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskSegment {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskSegment {
    pub fn from_probability(probability: f64) -> Self {
        if probability < 0.3 {
            Self::Low
        } else if probability < 0.5 {
            Self::Medium
        } else if probability < 0.7 {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub customer_id: String,
    pub churn_probability: f64,
    pub risk_segment: RiskSegment,
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
