//! Pipeline configuration: TOML file, `CHURNWISE_*` environment overrides

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::ChurnError;
use crate::features::FeatureSettings;
use crate::model::{Algorithm, TrainerSettings};
use crate::split::SplitMode;
use crate::storage::StorageConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Inactivity threshold for organizations created without one
    pub default_churn_threshold_days: u32,
    pub default_algorithm: Algorithm,
    /// Fixed "today" for features and labels; the wall clock when unset
    pub reference_date: Option<NaiveDate>,
    /// Stage worker pool size
    pub workers: usize,
    /// Lifetime of the per-organization training lease
    #[serde(with = "humantime_serde")]
    pub training_lock_ttl: Duration,
    /// How long a queued training run waits for the lease
    #[serde(with = "humantime_serde")]
    pub training_lock_wait: Duration,
    pub features: FeatureSettings,
    pub training: TrainerSettings,
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_churn_threshold_days: 30,
            default_algorithm: Algorithm::default(),
            reference_date: None,
            workers: 4,
            training_lock_ttl: Duration::from_secs(60 * 60),
            training_lock_wait: Duration::from_secs(10 * 60),
            features: FeatureSettings::default(),
            training: TrainerSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults over the in-memory backend
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig::memory(),
            ..Self::default()
        }
    }

    /// Read a TOML file; absent keys keep their defaults
    pub async fn load(path: &Path) -> Result<Self, ChurnError> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            ChurnError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ChurnError> {
        toml::from_str(content).map_err(|e| ChurnError::validation(format!("invalid config: {e}")))
    }

    /// Apply `CHURNWISE_*` environment overrides
    pub fn merge_env_vars(&mut self) -> Result<(), ChurnError> {
        fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ChurnError> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ChurnError::validation(format!("{name} has invalid value '{raw}'"))),
                Err(_) => Ok(None),
            }
        }

        if let Some(days) = parsed("CHURNWISE_THRESHOLD_DAYS")? {
            self.default_churn_threshold_days = days;
        }
        if let Some(rows) = parsed("CHURNWISE_MIN_TRAINING_ROWS")? {
            self.training.min_training_rows = rows;
        }
        if let Some(workers) = parsed("CHURNWISE_WORKERS")? {
            self.workers = workers;
        }
        if let Some(date) = parsed("CHURNWISE_REFERENCE_DATE")? {
            self.reference_date = Some(date);
        }
        if let Ok(mode) = std::env::var("CHURNWISE_SPLIT_MODE") {
            self.training.split_mode = match mode.trim().to_lowercase().as_str() {
                "random" => SplitMode::Random,
                "temporal" => SplitMode::Temporal,
                other => {
                    return Err(ChurnError::validation(format!(
                        "CHURNWISE_SPLIT_MODE must be random or temporal, got '{other}'"
                    )))
                }
            };
        }
        if let Ok(algorithm) = std::env::var("CHURNWISE_ALGORITHM") {
            self.default_algorithm = algorithm.parse()?;
        }
        self.storage.apply_env();
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ChurnError> {
        validate_threshold(self.default_churn_threshold_days)?;
        if self.workers == 0 {
            return Err(ChurnError::validation("workers must be at least 1"));
        }
        if self.training.min_training_rows < 2 {
            return Err(ChurnError::validation(
                "training.min_training_rows must be at least 2",
            ));
        }
        if !(0.0..1.0).contains(&self.training.test_fraction) {
            return Err(ChurnError::InvalidFraction(self.training.test_fraction));
        }

        let logistic = &self.training.logistic;
        if logistic.max_iterations == 0 {
            return Err(ChurnError::validation(
                "training.logistic.max_iterations must be at least 1",
            ));
        }
        if !(logistic.gradient_tolerance.is_finite() && logistic.gradient_tolerance > 0.0) {
            return Err(ChurnError::validation(
                "training.logistic.gradient_tolerance must be positive",
            ));
        }
        if !(logistic.l2.is_finite() && logistic.l2 >= 0.0) {
            return Err(ChurnError::validation(
                "training.logistic.l2 must be non-negative",
            ));
        }

        let ensemble = &self.training.ensemble;
        if ensemble.n_trees == 0 || ensemble.max_depth == 0 || ensemble.boosting_max_depth == 0 {
            return Err(ChurnError::validation(
                "training.ensemble tree counts and depths must be at least 1",
            ));
        }
        if !(ensemble.learning_rate.is_finite() && ensemble.learning_rate > 0.0) {
            return Err(ChurnError::validation(
                "training.ensemble.learning_rate must be positive",
            ));
        }

        if self.storage.connection_pool_size == 0 {
            return Err(ChurnError::validation(
                "storage.connection_pool_size must be at least 1",
            ));
        }
        self.features.validate()
    }

    /// The instant features and labels are computed against
    pub fn as_of(&self) -> DateTime<Utc> {
        match self.reference_date {
            Some(date) => date.and_time(chrono::NaiveTime::MIN).and_utc(),
            None => Utc::now(),
        }
    }
}

pub fn validate_threshold(days: u32) -> Result<(), ChurnError> {
    if days == 0 {
        return Err(ChurnError::validation(
            "churn threshold must be at least 1 day",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_churn_threshold_days, 30);
        assert_eq!(config.training.min_training_rows, 10);
        assert_eq!(config.training.test_fraction, 0.2);
        assert_eq!(config.training.random_seed, 42);
        assert_eq!(config.default_algorithm, Algorithm::LogisticRegression);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            default_churn_threshold_days = 45
            reference_date = "2024-06-01"
            training_lock_wait = "30s"

            [training]
            split_mode = "temporal"
            min_training_rows = 4

            [training.ensemble]
            n_trees = 25

            [features.engagement_weights]
            recency = 0.5
            frequency = 0.25
            monetary = 0.25

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.default_churn_threshold_days, 45);
        assert_eq!(config.training.split_mode, SplitMode::Temporal);
        assert_eq!(config.training.min_training_rows, 4);
        assert_eq!(config.training.test_fraction, 0.2);
        assert_eq!(config.training.ensemble.n_trees, 25);
        assert_eq!(config.training.ensemble.max_depth, 8);
        assert_eq!(config.training_lock_wait, Duration::from_secs(30));
        assert_eq!(config.features.engagement_weights.recency, 0.5);
        assert_eq!(config.features.recency_decay_days, 90.0);
        assert_eq!(
            config.as_of().date_naive(),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = PipelineConfig::default();
        config.training.test_fraction = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ChurnError::InvalidFraction(_))
        ));

        let mut config = PipelineConfig::default();
        config.default_churn_threshold_days = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.features.engagement_weights.monetary = 0.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.training.logistic.max_iterations = 0;
        assert!(config.validate().is_err());

        assert!(PipelineConfig::from_toml("workers = \"many\"").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("churnwise.toml");
        tokio::fs::write(&path, "workers = 2\n").await.unwrap();

        let config = PipelineConfig::load(&path).await.unwrap();
        assert_eq!(config.workers, 2);

        let missing = PipelineConfig::load(&dir.path().join("nope.toml")).await;
        assert!(missing.is_err());
    }
}
