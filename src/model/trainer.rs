//! Trainer/Evaluator: fit on the train partition, score the held-out one

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ensemble::Samples;
use super::metrics::{self, round4, TrainingMetrics};
use super::{
    Algorithm, ChurnModel, EnsembleSettings, GradientBoostingModel, LabeledRow, LogisticModel,
    LogisticSettings, RandomForestModel,
};
use crate::error::ChurnError;
use crate::features::{FEATURE_COLUMNS, FEATURE_COUNT};
use crate::split::{split, SplitMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub min_training_rows: usize,
    pub test_fraction: f64,
    pub split_mode: SplitMode,
    pub random_seed: u64,
    pub logistic: LogisticSettings,
    pub ensemble: EnsembleSettings,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            min_training_rows: 10,
            test_fraction: 0.2,
            split_mode: SplitMode::Random,
            random_seed: 42,
            logistic: LogisticSettings::default(),
            ensemble: EnsembleSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Trainer {
    settings: TrainerSettings,
}

impl Trainer {
    pub fn new(settings: TrainerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Fit `algorithm` on a labeled table and evaluate it.
    ///
    /// When the split leaves no held-out rows the model is scored on the
    /// full table.
    pub fn train(
        &self,
        table: &[LabeledRow],
        algorithm: Algorithm,
    ) -> Result<(ChurnModel, TrainingMetrics), ChurnError> {
        let settings = &self.settings;
        let total = table.len();
        let required = settings.min_training_rows.max(2);
        if total < required {
            return Err(ChurnError::InsufficientData {
                required,
                actual: total,
            });
        }

        let churned = table.iter().filter(|row| row.churn_label == 1).count();
        if churned == 0 || churned == total {
            return Err(ChurnError::validation(
                "training data must contain both churned and active customers",
            ));
        }

        let mut rows = table.to_vec();
        if settings.split_mode == SplitMode::Temporal {
            rows.sort_by_key(|row| row.features.last_event_date);
        }
        let (train, test) = split(
            &rows,
            settings.test_fraction,
            settings.split_mode,
            settings.random_seed,
        )?;

        let train = if has_both_classes(&train) {
            train
        } else {
            warn!(
                train_rows = train.len(),
                "train partition holds a single class; fitting on the full table"
            );
            rows.clone()
        };
        let evaluation_rows = if test.is_empty() {
            debug!("no held-out rows; evaluating on the full table");
            &rows
        } else {
            &test
        };

        let (model, importance) = self.fit(&train, algorithm)?;

        let labels: Vec<u8> = evaluation_rows.iter().map(|row| row.churn_label).collect();
        let probabilities: Vec<f64> = evaluation_rows
            .iter()
            .map(|row| model.predict_proba(&row.features.values()))
            .collect();
        let evaluation = metrics::evaluate(&labels, &probabilities);

        let metrics = TrainingMetrics {
            accuracy: evaluation.accuracy,
            precision: evaluation.precision,
            recall: evaluation.recall,
            f1_score: evaluation.f1_score,
            roc_auc: evaluation.roc_auc,
            feature_importance: FEATURE_COLUMNS
                .iter()
                .zip(importance)
                .map(|(name, value)| (name.to_string(), round4(value)))
                .collect(),
            total_samples: total,
            train_samples: train.len(),
            test_samples: test.len(),
            churn_rate: round4(churned as f64 / total as f64),
        };

        debug!(
            %algorithm,
            accuracy = metrics.accuracy,
            roc_auc = metrics.roc_auc,
            "model evaluated"
        );
        Ok((model, metrics))
    }

    fn fit(
        &self,
        train: &[LabeledRow],
        algorithm: Algorithm,
    ) -> Result<(ChurnModel, [f64; FEATURE_COUNT]), ChurnError> {
        let rows: Vec<[f64; FEATURE_COUNT]> =
            train.iter().map(|row| row.features.values()).collect();
        let weights = balanced_weights(train);

        Ok(match algorithm {
            Algorithm::LogisticRegression => {
                let model = LogisticModel::fit(
                    &feature_matrix(&rows)?,
                    &class_labels(train),
                    &self.settings.logistic,
                )?;
                let mut importance = [0.0; FEATURE_COUNT];
                importance.copy_from_slice(&model.coefficients);
                (ChurnModel::LogisticRegression(model), importance)
            }
            Algorithm::RandomForest => {
                // linfa weights are f32, scaled so the majority class weighs 1
                let majority_weight = weights.iter().copied().fold(f64::INFINITY, f64::min);
                let weights: Array1<f32> = weights
                    .iter()
                    .map(|w| (w / majority_weight) as f32)
                    .collect();
                let (model, importance) = RandomForestModel::fit(
                    &feature_matrix(&rows)?,
                    &class_labels(train),
                    &weights,
                    &self.settings.ensemble,
                    self.settings.random_seed,
                )?;
                (ChurnModel::RandomForest(model), importance)
            }
            Algorithm::GradientBoosting => {
                let labels: Vec<f64> = train.iter().map(|row| f64::from(row.churn_label)).collect();
                let samples = Samples {
                    x: &rows,
                    labels: &labels,
                    weights: &weights,
                };
                let (model, importance) =
                    GradientBoostingModel::fit(&samples, &self.settings.ensemble);
                (ChurnModel::GradientBoosting(model), importance)
            }
        })
    }
}

fn feature_matrix(rows: &[[f64; FEATURE_COUNT]]) -> Result<Array2<f64>, ChurnError> {
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), FEATURE_COUNT), flat)
        .map_err(|e| ChurnError::internal(format!("feature matrix: {e}")))
}

fn class_labels(rows: &[LabeledRow]) -> Array1<usize> {
    rows.iter().map(|row| usize::from(row.churn_label)).collect()
}

fn has_both_classes(rows: &[LabeledRow]) -> bool {
    rows.iter().any(|row| row.churn_label == 1) && rows.iter().any(|row| row.churn_label == 0)
}

/// Inverse-frequency weights: `n / (2 * n_class)` per row
fn balanced_weights(rows: &[LabeledRow]) -> Vec<f64> {
    let n = rows.len() as f64;
    let churned = rows.iter().filter(|row| row.churn_label == 1).count() as f64;
    let active = n - churned;
    rows.iter()
        .map(|row| {
            let class_count = if row.churn_label == 1 { churned } else { active };
            if class_count > 0.0 {
                n / (2.0 * class_count)
            } else {
                1.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::CustomerFeatureVector;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    /// 10 churned and 10 active customers with clearly separated features
    fn separable_table() -> Vec<LabeledRow> {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        (0..20)
            .map(|i| {
                let churned = i % 2 == 0;
                let jitter = i as f64;
                let features = CustomerFeatureVector {
                    customer_id: format!("c{i:02}"),
                    recency_score: if churned { 5.0 + jitter } else { 85.0 + jitter * 0.5 },
                    frequency_score: if churned { 10.0 } else { 60.0 + jitter },
                    monetary_score: if churned { 5.0 + jitter * 0.2 } else { 50.0 },
                    engagement_score: if churned { 8.0 } else { 70.0 },
                    tenure_days: if churned { 30.0 } else { 300.0 + jitter },
                    activity_trend: if churned { -0.5 } else { 0.4 },
                    avg_transaction_value: 40.0 + jitter,
                    days_between_transactions: if churned { 120.0 } else { 12.0 },
                    last_event_date: base + Duration::days(i),
                    calculated_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
                    churn_label: None,
                };
                LabeledRow {
                    features,
                    churn_label: u8::from(churned),
                }
            })
            .collect()
    }

    #[test]
    fn test_every_algorithm_learns_separable_table() {
        let trainer = Trainer::default();
        for algorithm in Algorithm::ALL {
            let (model, metrics) = trainer.train(&separable_table(), algorithm).unwrap();
            assert_eq!(model.algorithm(), algorithm);
            assert!(metrics.accuracy >= 0.9, "{algorithm}: {metrics:?}");
            assert_eq!(metrics.total_samples, 20);
            assert_eq!(metrics.train_samples, 16);
            assert_eq!(metrics.test_samples, 4);
            assert_eq!(metrics.churn_rate, 0.5);
            assert_eq!(metrics.feature_importance.len(), FEATURE_COUNT);
        }
    }

    #[test]
    fn test_logistic_importance_is_coefficients() {
        let (model, metrics) = Trainer::default()
            .train(&separable_table(), Algorithm::LogisticRegression)
            .unwrap();
        let ChurnModel::LogisticRegression(inner) = model else {
            panic!("expected logistic model");
        };
        assert_eq!(
            metrics.feature_importance["recency_score"],
            round4(inner.coefficients[0])
        );
        assert!(metrics.feature_importance["recency_score"] < 0.0);
    }

    #[test]
    fn test_nine_rows_is_insufficient() {
        let table: Vec<LabeledRow> = separable_table().into_iter().take(9).collect();
        for algorithm in Algorithm::ALL {
            let err = Trainer::default().train(&table, algorithm).unwrap_err();
            assert!(matches!(
                err,
                ChurnError::InsufficientData {
                    required: 10,
                    actual: 9
                }
            ));
        }
    }

    #[test]
    fn test_single_class_is_rejected() {
        let table: Vec<LabeledRow> = separable_table()
            .into_iter()
            .map(|mut row| {
                row.churn_label = 1;
                row
            })
            .collect();
        let err = Trainer::default()
            .train(&table, Algorithm::LogisticRegression)
            .unwrap_err();
        assert!(matches!(err, ChurnError::Validation { .. }));
    }

    #[test]
    fn test_empty_test_partition_evaluates_on_full_table() {
        let trainer = Trainer::new(TrainerSettings {
            min_training_rows: 2,
            ..TrainerSettings::default()
        });
        let table: Vec<LabeledRow> = separable_table().into_iter().take(2).collect();
        let (_, metrics) = trainer.train(&table, Algorithm::LogisticRegression).unwrap();
        assert_eq!(metrics.test_samples, 0);
        assert_eq!(metrics.train_samples, 2);
        assert_eq!(metrics.accuracy, 1.0);
    }

    #[test]
    fn test_temporal_holdout_scores_both_classes() {
        // the newest four customers alternate churned/active
        let trainer = Trainer::new(TrainerSettings {
            split_mode: SplitMode::Temporal,
            ..TrainerSettings::default()
        });
        let mut table = separable_table();
        table.reverse();
        for algorithm in Algorithm::ALL {
            let (_, metrics) = trainer.train(&table, algorithm).unwrap();
            assert_eq!(metrics.test_samples, 4);
            assert!(metrics.accuracy >= 0.9, "{algorithm}: {metrics:?}");
            assert!(metrics.roc_auc > 0.5, "{algorithm}: {metrics:?}");
        }
    }

    #[test]
    fn test_training_is_deterministic() {
        let trainer = Trainer::default();
        for algorithm in Algorithm::ALL {
            let first = trainer.train(&separable_table(), algorithm).unwrap();
            let second = trainer.train(&separable_table(), algorithm).unwrap();
            assert_eq!(first, second);
        }
    }
}
