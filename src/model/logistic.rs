//! L2-regularized logistic regression fitted by `linfa-logistic` on
//! standardized, class-balanced inputs

use linfa::{prelude::*, Dataset};
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::sigmoid;
use crate::error::ChurnError;
use crate::features::FEATURE_COUNT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticSettings {
    /// L2 penalty on the coefficients (not the intercept)
    pub l2: f64,
    pub max_iterations: u64,
    pub gradient_tolerance: f64,
}

impl Default for LogisticSettings {
    fn default() -> Self {
        Self {
            l2: 1e-2,
            max_iterations: 200,
            gradient_tolerance: 1e-5,
        }
    }
}

/// Per-column standardization learned from the training partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Standardizer {
    pub fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mean = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x
            .axis_iter(Axis(1))
            .zip(mean.iter())
            .map(|(column, &m)| {
                let variance = column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
                let std = variance.sqrt();
                // constant columns pass through centered
                if std > 1e-12 {
                    std
                } else {
                    1.0
                }
            })
            .collect();
        Self {
            mean: mean.to_vec(),
            scale,
        }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut z = x.clone();
        for mut row in z.axis_iter_mut(Axis(0)) {
            for ((value, mean), scale) in row.iter_mut().zip(&self.mean).zip(&self.scale) {
                *value = (*value - mean) / scale;
            }
        }
        z
    }

    fn transform_row(&self, values: &[f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        let mut z = [0.0; FEATURE_COUNT];
        for (((out, value), mean), scale) in z.iter_mut().zip(values).zip(&self.mean).zip(&self.scale) {
            *out = (value - mean) / scale;
        }
        z
    }

    fn check(&self) -> Result<(), String> {
        if self.mean.len() != FEATURE_COUNT || self.scale.len() != FEATURE_COUNT {
            return Err(format!(
                "standardizer has {} means and {} scales, expected {FEATURE_COUNT}",
                self.mean.len(),
                self.scale.len()
            ));
        }
        if self.scale.iter().any(|s| !s.is_finite() || *s == 0.0) {
            return Err("standardizer scale must be finite and non-zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub standardizer: Standardizer,
    /// Coefficients in standardized feature space, oriented toward churn
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    /// Fit on `x` (rows by [`FEATURE_COUNT`] columns) with 0/1 churn labels.
    ///
    /// `linfa-logistic` ignores sample weights, so classes are balanced by
    /// repeating minority rows before the fit.
    pub fn fit(
        x: &Array2<f64>,
        labels: &Array1<usize>,
        settings: &LogisticSettings,
    ) -> Result<Self, ChurnError> {
        let standardizer = Standardizer::fit(x);
        let z = standardizer.transform(x);
        let (records, targets) = oversample_minority(&z, labels)?;

        let fitted = LogisticRegression::default()
            .alpha(settings.l2)
            .max_iterations(settings.max_iterations)
            .gradient_tolerance(settings.gradient_tolerance)
            .fit(&Dataset::new(records, targets))
            .map_err(|e| ChurnError::internal(format!("logistic regression: {e}")))?;

        let mut model = Self {
            standardizer,
            coefficients: fitted.params().to_vec(),
            intercept: fitted.intercept(),
        };

        // linfa picks its own positive class; flip so scores rise with churn
        let logits = z.dot(&Array1::from(model.coefficients.clone())) + model.intercept;
        let mean_logit = |class: usize| {
            let (sum, count) = logits
                .iter()
                .zip(labels)
                .filter(|(_, label)| **label == class)
                .fold((0.0, 0usize), |(s, c), (logit, _)| (s + logit, c + 1));
            sum / count.max(1) as f64
        };
        if mean_logit(1) < mean_logit(0) {
            model.coefficients.iter_mut().for_each(|c| *c = -*c);
            model.intercept = -model.intercept;
        }
        Ok(model)
    }

    pub fn predict_proba(&self, values: &[f64; FEATURE_COUNT]) -> f64 {
        let z = self.standardizer.transform_row(values);
        let logit = z
            .iter()
            .zip(&self.coefficients)
            .map(|(v, c)| v * c)
            .sum::<f64>()
            + self.intercept;
        sigmoid(logit)
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        self.standardizer.check()?;
        if self.coefficients.len() != FEATURE_COUNT {
            return Err(format!(
                "logistic model has {} coefficients, expected {FEATURE_COUNT}",
                self.coefficients.len()
            ));
        }
        Ok(())
    }
}

/// Repeat rows of the smaller class `round(majority / minority)` times
fn oversample_minority(
    z: &Array2<f64>,
    labels: &Array1<usize>,
) -> Result<(Array2<f64>, Array1<usize>), ChurnError> {
    let churned = labels.iter().filter(|&&label| label == 1).count();
    let active = labels.len() - churned;
    let (minority, ratio) = if churned < active {
        (1, active as f64 / churned.max(1) as f64)
    } else {
        (0, churned as f64 / active.max(1) as f64)
    };
    let repeats = (ratio.round() as usize).max(1);

    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for (row, &label) in z.axis_iter(Axis(0)).zip(labels) {
        let copies = if label == minority { repeats } else { 1 };
        for _ in 0..copies {
            rows.extend(row.iter().copied());
            targets.push(label);
        }
    }
    let records = Array2::from_shape_vec((targets.len(), z.ncols()), rows)
        .map_err(|e| ChurnError::internal(format!("feature matrix: {e}")))?;
    Ok((records, Array1::from(targets)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_standardizer_handles_constant_columns() {
        let x = array![[1.0, 5.0], [3.0, 5.0]];
        let scaler = Standardizer::fit(&x);
        assert_eq!(scaler.mean, vec![2.0, 5.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);

        let z = scaler.transform(&x);
        assert_eq!(z, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_minority_rows_are_repeated() {
        let z = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let labels = array![0, 0, 0, 0, 1];
        let (records, targets) = oversample_minority(&z, &labels).unwrap();
        assert_eq!(targets.len(), 8);
        assert_eq!(targets.iter().filter(|&&t| t == 1).count(), 4);
        assert_eq!(records.nrows(), 8);
        assert_eq!(records[[7, 0]], 4.0);
    }

    fn separable() -> (Array2<f64>, Array1<usize>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            let active = [90.0 + i as f64, 50.0, 40.0, 70.0, 300.0, 0.5, 40.0, 10.0];
            let churned = [5.0 + i as f64, 10.0, 5.0, 8.0, 20.0, -0.5, 10.0, 90.0];
            rows.extend_from_slice(&active);
            labels.push(0);
            rows.extend_from_slice(&churned);
            labels.push(1);
        }
        let x = Array2::from_shape_vec((20, FEATURE_COUNT), rows).unwrap();
        (x, Array1::from(labels))
    }

    #[test]
    fn test_fit_separates_classes() {
        let (x, labels) = separable();
        let model = LogisticModel::fit(&x, &labels, &LogisticSettings::default()).unwrap();

        let active = [95.0, 50.0, 40.0, 70.0, 300.0, 0.5, 40.0, 10.0];
        let churned = [7.0, 10.0, 5.0, 8.0, 20.0, -0.5, 10.0, 90.0];
        assert!(model.predict_proba(&active) < 0.2);
        assert!(model.predict_proba(&churned) > 0.8);
        // recency pushes toward "active", so its coefficient is negative
        assert!(model.coefficients[0] < 0.0);
        assert!(model.check().is_ok());
    }

    #[test]
    fn test_fit_orients_toward_churn_for_either_label_order() {
        let (x, labels) = separable();
        // the first row is churned here, the first row is active above
        let flipped_x = x.slice(ndarray::s![1.., ..]).to_owned();
        let flipped_labels = labels.slice(ndarray::s![1..]).to_owned();
        let model =
            LogisticModel::fit(&flipped_x, &flipped_labels, &LogisticSettings::default()).unwrap();
        let churned = [7.0, 10.0, 5.0, 8.0, 20.0, -0.5, 10.0, 90.0];
        assert!(model.predict_proba(&churned) > 0.8);
    }

    #[test]
    fn test_truncated_model_fails_check() {
        let (x, labels) = separable();
        let mut model = LogisticModel::fit(&x, &labels, &LogisticSettings::default()).unwrap();
        model.standardizer.scale.pop();
        assert!(model.check().is_err());
    }
}
