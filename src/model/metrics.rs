//! Classification metrics for held-out evaluation

use linfa::dataset::Pr;
use linfa::prelude::*;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DECISION_THRESHOLD: f64 = 0.5;

/// Snapshot stored on a completed training run. Every ratio is rounded to
/// four decimals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub roc_auc: f64,
    /// Feature name to coefficient or importance score
    pub feature_importance: BTreeMap<String, f64>,
    /// Rows in the labeled table
    pub total_samples: usize,
    pub train_samples: usize,
    pub test_samples: usize,
    /// Share of churned rows in the labeled table
    pub churn_rate: f64,
}

/// Scores of one evaluation pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub roc_auc: f64,
}

pub fn round4(value: f64) -> f64 {
    if value.is_finite() {
        (value * 10_000.0).round() / 10_000.0
    } else {
        0.0
    }
}

/// Class index of churned customers inside the confusion matrix. linfa
/// sorts labels and reports binary precision and recall for the first one.
const CHURNED: usize = 0;
const RETAINED: usize = 1;

fn class_of(churned: bool) -> usize {
    if churned {
        CHURNED
    } else {
        RETAINED
    }
}

/// Evaluate churn probabilities against true labels at a 0.5 cut-off.
///
/// Undefined ratios (no predicted or actual positives) are 0.
pub fn evaluate(labels: &[u8], probabilities: &[f64]) -> Evaluation {
    if labels.is_empty() {
        return Evaluation::default();
    }
    let truth: Array1<usize> = labels.iter().map(|&label| class_of(label == 1)).collect();
    let predicted: Array1<usize> = probabilities
        .iter()
        .map(|&p| class_of(p >= DECISION_THRESHOLD))
        .collect();

    let seen = |class: usize| truth.iter().chain(predicted.iter()).any(|&c| c == class);
    let (accuracy, precision, recall, f1_score) = if !(seen(CHURNED) && seen(RETAINED)) {
        // a single class everywhere: every prediction matched
        let score = if seen(CHURNED) { 1.0 } else { 0.0 };
        (1.0, score, score, score)
    } else {
        match predicted.confusion_matrix(&truth) {
            Ok(cm) => (
                f64::from(cm.accuracy()),
                f64::from(cm.precision()),
                f64::from(cm.recall()),
                f64::from(cm.f1_score()),
            ),
            Err(_) => (0.0, 0.0, 0.0, 0.0),
        }
    };

    Evaluation {
        accuracy: round4(accuracy),
        precision: round4(precision),
        recall: round4(recall),
        f1_score: round4(f1_score),
        roc_auc: round4(roc_auc(labels, probabilities)),
    }
}

/// Area under the ROC curve of churn probabilities. Returns 0 when only
/// one class is present.
pub fn roc_auc(labels: &[u8], scores: &[f64]) -> f64 {
    let positives = labels.iter().filter(|&&label| label == 1).count();
    if positives == 0 || positives == labels.len() {
        return 0.0;
    }

    let Some(probabilities) = scores
        .iter()
        .map(|&score| Pr::try_from(score.clamp(0.0, 1.0) as f32).ok())
        .collect::<Option<Array1<Pr>>>()
    else {
        return 0.0;
    };
    let truth: Array1<bool> = labels.iter().map(|&label| label == 1).collect();
    match probabilities.roc(truth.as_slice().unwrap()) {
        Ok(roc) => f64::from(roc.area_under_curve()),
        Err(_) => 0.0,
    }
}
