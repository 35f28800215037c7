//! Tree ensembles: a random forest of `linfa-trees` decision trees and
//! log-loss gradient boosting over [`RegressionTree`] stages

use linfa::{prelude::*, Dataset};
use linfa_trees::DecisionTree;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::sigmoid;
use super::tree::{RegressionTree, TreeData, TreeParams};
use crate::error::ChurnError;
use crate::features::FEATURE_COUNT;

const MIN_HESSIAN: f64 = 1e-12;
const PROBABILITY_CLAMP: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleSettings {
    /// Trees in the forest, rounds in boosting
    pub n_trees: usize,
    pub max_depth: usize,
    /// Rows per boosting leaf
    pub min_samples_leaf: usize,
    /// Depth of each boosting stage
    pub boosting_max_depth: usize,
    /// Shrinkage applied to each boosting stage
    pub learning_rate: f64,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 8,
            min_samples_leaf: 1,
            boosting_max_depth: 3,
            learning_rate: 0.1,
        }
    }
}

/// One forest tree and the feature columns it was grown on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestMember {
    pub features: Vec<usize>,
    pub tree: DecisionTree<f64, usize>,
}

impl ForestMember {
    fn votes_churn(&self, values: &[f64; FEATURE_COUNT]) -> bool {
        let row = Array2::from_shape_fn((1, self.features.len()), |(_, j)| {
            values[self.features[j]]
        });
        self.tree.predict(&row).iter().any(|&class| class == 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestModel {
    pub members: Vec<ForestMember>,
}

impl RandomForestModel {
    /// Grow `n_trees` decision trees, each on a class-stratified bootstrap
    /// of the rows and a random subset of `sqrt(FEATURE_COUNT)` columns.
    ///
    /// `weights` are per-row sample weights honored by the tree splits.
    /// Returns the forest and its normalized impurity importance.
    pub fn fit(
        x: &Array2<f64>,
        labels: &Array1<usize>,
        weights: &Array1<f32>,
        settings: &EnsembleSettings,
        seed: u64,
    ) -> Result<(Self, [f64; FEATURE_COUNT]), ChurnError> {
        let subspace = ((FEATURE_COUNT as f64).sqrt().round() as usize).clamp(1, FEATURE_COUNT);
        let by_class: [Vec<usize>; 2] = [0, 1].map(|class| {
            labels
                .iter()
                .enumerate()
                .filter(|&(_, &label)| label == class)
                .map(|(i, _)| i)
                .collect()
        });
        let mut rng = StdRng::seed_from_u64(seed);
        let mut importance = [0.0; FEATURE_COUNT];
        let mut members = Vec::with_capacity(settings.n_trees);

        for _ in 0..settings.n_trees.max(1) {
            let rows: Vec<usize> = by_class
                .iter()
                .filter(|class_rows| !class_rows.is_empty())
                .flat_map(|class_rows| {
                    (0..class_rows.len())
                        .map(|_| class_rows[rng.random_range(0..class_rows.len())])
                        .collect::<Vec<_>>()
                })
                .collect();
            let mut features = rand::seq::index::sample(&mut rng, FEATURE_COUNT, subspace).into_vec();
            features.sort_unstable();

            let records = x.select(Axis(0), &rows).select(Axis(1), &features);
            let dataset = Dataset::new(records, labels.select(Axis(0), &rows))
                .with_weights(weights.select(Axis(0), &rows));
            let tree = DecisionTree::<f64, usize>::params()
                .max_depth(Some(settings.max_depth))
                .fit(&dataset)
                .map_err(|e| ChurnError::internal(format!("decision tree: {e}")))?;

            for (column, score) in features.iter().zip(tree.feature_importance()) {
                if score.is_finite() {
                    importance[*column] += score;
                }
            }
            members.push(ForestMember { features, tree });
        }

        Ok((Self { members }, normalize(importance)))
    }

    /// Share of trees voting churn
    pub fn predict_proba(&self, values: &[f64; FEATURE_COUNT]) -> f64 {
        if self.members.is_empty() {
            return 0.5;
        }
        let votes = self
            .members
            .iter()
            .filter(|member| member.votes_churn(values))
            .count();
        votes as f64 / self.members.len() as f64
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        for (i, member) in self.members.iter().enumerate() {
            if member.features.is_empty() || member.features.iter().any(|&f| f >= FEATURE_COUNT) {
                return Err(format!("forest tree {i} has invalid feature columns"));
            }
            if member
                .tree
                .features()
                .iter()
                .any(|&split| split >= member.features.len())
            {
                return Err(format!("forest tree {i} splits outside its feature columns"));
            }
        }
        Ok(())
    }
}

/// Training table in the shape boosting consumes
pub struct Samples<'a> {
    pub x: &'a [[f64; FEATURE_COUNT]],
    pub labels: &'a [f64],
    pub weights: &'a [f64],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostingModel {
    /// Log-odds of the weighted base rate
    pub initial_logit: f64,
    pub learning_rate: f64,
    pub stages: Vec<RegressionTree>,
}

impl GradientBoostingModel {
    /// Boost shallow trees on the log-loss gradient with Newton leaf values
    pub fn fit(samples: &Samples<'_>, settings: &EnsembleSettings) -> (Self, [f64; FEATURE_COUNT]) {
        let n = samples.x.len();
        let total_weight: f64 = samples.weights.iter().sum();
        let positive_weight: f64 = samples
            .labels
            .iter()
            .zip(samples.weights)
            .map(|(y, w)| y * w)
            .sum();
        let base_rate = if total_weight > 0.0 {
            (positive_weight / total_weight).clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP)
        } else {
            0.5
        };
        let initial_logit = (base_rate / (1.0 - base_rate)).ln();

        let params = TreeParams {
            max_depth: settings.boosting_max_depth,
            min_samples_leaf: settings.min_samples_leaf,
        };
        let indices: Vec<usize> = (0..n).collect();
        let mut logits = vec![initial_logit; n];
        let mut importance = [0.0; FEATURE_COUNT];
        let mut stages = Vec::with_capacity(settings.n_trees);

        for _ in 0..settings.n_trees.max(1) {
            let probabilities: Vec<f64> = logits.iter().map(|&f| sigmoid(f)).collect();
            let residuals: Vec<f64> = samples
                .labels
                .iter()
                .zip(&probabilities)
                .map(|(y, p)| y - p)
                .collect();
            let hessians: Vec<f64> = probabilities.iter().map(|p| p * (1.0 - p)).collect();

            let data = TreeData {
                x: samples.x,
                targets: &residuals,
                weights: samples.weights,
            };
            let newton_step = |leaf: &[usize]| {
                let (gradient, hessian) = leaf.iter().fold((0.0, 0.0), |(g, h), &i| {
                    let w = samples.weights[i];
                    (g + w * residuals[i], h + w * hessians[i])
                });
                gradient / hessian.max(MIN_HESSIAN)
            };

            let (tree, gains) = RegressionTree::fit(&data, &indices, params, &newton_step);
            for (sum, gain) in importance.iter_mut().zip(gains) {
                *sum += gain;
            }
            for (logit, row) in logits.iter_mut().zip(samples.x) {
                *logit += settings.learning_rate * tree.predict(row);
            }
            stages.push(tree);
        }

        let model = Self {
            initial_logit,
            learning_rate: settings.learning_rate,
            stages,
        };
        (model, normalize(importance))
    }

    pub fn predict_proba(&self, values: &[f64; FEATURE_COUNT]) -> f64 {
        let logit = self.initial_logit
            + self
                .stages
                .iter()
                .map(|tree| self.learning_rate * tree.predict(values))
                .sum::<f64>();
        sigmoid(logit)
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        self.stages.iter().try_for_each(RegressionTree::check)
    }
}

/// Scale importances to sum to 1; all zeros when no split was made
fn normalize(importance: [f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
    let total: f64 = importance.iter().sum();
    if total > 0.0 {
        importance.map(|value| value / total)
    } else {
        [0.0; FEATURE_COUNT]
    }
}
