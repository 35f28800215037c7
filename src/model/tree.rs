//! Weighted least-squares regression tree for gradient boosting.
//!
//! `linfa-trees` only grows classification trees, and boosting fits each
//! stage to real-valued log-loss residuals.

use serde::{Deserialize, Serialize};

use crate::features::FEATURE_COUNT;

#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub root: Node,
}

/// Training inputs borrowed for the duration of one fit
pub struct TreeData<'a> {
    pub x: &'a [[f64; FEATURE_COUNT]],
    pub targets: &'a [f64],
    pub weights: &'a [f64],
}

struct Builder<'a> {
    data: &'a TreeData<'a>,
    params: TreeParams,
    leaf_value: &'a dyn Fn(&[usize]) -> f64,
    importance: [f64; FEATURE_COUNT],
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl RegressionTree {
    /// Fit on the rows in `indices`.
    ///
    /// Leaves take their value from `leaf_value`, so boosting can plug in a
    /// Newton step instead of the weighted mean. Returns the tree and the
    /// weighted impurity decrease attributed to each feature.
    pub fn fit(
        data: &TreeData<'_>,
        indices: &[usize],
        params: TreeParams,
        leaf_value: &dyn Fn(&[usize]) -> f64,
    ) -> (Self, [f64; FEATURE_COUNT]) {
        let mut builder = Builder {
            data,
            params,
            leaf_value,
            importance: [0.0; FEATURE_COUNT],
        };
        let mut indices = indices.to_vec();
        let root = builder.grow(&mut indices, 0);
        (Self { root }, builder.importance)
    }

    pub fn predict(&self, values: &[f64; FEATURE_COUNT]) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if values[*feature] <= *threshold {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }

    /// Every split must name a real feature and a finite threshold
    pub(crate) fn check(&self) -> Result<(), String> {
        let mut pending = vec![&self.root];
        while let Some(node) = pending.pop() {
            match node {
                Node::Leaf { value } if !value.is_finite() => {
                    return Err("regression tree leaf is not finite".to_string())
                }
                Node::Leaf { .. } => {}
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= FEATURE_COUNT || threshold.is_nan() {
                        return Err(format!("regression tree splits on unknown feature {feature}"));
                    }
                    pending.push(left);
                    pending.push(right);
                }
            }
        }
        Ok(())
    }
}

impl Builder<'_> {
    fn grow(&mut self, indices: &mut [usize], depth: usize) -> Node {
        let min_leaf = self.params.min_samples_leaf.max(1);
        if depth >= self.params.max_depth || indices.len() < 2 * min_leaf {
            return self.leaf(indices);
        }

        let Some(best) = self.best_split(indices) else {
            return self.leaf(indices);
        };
        self.importance[best.feature] += best.gain;

        let x = self.data.x;
        indices.sort_by(|&a, &b| x[a][best.feature].total_cmp(&x[b][best.feature]));
        let cut = indices.partition_point(|&i| x[i][best.feature] <= best.threshold);
        let (left, right) = indices.split_at_mut(cut);

        Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: Box::new(self.grow(left, depth + 1)),
            right: Box::new(self.grow(right, depth + 1)),
        }
    }

    fn leaf(&self, indices: &[usize]) -> Node {
        Node::Leaf {
            value: (self.leaf_value)(indices),
        }
    }

    fn best_split(&self, indices: &[usize]) -> Option<BestSplit> {
        let TreeData { x, targets, weights } = *self.data;
        let min_leaf = self.params.min_samples_leaf.max(1);

        let (total_w, total_wy, total_wyy) = indices.iter().fold((0.0, 0.0, 0.0), |acc, &i| {
            let (w, y) = (weights[i], targets[i]);
            (acc.0 + w, acc.1 + w * y, acc.2 + w * y * y)
        });
        if total_w <= 0.0 {
            return None;
        }
        let parent_sse = total_wyy - total_wy * total_wy / total_w;

        let mut best: Option<BestSplit> = None;
        let mut order = indices.to_vec();
        for feature in 0..FEATURE_COUNT {
            order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));

            let (mut left_w, mut left_wy, mut left_wyy) = (0.0, 0.0, 0.0);
            for position in 0..order.len() - 1 {
                let i = order[position];
                let (w, y) = (weights[i], targets[i]);
                left_w += w;
                left_wy += w * y;
                left_wyy += w * y * y;

                let (here, next) = (x[i][feature], x[order[position + 1]][feature]);
                let left_count = position + 1;
                if here == next || left_count < min_leaf || order.len() - left_count < min_leaf {
                    continue;
                }

                let right_w = total_w - left_w;
                if left_w <= 0.0 || right_w <= 0.0 {
                    continue;
                }
                let right_wy = total_wy - left_wy;
                let right_wyy = total_wyy - left_wyy;
                let sse = (left_wyy - left_wy * left_wy / left_w)
                    + (right_wyy - right_wy * right_wy / right_w);
                let gain = parent_sse - sse;

                if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(BestSplit {
                        feature,
                        threshold: (here + next) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}
