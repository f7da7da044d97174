use gbdt::config::Config;
use gbdt::decision_tree::{Data, DataVec, VALUE_TYPE_UNKNOWN};
use gbdt::gradient_boost::GBDT;
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TreeEnsembleParams;
use crate::error::{ClassifierError, Result};
use crate::models::classifier_trait::{ClassifierModel, FitSummary, FoldArtifact, FoldData};
use crate::stats::softmax_rows;
use crate::tracking::MetricSink;

/// Probabilities are clipped here when evaluating the validation loss.
const EVAL_PROBABILITY_FLOOR: f64 = 1e-15;

/// Non-finite values become the tree library's missing-value marker, which
/// every split routes to a learned side.
fn feature_row(row: ArrayView1<f32>) -> Vec<f32> {
    row.iter()
        .map(|&v| if v.is_finite() { v } else { VALUE_TYPE_UNKNOWN })
        .collect()
}

fn to_datavec(x: &Array2<f32>) -> DataVec {
    x.axis_iter(Axis(0))
        .map(|row| Data::new_training_data(feature_row(row), 1.0, 0.0, None))
        .collect()
}

/// Weighted mean of `-ln p(true class)`.
fn weighted_logloss(probabilities: &Array2<f64>, labels: &[usize], weights: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut sum_weights = 0.0;
    for (i, &label) in labels.iter().enumerate() {
        let p = probabilities[(i, label)].max(EVAL_PROBABILITY_FLOOR);
        total -= weights[i] * p.ln();
        sum_weights += weights[i];
    }
    if sum_weights > 0.0 {
        total / sum_weights
    } else {
        0.0
    }
}

/// A trained multiclass boosted tree ensemble.
///
/// Every boosting round holds one regression tree per class. The raw score of
/// a class is the shrunk sum of its trees, starting from 0.
#[derive(Serialize, Deserialize)]
pub struct TreeEnsembleModel {
    num_features: usize,
    num_classes: usize,
    learning_rate: f32,
    stages: Vec<Vec<GBDT>>,
}

impl TreeEnsembleModel {
    pub fn num_rounds(&self) -> usize {
        self.stages.len()
    }

    pub fn predict_raw(&self, x: &Array2<f32>) -> Result<Array2<f64>> {
        if x.ncols() != self.num_features {
            return Err(ClassifierError::LengthMismatch {
                expected: self.num_features,
                found: x.ncols(),
            });
        }
        let data = to_datavec(x);
        let n = x.nrows();
        let learning_rate = self.learning_rate as f64;

        let columns: Vec<Vec<f64>> = (0..self.num_classes)
            .into_par_iter()
            .map(|class| {
                let mut scores = vec![0f64; n];
                for stage in &self.stages {
                    let predictions = stage[class].predict(&data);
                    for (score, p) in scores.iter_mut().zip(predictions) {
                        *score += learning_rate * p as f64;
                    }
                }
                scores
            })
            .collect();

        Ok(Array2::from_shape_fn((n, self.num_classes), |(i, c)| {
            columns[c][i]
        }))
    }
}

/// Gradient boosted decision trees with a softmax objective.
///
/// Each round fits, for every class, a single regression tree to the
/// residual `y_ik - p_ik` of the current softmax probabilities, weighted by the
/// object weights. Boosting stops once the weighted validation log-loss has
/// not improved for `early_stopping_rounds` rounds, and the ensemble is cut
/// back to its best round.
pub struct GBDTClassifier {
    params: TreeEnsembleParams,
    num_features: usize,
    num_classes: usize,
    model: Option<TreeEnsembleModel>,
}

impl GBDTClassifier {
    pub fn new(params: TreeEnsembleParams, num_features: usize, num_classes: usize) -> Self {
        GBDTClassifier {
            params,
            num_features,
            num_classes,
            model: None,
        }
    }

    fn tree_config(&self) -> Config {
        let mut config = Config::new();
        config.set_feature_size(self.num_features);
        config.set_max_depth(self.params.max_depth);
        config.set_iterations(1);
        config.set_shrinkage(1.0);
        config.set_loss("SquaredError");
        config.set_feature_sample_ratio(self.params.feature_fraction);
        config.set_data_sample_ratio(self.params.data_sample_ratio);
        config.set_min_leaf_size(self.params.min_leaf_size);
        config.set_debug(false);
        config.set_training_optimization_level(self.params.training_optimization_level);
        config
    }
}

/// Fit one regression tree to the softmax residuals of `class`.
fn fit_class_tree(
    config: &Config,
    features: &[Vec<f32>],
    labels: &[usize],
    weights: &[f64],
    probabilities: &Array2<f64>,
    class: usize,
) -> GBDT {
    let mut data: DataVec = features
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let target = if labels[i] == class { 1.0 } else { 0.0 };
            let residual = target - probabilities[(i, class)];
            Data::new_training_data(row.clone(), weights[i] as f32, residual as f32, None)
        })
        .collect();
    let mut tree = GBDT::new(config);
    tree.fit(&mut data);
    tree
}

impl ClassifierModel for GBDTClassifier {
    fn fit(&mut self, data: &FoldData, _sink: &mut dyn MetricSink) -> Result<FitSummary> {
        data.validate()?;
        if data.train_features.ncols() != self.num_features {
            return Err(ClassifierError::LengthMismatch {
                expected: self.num_features,
                found: data.train_features.ncols(),
            });
        }

        let k = self.num_classes;
        let learning_rate = self.params.learning_rate as f64;
        let config = self.tree_config();

        let train_rows: Vec<Vec<f32>> = data
            .train_features
            .axis_iter(Axis(0))
            .map(feature_row)
            .collect();
        let train_data = to_datavec(data.train_features);
        let val_data = to_datavec(data.val_features);

        let mut raw_train = Array2::<f64>::zeros((data.train_features.nrows(), k));
        let mut raw_val = Array2::<f64>::zeros((data.val_features.nrows(), k));

        let mut stages: Vec<Vec<GBDT>> = Vec::new();
        let mut best_loss =
            weighted_logloss(&softmax_rows(&raw_val), data.val_labels, data.val_weights);
        let mut best_iteration = 0usize;
        let mut rounds_since_best = 0usize;

        for round in 0..self.params.n_estimators {
            let probabilities = softmax_rows(&raw_train);

            let stage: Vec<(GBDT, Vec<f32>, Vec<f32>)> = (0..k)
                .into_par_iter()
                .map(|class| {
                    let tree = fit_class_tree(
                        &config,
                        &train_rows,
                        data.train_labels,
                        data.train_weights,
                        &probabilities,
                        class,
                    );
                    let train_update = tree.predict(&train_data);
                    let val_update = tree.predict(&val_data);
                    (tree, train_update, val_update)
                })
                .collect();

            let mut trees = Vec::with_capacity(k);
            for (class, (tree, train_update, val_update)) in stage.into_iter().enumerate() {
                for (i, update) in train_update.iter().enumerate() {
                    raw_train[(i, class)] += learning_rate * *update as f64;
                }
                for (i, update) in val_update.iter().enumerate() {
                    raw_val[(i, class)] += learning_rate * *update as f64;
                }
                trees.push(tree);
            }
            stages.push(trees);

            let val_loss =
                weighted_logloss(&softmax_rows(&raw_val), data.val_labels, data.val_weights);

            if self.params.verbose_eval > 0 && (round + 1) % self.params.verbose_eval == 0 {
                log::info!("[{}]\tvalid multi_logloss: {:.6}", round + 1, val_loss);
            }

            if val_loss < best_loss {
                best_loss = val_loss;
                best_iteration = round + 1;
                rounds_since_best = 0;
            } else {
                rounds_since_best += 1;
                if rounds_since_best >= self.params.early_stopping_rounds {
                    log::info!(
                        "Early stopping, best iteration is: [{}]\tvalid multi_logloss: {:.6}",
                        best_iteration,
                        best_loss
                    );
                    break;
                }
            }
        }

        stages.truncate(best_iteration);
        log::debug!("Boosted {} rounds of {} class trees", stages.len(), k);

        self.model = Some(TreeEnsembleModel {
            num_features: self.num_features,
            num_classes: k,
            learning_rate: self.params.learning_rate,
            stages,
        });

        Ok(FitSummary {
            best_iteration,
            best_val_loss: best_loss,
        })
    }

    fn predict_raw(&self, x: &Array2<f32>) -> Result<Array2<f64>> {
        self.model
            .as_ref()
            .ok_or(ClassifierError::NotTrained)?
            .predict_raw(x)
    }

    fn into_artifact(self: Box<Self>) -> Result<FoldArtifact> {
        let model = self.model.ok_or(ClassifierError::NotTrained)?;
        Ok(FoldArtifact::TreeEnsemble(model))
    }

    fn name(&self) -> &str {
        "gbdt"
    }
}
