use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::models::gbdt::TreeEnsembleModel;
use crate::models::neural::{NeuralArtifact, NeuralClassifier};
use crate::stats::softmax_rows;
use crate::tracking::MetricSink;

/// The training and validation slices of one cross-validation fold.
///
/// Labels are indices into the sorted class list shared by every fold.
pub struct FoldData<'a> {
    pub train_features: &'a Array2<f32>,
    pub train_labels: &'a [usize],
    pub train_weights: &'a [f64],
    pub val_features: &'a Array2<f32>,
    pub val_labels: &'a [usize],
    pub val_weights: &'a [f64],
}

impl<'a> FoldData<'a> {
    /// Check that features, labels and weights agree in length on both sides.
    pub fn validate(&self) -> Result<()> {
        for (features, labels, weights) in [
            (self.train_features, self.train_labels, self.train_weights),
            (self.val_features, self.val_labels, self.val_weights),
        ] {
            if labels.len() != features.nrows() {
                return Err(ClassifierError::LengthMismatch {
                    expected: features.nrows(),
                    found: labels.len(),
                });
            }
            if weights.len() != features.nrows() {
                return Err(ClassifierError::LengthMismatch {
                    expected: features.nrows(),
                    found: weights.len(),
                });
            }
        }
        if self.train_features.nrows() == 0 || self.val_features.nrows() == 0 {
            return Err(ClassifierError::Configuration(
                "Training and validation slices must both be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of fitting one fold.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
    /// Boosting round or training step with the lowest validation loss.
    pub best_iteration: usize,
    pub best_val_loss: f64,
}

/// Everything needed to rebuild a trained fold model for inference.
#[derive(Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum FoldArtifact {
    /// Trees are stored inline.
    TreeEnsemble(TreeEnsembleModel),
    /// Weights live in a separate checkpoint referenced by path.
    Neural(NeuralArtifact),
}

impl FoldArtifact {
    /// Class probabilities from the persisted fold model.
    pub fn predict_proba(&self, x: &Array2<f32>) -> Result<Array2<f64>> {
        match self {
            FoldArtifact::TreeEnsemble(model) => Ok(softmax_rows(&model.predict_raw(x)?)),
            FoldArtifact::Neural(artifact) => {
                let model = NeuralClassifier::from_artifact(artifact)?;
                model.predict_proba(x)
            }
        }
    }
}

/// The train/predict contract shared by every classifier backend.
pub trait ClassifierModel {
    /// Fit on the training slice, using the validation slice for early
    /// stopping or checkpoint selection.
    fn fit(&mut self, data: &FoldData, sink: &mut dyn MetricSink) -> Result<FitSummary>;

    /// Raw, unnormalized class scores with one column per class.
    fn predict_raw(&self, x: &Array2<f32>) -> Result<Array2<f64>>;

    /// Class probabilities. Rows sum to 1.
    fn predict_proba(&self, x: &Array2<f32>) -> Result<Array2<f64>> {
        Ok(softmax_rows(&self.predict_raw(x)?))
    }

    /// Consume the trained model, keeping what inference needs.
    fn into_artifact(self: Box<Self>) -> Result<FoldArtifact>;

    fn name(&self) -> &str {
        "classifier"
    }
}
