use std::collections::BTreeSet;

use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::error::{ClassifierError, Result};
use crate::predictions::PredictionTable;
use crate::weights::ClassWeights;

/// Probabilities of exactly zero are raised to this floor before the log.
pub const PROBABILITY_FLOOR: f64 = 1e-10;

/// Per-object contributions to the weighted multi-class log-loss.
///
/// For every class `c` present in `true_classes`, an object `i` of class `c`
/// contributes
///
/// `-w_c * w_i * ln(p_ic) / sum_{j in c} w_j`
///
/// and all contributions are finally divided by the sum of the class weights
/// `w_c` of the classes present. Classes with a weight of 0 contribute 0 and
/// are left out of that sum, and need no prediction column.
///
/// # Arguments
///
/// * `true_classes` - The true class of every object.
/// * `predictions` - Predicted probabilities, one column per class, rows aligned with `true_classes`.
/// * `object_weights` - Weights of the objects within their class. Uniform when `None`.
/// * `class_weights` - Class multipliers. Classes that are not listed get 1.
///
/// # Returns
///
/// One contribution per object; their sum is the loss.
pub fn weighted_multi_logloss_contributions(
    true_classes: &[String],
    predictions: &PredictionTable,
    object_weights: Option<&[f64]>,
    class_weights: Option<&ClassWeights>,
) -> Result<Vec<f64>> {
    if predictions.len() != true_classes.len() {
        return Err(ClassifierError::LengthMismatch {
            expected: true_classes.len(),
            found: predictions.len(),
        });
    }
    if let Some(weights) = object_weights {
        if weights.len() != true_classes.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: true_classes.len(),
                found: weights.len(),
            });
        }
    }

    let mut object_loglosses = vec![0f64; true_classes.len()];
    let mut sum_class_weights = 0f64;

    let class_names: BTreeSet<&str> = true_classes.iter().map(|c| c.as_str()).collect();
    for class_name in class_names {
        let class_rows: Vec<usize> = true_classes
            .iter()
            .enumerate()
            .filter_map(|(i, c)| if c == class_name { Some(i) } else { None })
            .collect();

        let class_weight = class_weights
            .and_then(|weights| weights.get(class_name).copied())
            .unwrap_or(1.0);

        if class_weight == 0.0 {
            // Rows already hold 0.
            continue;
        }

        let class_predictions =
            predictions
                .column(class_name)
                .ok_or_else(|| ClassifierError::MissingPrediction {
                    class: class_name.to_string(),
                })?;

        let object_weight = |i: usize| object_weights.map_or(1.0, |w| w[i]);
        let sum_object_weights: f64 = class_rows.iter().map(|&i| object_weight(i)).sum();
        if sum_object_weights == 0.0 {
            log::debug!(
                "All objects of class {} have zero weight, ignoring the class",
                class_name
            );
            continue;
        }

        for &i in &class_rows {
            let mut p = class_predictions[i];
            if p == 0.0 {
                p = PROBABILITY_FLOOR;
            }
            object_loglosses[i] = -class_weight * object_weight(i) * p.ln() / sum_object_weights;
        }

        sum_class_weights += class_weight;
    }

    if sum_class_weights == 0.0 {
        return Ok(object_loglosses);
    }

    for loss in object_loglosses.iter_mut() {
        *loss /= sum_class_weights;
    }

    Ok(object_loglosses)
}

/// Weighted multi-class log-loss, summed over all objects.
///
/// See [`weighted_multi_logloss_contributions`] for the definition.
pub fn weighted_multi_logloss(
    true_classes: &[String],
    predictions: &PredictionTable,
    object_weights: Option<&[f64]>,
    class_weights: Option<&ClassWeights>,
) -> Result<f64> {
    let contributions = weighted_multi_logloss_contributions(
        true_classes,
        predictions,
        object_weights,
        class_weights,
    )?;
    Ok(contributions.iter().sum())
}

/// Row-wise softmax of raw scores, stabilized by the row maximum.
pub fn softmax_rows(raw: &Array2<f64>) -> Array2<f64> {
    let mut probabilities = raw.clone();
    probabilities
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        });
    probabilities
}
