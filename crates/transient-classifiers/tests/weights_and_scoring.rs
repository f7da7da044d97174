//! Integration tests for object weighting and the weighted log-loss metric.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};

use transient_classifiers::data_handling::MetadataTable;
use transient_classifiers::predictions::PredictionTable;
use transient_classifiers::stats::{weighted_multi_logloss, weighted_multi_logloss_contributions};
use transient_classifiers::weights::{
    ClassWeights, RedshiftWeightSpec, WeightSpec, WeightingPolicy,
};
use transient_classifiers::ClassifierError;

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("obj_{}", i)).collect()
}

fn labels(classes: &[&str]) -> Vec<String> {
    classes.iter().map(|c| c.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Object weights
// ---------------------------------------------------------------------------

#[test]
fn flat_weights_for_balanced_classes() {
    let mut classes = vec!["snia"; 50];
    classes.extend(vec!["snii"; 50]);
    let metadata = MetadataTable::new(ids(100), labels(&classes)).unwrap();

    let weights = WeightSpec::flat().evaluate(&metadata).unwrap();
    assert_eq!(weights.len(), 100);
    for &w in weights.values() {
        assert_abs_diff_eq!(w, 2.0, epsilon = 1e-12);
    }
    assert_eq!(weights.get("obj_99"), Some(2.0));
}

#[test]
fn flat_weights_give_every_class_the_same_total() {
    let classes = ["a", "a", "a", "a", "b", "b", "c"];
    let metadata = MetadataTable::new(ids(7), labels(&classes)).unwrap();
    let weights = WeightSpec::default().evaluate(&metadata).unwrap();

    let total = |class: &str| -> f64 {
        classes
            .iter()
            .zip(weights.values())
            .filter(|(c, _)| **c == class)
            .map(|(_, w)| w)
            .sum()
    };
    assert_abs_diff_eq!(total("a"), 7.0, epsilon = 1e-12);
    assert_abs_diff_eq!(total("b"), 7.0, epsilon = 1e-12);
    assert_abs_diff_eq!(total("c"), 7.0, epsilon = 1e-12);
}

#[test]
fn explicit_class_weights_must_cover_every_class() {
    let metadata = MetadataTable::new(ids(3), labels(&["a", "b", "c"])).unwrap();
    let class_weights: ClassWeights = [("a".to_string(), 1.0), ("b".to_string(), 2.0)]
        .into_iter()
        .collect();
    let spec = WeightSpec::new(WeightingPolicy::Flat, Some(class_weights)).unwrap();

    match spec.evaluate(&metadata) {
        Err(ClassifierError::InvalidWeightSpec(message)) => assert!(message.contains("c")),
        other => panic!("expected InvalidWeightSpec, got {:?}", other.map(|w| w.len())),
    }
}

#[test]
fn redshift_weights_require_redshift_column() {
    let metadata = MetadataTable::new(ids(2), labels(&["a", "b"])).unwrap();
    let spec = RedshiftWeightSpec::new(0.1, 3.0, 10, 100.0, "host_specz", None).unwrap();
    let weight_spec = WeightSpec::new(WeightingPolicy::Redshift(spec), None).unwrap();
    assert!(weight_spec.evaluate(&metadata).is_err());
}

#[test]
fn redshift_weights_are_positive_and_finite() {
    let classes = ["gal", "gal", "sn", "sn", "sn", "agn"];
    let metadata = MetadataTable::new(ids(6), labels(&classes))
        .unwrap()
        .with_numeric_column("host_specz", vec![0.0, 0.0, 0.3, 0.9, 2.5, 5.0])
        .unwrap();
    let spec = RedshiftWeightSpec::new(0.1, 3.0, 4, 1.0, "host_specz", None).unwrap();
    let weights = WeightSpec::new(WeightingPolicy::Redshift(spec), None)
        .unwrap()
        .evaluate(&metadata)
        .unwrap();

    assert_eq!(weights.len(), 6);
    for &w in weights.values() {
        assert!(w.is_finite() && w > 0.0, "bad weight {}", w);
    }
}

// ---------------------------------------------------------------------------
// Weighted multi-class log-loss
// ---------------------------------------------------------------------------

#[test]
fn uniform_predictions_score_log_of_class_count() {
    let classes = labels(&["a", "b", "c", "a", "b", "c"]);
    let predictions = PredictionTable::new(
        ids(6),
        labels(&["a", "b", "c"]),
        Array2::from_elem((6, 3), 1.0 / 3.0),
    )
    .unwrap();

    let loss = weighted_multi_logloss(&classes, &predictions, None, None).unwrap();
    assert_abs_diff_eq!(loss, 3f64.ln(), epsilon = 1e-12);

    let object_weights = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let loss = weighted_multi_logloss(&classes, &predictions, Some(&object_weights), None).unwrap();
    assert_abs_diff_eq!(loss, 3f64.ln(), epsilon = 1e-12);
}

#[test]
fn perfect_predictions_score_zero() {
    let classes = labels(&["a", "b"]);
    let predictions =
        PredictionTable::new(ids(2), labels(&["a", "b"]), array![[1.0, 0.0], [0.0, 1.0]])
            .unwrap();
    let loss = weighted_multi_logloss(&classes, &predictions, None, None).unwrap();
    assert_abs_diff_eq!(loss, 0.0, epsilon = 1e-12);
}

#[test]
fn zero_probability_is_floored() {
    let classes = labels(&["a", "b"]);
    let predictions =
        PredictionTable::new(ids(2), labels(&["a", "b"]), array![[0.0, 1.0], [0.0, 1.0]])
            .unwrap();
    let contributions =
        weighted_multi_logloss_contributions(&classes, &predictions, None, None).unwrap();

    // Class "a" sees ln(1e-10) on its only object, class "b" scores zero.
    let expected = -(1e-10f64).ln() / 2.0;
    assert_abs_diff_eq!(contributions[0], expected, epsilon = 1e-9);
    assert_abs_diff_eq!(contributions[1], 0.0, epsilon = 1e-12);
}

#[test]
fn zero_class_weight_drops_the_class() {
    let classes = labels(&["a", "b", "b"]);
    let predictions = PredictionTable::new(
        ids(3),
        labels(&["a", "b"]),
        array![[0.2, 0.8], [0.4, 0.6], [0.1, 0.9]],
    )
    .unwrap();
    let class_weights: ClassWeights = [("a".to_string(), 0.0), ("b".to_string(), 1.0)]
        .into_iter()
        .collect();

    let contributions =
        weighted_multi_logloss_contributions(&classes, &predictions, None, Some(&class_weights))
            .unwrap();
    assert_eq!(contributions[0], 0.0);

    let only_b = PredictionTable::new(
        ids(3).into_iter().skip(1).collect(),
        labels(&["a", "b"]),
        array![[0.4, 0.6], [0.1, 0.9]],
    )
    .unwrap();
    let expected =
        weighted_multi_logloss(&classes[1..], &only_b, None, Some(&class_weights)).unwrap();
    let loss =
        weighted_multi_logloss(&classes, &predictions, None, Some(&class_weights)).unwrap();
    assert_abs_diff_eq!(loss, expected, epsilon = 1e-12);
}

#[test]
fn missing_prediction_column_is_an_error() {
    let classes = labels(&["a", "z"]);
    let predictions =
        PredictionTable::new(ids(2), labels(&["a", "b"]), array![[0.5, 0.5], [0.5, 0.5]])
            .unwrap();
    match weighted_multi_logloss(&classes, &predictions, None, None) {
        Err(ClassifierError::MissingPrediction { class }) => assert_eq!(class, "z"),
        other => panic!("expected MissingPrediction, got {:?}", other),
    }
}
