//! End-to-end tests: cross-validated training, ensemble prediction and
//! persistence of named classifiers.

use approx::assert_abs_diff_eq;
use ndarray::Array2;

use transient_classifiers::config::{ArchitectureKind, NeuralParams, TreeEnsembleParams};
use transient_classifiers::data_handling::{Dataset, FeatureSubset, FeatureTable, MetadataTable};
use transient_classifiers::tracking::HistorySink;
use transient_classifiers::classifier::ClassMap;
use transient_classifiers::{BackendConfig, Classifier, ClassifierError, Settings};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Three well separated classes with `per_class` objects each.
fn separable_dataset(per_class: usize, with_augments: bool) -> Dataset {
    let class_names = ["agn", "snia", "snii"];
    let n = per_class * class_names.len();

    let ids: Vec<String> = (0..n).map(|i| format!("obj_{}", i)).collect();
    let classes: Vec<String> = (0..n)
        .map(|i| class_names[i / per_class].to_string())
        .collect();
    let values = Array2::from_shape_fn((n, 4), |(i, j)| {
        let k = (i / per_class) as f32;
        let jitter = ((i * 7 + j * 3) % 5) as f32 * 0.1;
        match j {
            0 => 3.0 * k + jitter,
            1 => -2.0 * k + jitter,
            2 => jitter,
            _ => k * k - jitter,
        }
    });

    let mut metadata = MetadataTable::new(ids, classes).unwrap();
    if with_augments {
        // The last object of every class is an augmentation of the first.
        let refs = (0..n)
            .map(|i| {
                if i % per_class == per_class - 1 {
                    Some(format!("obj_{}", i - (per_class - 1)))
                } else {
                    None
                }
            })
            .collect();
        metadata = metadata.with_reference_object_ids(refs).unwrap();
    }

    let columns = vec![
        "peak_flux".to_string(),
        "color".to_string(),
        "noise".to_string(),
        "width".to_string(),
    ];
    let features = FeatureTable::new(columns, values).unwrap();
    Dataset::new("separable", metadata, features).unwrap()
}

fn tiny_trees() -> BackendConfig {
    BackendConfig::TreeEnsemble(TreeEnsembleParams {
        learning_rate: 0.3,
        feature_fraction: 1.0,
        max_depth: 3,
        n_estimators: 10,
        early_stopping_rounds: 5,
        verbose_eval: 0,
        ..TreeEnsembleParams::default()
    })
}

fn tiny_mlp() -> BackendConfig {
    BackendConfig::Neural(NeuralParams {
        architecture: ArchitectureKind::Mlp,
        batch_size: 8,
        max_iters: 15,
        hidden_dim: 16,
        eval_interval: 5,
        eval_iters: 1,
        learning_rate: 1e-2,
        device: "cpu".to_string(),
        seed: Some(3),
        ..NeuralParams::default()
    })
}

// ---------------------------------------------------------------------------
// Cross-validation
// ---------------------------------------------------------------------------

#[test]
fn out_of_fold_predictions_cover_every_object() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let dataset = separable_dataset(10, false);

    let mut classifier = Classifier::new("trees", tiny_trees(), settings).unwrap();
    let report = classifier.train(&dataset, Some(3), Some(11)).unwrap();

    assert_eq!(report.folds.len(), 3);
    let num_validation: usize = report.folds.iter().map(|f| f.num_validation).sum();
    assert_eq!(num_validation, dataset.len());
    for fold in &report.folds {
        assert_eq!(fold.num_train + fold.num_validation, dataset.len());
        assert!(fold.best_val_loss.is_finite());
    }

    let bundle = classifier.bundle().unwrap();
    assert_eq!(bundle.folds.len(), 3);
    assert_eq!(bundle.classes().to_vec(), vec!["agn", "snia", "snii"]);
    assert_eq!(bundle.train_classes, dataset.metadata().classes());
    assert!(bundle.train_predictions.is_complete());
    for row in bundle.train_predictions.values().rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
    }

    assert!(report.weighted_logloss < 3f64.ln());
    assert!(report.unweighted_logloss.is_finite());
    assert!(report.original_weighted_logloss.is_none());
    assert!(report.original_unweighted_logloss.is_none());
}

#[test]
fn augmented_datasets_report_original_only_losses() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let dataset = separable_dataset(10, true);

    let mut classifier = Classifier::new("augmented", tiny_trees(), settings).unwrap();
    let report = classifier.train(&dataset, Some(3), None).unwrap();

    assert!(report.original_weighted_logloss.unwrap().is_finite());
    assert!(report.original_unweighted_logloss.unwrap().is_finite());
    assert!(classifier.bundle().unwrap().train_predictions.is_complete());
}

#[test]
fn predict_averages_fold_models() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let dataset = separable_dataset(8, false);

    let mut classifier = Classifier::new("average", tiny_trees(), settings)
        .unwrap()
        .with_featurizer(Box::new(FeatureSubset(vec![
            "peak_flux".to_string(),
            "width".to_string(),
        ])));
    classifier.train(&dataset, Some(2), Some(5)).unwrap();
    assert_eq!(
        classifier.bundle().unwrap().feature_columns,
        vec!["peak_flux".to_string(), "width".to_string()]
    );

    let predictions = classifier.predict(&dataset).unwrap();
    assert_eq!(predictions.len(), dataset.len());
    assert_eq!(predictions.object_ids(), dataset.metadata().object_ids());
    for row in predictions.values().rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
    }
}

#[test]
fn non_finite_features_train_and_predict_with_trees() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let clean = separable_dataset(10, false);

    let mut values = clean.features().values().clone();
    for i in (0..values.nrows()).step_by(7) {
        values[(i, 1)] = f32::NAN;
    }
    values[(4, 3)] = f32::INFINITY;
    let features = FeatureTable::new(clean.features().columns().to_vec(), values).unwrap();
    let dataset = Dataset::new("gappy", clean.metadata().clone(), features).unwrap();

    let backend = BackendConfig::TreeEnsemble(TreeEnsembleParams {
        learning_rate: 0.3,
        feature_fraction: 1.0,
        max_depth: 3,
        n_estimators: 3,
        verbose_eval: 0,
        ..TreeEnsembleParams::default()
    });
    let mut classifier = Classifier::new("gappy", backend, settings).unwrap();
    let report = classifier.train(&dataset, Some(3), Some(1)).unwrap();
    assert!(report.weighted_logloss.is_finite());

    let predictions = classifier.predict(&dataset).unwrap();
    for row in predictions.values().rows() {
        assert!(row.iter().all(|p| p.is_finite()));
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
    }
}

#[test]
fn class_map_merges_classes_for_training() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let dataset = separable_dataset(8, false);
    let class_map: ClassMap = [
        ("agn".to_string(), "active".to_string()),
        ("snia".to_string(), "sn".to_string()),
        ("snii".to_string(), "sn".to_string()),
    ]
    .into_iter()
    .collect();

    let mut classifier = Classifier::new("merged", tiny_trees(), settings.clone())
        .unwrap()
        .with_class_map(class_map.clone());
    classifier.train(&dataset, Some(2), Some(4)).unwrap();

    let bundle = classifier.bundle().unwrap();
    assert_eq!(bundle.classes().to_vec(), vec!["active", "sn"]);
    assert_eq!(bundle.train_predictions.values().ncols(), 2);
    assert_eq!(bundle.train_classes[0], "active");
    assert_eq!(bundle.train_classes[dataset.len() - 1], "sn");
    assert_eq!(bundle.class_map.as_ref(), Some(&class_map));

    let predictions = classifier.predict(&dataset).unwrap();
    assert_eq!(predictions.classes().to_vec(), vec!["agn", "sn"]);

    classifier.write(false).unwrap();
    let loaded = Classifier::load("merged", settings).unwrap();
    assert_eq!(
        loaded.predict(&dataset).unwrap().classes().to_vec(),
        vec!["agn", "sn"]
    );
}

#[test]
fn untrained_classifier_cannot_predict_or_write() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let classifier = Classifier::new("untrained", tiny_trees(), settings).unwrap();
    let dataset = separable_dataset(4, false);

    assert!(matches!(
        classifier.predict(&dataset),
        Err(ClassifierError::NotTrained)
    ));
    assert!(matches!(
        classifier.write(false),
        Err(ClassifierError::NotTrained)
    ));
}

#[test]
fn unknown_metric_sink_is_a_configuration_error() {
    let backend = BackendConfig::Neural(NeuralParams {
        metric_sink: Some("tensorboard".to_string()),
        ..NeuralParams::default()
    });
    assert!(matches!(
        Classifier::new("sink", backend, Settings::default()),
        Err(ClassifierError::Configuration(_))
    ));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn write_refuses_to_overwrite_unless_asked() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path().join("nested"));
    let dataset = separable_dataset(6, false);

    let mut classifier = Classifier::new("persist", tiny_trees(), settings.clone()).unwrap();
    classifier.train(&dataset, Some(2), Some(3)).unwrap();

    classifier.write(false).unwrap();
    assert!(settings.classifier_path("persist").exists());

    match classifier.write(false) {
        Err(ClassifierError::PersistenceConflict { path }) => {
            assert_eq!(path, settings.classifier_path("persist"))
        }
        other => panic!("expected PersistenceConflict, got {:?}", other),
    }

    classifier.write(true).unwrap();
}

#[test]
fn loaded_classifier_predicts_like_the_original() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let settings_path = dir.path().join("settings.json");
    std::fs::write(
        &settings_path,
        serde_json::json!({
            "classifier_directory": dir.path().join("classifiers"),
            "num_folds": 2,
        })
        .to_string(),
    )?;
    let settings = Settings::from_json_file(&settings_path)?;
    assert_eq!(settings.num_folds, 2);
    let dataset = separable_dataset(6, false);

    let mut classifier = Classifier::new("roundtrip", tiny_trees(), settings.clone())?;
    classifier.train(&dataset, None, Some(3))?;
    assert_eq!(classifier.bundle().map(|b| b.folds.len()), Some(2));
    classifier.write(false)?;
    let expected = classifier.predict(&dataset)?;

    let loaded = Classifier::load("roundtrip", settings)?;
    assert_eq!(loaded.name(), "roundtrip");
    assert_eq!(loaded.backend(), classifier.backend());
    assert!(loaded
        .bundle()
        .map_or(false, |b| b.train_predictions.is_complete()));

    let predictions = loaded.predict(&dataset)?;
    for (a, b) in predictions.values().iter().zip(expected.values().iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn loading_a_missing_classifier_fails() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    assert!(matches!(
        Classifier::load("nothing", settings),
        Err(ClassifierError::Io(_))
    ));
}

// ---------------------------------------------------------------------------
// Neural backend
// ---------------------------------------------------------------------------

#[test]
fn neural_backend_checkpoints_every_fold() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_classifier_directory(dir.path());
    let dataset = separable_dataset(8, false);

    let sink = HistorySink::new();
    let mut classifier = Classifier::new("mlp", tiny_mlp(), settings.clone())
        .unwrap()
        .with_metric_sink(Box::new(sink.clone()));
    let report = classifier.train(&dataset, Some(3), Some(2)).unwrap();

    assert_eq!(report.folds.len(), 3);
    for fold in 0..3 {
        assert!(settings.fold_weights_path("mlp", fold).exists());
    }
    // Evaluations at steps 0, 5, 10 and 14 in each fold.
    assert_eq!(sink.history().len(), 12);

    classifier.write(false).unwrap();
    let loaded = Classifier::load("mlp", settings).unwrap();
    let predictions = loaded.predict(&dataset).unwrap();
    assert_eq!(predictions.len(), dataset.len());
    for row in predictions.values().rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
    }
}
