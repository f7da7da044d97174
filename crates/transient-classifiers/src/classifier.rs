//! Cross-validated training, out-of-fold scoring, ensemble prediction and
//! persistence of a named classifier.
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, Settings};
use crate::data_handling::{AllFeatures, Dataset, FeatureSubset, Featurizer, FoldAssignment};
use crate::error::{ClassifierError, Result};
use crate::models::classifier_trait::{FoldArtifact, FoldData};
use crate::models::factory::{build_model, ModelContext};
use crate::predictions::PredictionTable;
use crate::stats::weighted_multi_logloss;
use crate::tracking::{sink_from_identifier, MetricSink};
use crate::weights::WeightSpec;

/// What happened in one cross-validation fold.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FoldSummary {
    pub fold: usize,
    pub num_train: usize,
    pub num_validation: usize,
    pub best_iteration: usize,
    pub best_val_loss: f64,
}

/// Per-fold summaries and the out-of-fold log-loss diagnostics.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub folds: Vec<FoldSummary>,
    /// Weighted multi-class log-loss with object weights.
    pub weighted_logloss: f64,
    /// Weighted multi-class log-loss without object weights.
    pub unweighted_logloss: f64,
    /// Same as `weighted_logloss`, on un-augmented objects only.
    pub original_weighted_logloss: Option<f64>,
    pub original_unweighted_logloss: Option<f64>,
}

/// The trained state of a classifier: one model per fold plus the out-of-fold
/// predictions made while training.
#[derive(Deserialize, Serialize)]
pub struct ClassifierBundle {
    pub name: String,
    pub backend: BackendConfig,
    pub weight_spec: WeightSpec,
    /// Relabelling applied to the true classes before training.
    #[serde(default)]
    pub class_map: Option<ClassMap>,
    pub feature_columns: Vec<String>,
    pub train_predictions: PredictionTable,
    pub train_classes: Vec<String>,
    pub folds: Vec<FoldArtifact>,
}

impl ClassifierBundle {
    /// Sorted class labels, the columns of every prediction table.
    pub fn classes(&self) -> &[String] {
        self.train_predictions.classes()
    }
}

/// Maps a dataset class label to the label the classifier is trained on.
/// Several labels mapping to one target merge those classes. Labels that are
/// not listed are kept.
pub type ClassMap = BTreeMap<String, String>;

/// Relabel `classes` through `class_map`.
pub fn apply_class_map(classes: &[String], class_map: Option<&ClassMap>) -> Vec<String> {
    match class_map {
        None => classes.to_vec(),
        Some(map) => classes
            .iter()
            .map(|c| map.get(c).unwrap_or(c).clone())
            .collect(),
    }
}

/// Name the prediction columns by dataset label again. A trained label that
/// several dataset labels were merged into keeps its trained name.
pub fn invert_class_map(columns: &[String], class_map: Option<&ClassMap>) -> Vec<String> {
    let map = match class_map {
        Some(map) => map,
        None => return columns.to_vec(),
    };
    let mut sources: HashMap<&str, Vec<&str>> = HashMap::new();
    for (source, target) in map {
        sources.entry(target.as_str()).or_default().push(source.as_str());
    }
    columns
        .iter()
        .map(|column| match sources.get(column.as_str()) {
            Some(names) if names.len() == 1 => names[0].to_string(),
            _ => column.clone(),
        })
        .collect()
}

/// A named classifier trained with k-fold cross-validation.
pub struct Classifier {
    name: String,
    settings: Settings,
    backend: BackendConfig,
    weight_spec: WeightSpec,
    class_map: Option<ClassMap>,
    featurizer: Box<dyn Featurizer>,
    sink: Box<dyn MetricSink>,
    bundle: Option<ClassifierBundle>,
}

fn sink_for_backend(backend: &BackendConfig) -> Result<Box<dyn MetricSink>> {
    match backend {
        BackendConfig::Neural(params) => sink_from_identifier(params.metric_sink.as_deref()),
        BackendConfig::TreeEnsemble(_) => sink_from_identifier(None),
    }
}

impl Classifier {
    /// A classifier using every feature and flat class-balanced weights.
    pub fn new(name: &str, backend: BackendConfig, settings: Settings) -> Result<Self> {
        let sink = sink_for_backend(&backend)?;
        Ok(Self {
            name: name.to_string(),
            settings,
            backend,
            weight_spec: WeightSpec::default(),
            class_map: None,
            featurizer: Box::new(AllFeatures),
            sink,
            bundle: None,
        })
    }

    pub fn with_weight_spec(mut self, weight_spec: WeightSpec) -> Self {
        self.weight_spec = weight_spec;
        self
    }

    /// Train on relabelled classes, e.g. to merge rare subtypes.
    pub fn with_class_map(mut self, class_map: ClassMap) -> Self {
        self.class_map = Some(class_map);
        self
    }

    pub fn with_featurizer(mut self, featurizer: Box<dyn Featurizer>) -> Self {
        self.featurizer = featurizer;
        self
    }

    /// Replace the metric sink chosen by the backend configuration.
    pub fn with_metric_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn bundle(&self) -> Option<&ClassifierBundle> {
        self.bundle.as_ref()
    }

    /// Where the bundle of this classifier is stored.
    pub fn path(&self) -> PathBuf {
        self.settings.classifier_path(&self.name)
    }

    /// Train on `dataset` with folds labelled by the dataset itself.
    /// `num_folds` and `random_state` default to the settings.
    pub fn train(
        &mut self,
        dataset: &Dataset,
        num_folds: Option<usize>,
        random_state: Option<u64>,
    ) -> Result<TrainingReport> {
        let num_folds = num_folds.unwrap_or(self.settings.num_folds);
        let random_state = random_state.unwrap_or(self.settings.fold_random_state);
        let folds = dataset.label_folds(num_folds, random_state)?;
        self.train_with_folds(dataset, &folds)
    }

    /// Train one model per fold and collect strictly out-of-fold predictions.
    pub fn train_with_folds(
        &mut self,
        dataset: &Dataset,
        folds: &FoldAssignment,
    ) -> Result<TrainingReport> {
        if folds.len() != dataset.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: dataset.len(),
                found: folds.len(),
            });
        }

        let features = dataset.select_features(self.featurizer.as_ref())?;
        let metadata = dataset.metadata();
        let object_weights = self.weight_spec.evaluate(metadata)?;
        let mapped_classes = apply_class_map(metadata.classes(), self.class_map.as_ref());
        let object_classes = mapped_classes.as_slice();
        let mut classes = object_classes.to_vec();
        classes.sort();
        classes.dedup();
        let class_indices: HashMap<&str, usize> = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();
        let labels = object_classes
            .iter()
            .map(|c| {
                class_indices.get(c.as_str()).copied().ok_or_else(|| {
                    ClassifierError::Configuration(format!("Class {} has no label index", c))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let mut predictions =
            PredictionTable::unfilled(metadata.object_ids().to_vec(), classes.clone());
        let mut artifacts = Vec::with_capacity(folds.num_folds());
        let mut summaries = Vec::with_capacity(folds.num_folds());

        for fold in 0..folds.num_folds() {
            let train_rows = folds.train_rows(fold);
            let validation_rows = folds.validation_rows(fold);
            if train_rows.is_empty() || validation_rows.is_empty() {
                return Err(ClassifierError::Configuration(format!(
                    "Fold {} has {} training and {} validation objects",
                    fold,
                    train_rows.len(),
                    validation_rows.len()
                )));
            }
            log::info!(
                "Training fold {} with {} training and {} validation objects",
                fold,
                train_rows.len(),
                validation_rows.len()
            );

            let train_features = features.values().select(Axis(0), &train_rows);
            let validation_features = features.values().select(Axis(0), &validation_rows);
            let train_labels: Vec<usize> = train_rows.iter().map(|&i| labels[i]).collect();
            let validation_labels: Vec<usize> =
                validation_rows.iter().map(|&i| labels[i]).collect();
            let train_weights = object_weights.select_rows(&train_rows);
            let validation_weights = object_weights.select_rows(&validation_rows);

            let context = ModelContext {
                num_features: features.ncols(),
                num_classes: classes.len(),
                weights_path: self.settings.fold_weights_path(&self.name, fold),
            };
            let mut model = build_model(&self.backend, &context)?;
            let fit = model.fit(
                &FoldData {
                    train_features: &train_features,
                    train_labels: &train_labels,
                    train_weights: &train_weights,
                    val_features: &validation_features,
                    val_labels: &validation_labels,
                    val_weights: &validation_weights,
                },
                self.sink.as_mut(),
            )?;

            let validation_predictions = model.predict_proba(&validation_features)?;
            predictions.fill_rows(&validation_rows, &validation_predictions)?;

            summaries.push(FoldSummary {
                fold,
                num_train: train_rows.len(),
                num_validation: validation_rows.len(),
                best_iteration: fit.best_iteration,
                best_val_loss: fit.best_val_loss,
            });
            artifacts.push(model.into_artifact()?);
        }

        predictions.ensure_complete()?;

        let class_weights = self.weight_spec.class_weights();
        let weighted_logloss = weighted_multi_logloss(
            object_classes,
            &predictions,
            Some(object_weights.values()),
            class_weights,
        )?;
        let unweighted_logloss =
            weighted_multi_logloss(object_classes, &predictions, None, class_weights)?;
        log::info!("Weighted log-loss:");
        log::info!("    With object weights:    {:.5}", weighted_logloss);
        log::info!("    Without object weights: {:.5}", unweighted_logloss);

        let (original_weighted_logloss, original_unweighted_logloss) =
            match metadata.original_mask() {
                Some(mask) => {
                    let rows: Vec<usize> = mask
                        .iter()
                        .enumerate()
                        .filter_map(|(i, &original)| if original { Some(i) } else { None })
                        .collect();
                    let original_classes: Vec<String> =
                        rows.iter().map(|&i| object_classes[i].clone()).collect();
                    let original_predictions = predictions.select_rows(&rows);
                    let original_weights = object_weights.select_rows(&rows);

                    let weighted = weighted_multi_logloss(
                        &original_classes,
                        &original_predictions,
                        Some(&original_weights),
                        class_weights,
                    )?;
                    let unweighted = weighted_multi_logloss(
                        &original_classes,
                        &original_predictions,
                        None,
                        class_weights,
                    )?;
                    log::info!("Original un-augmented dataset weighted log-loss:");
                    log::info!("    With object weights:    {:.5}", weighted);
                    log::info!("    Without object weights: {:.5}", unweighted);
                    (Some(weighted), Some(unweighted))
                }
                None => (None, None),
            };

        self.bundle = Some(ClassifierBundle {
            name: self.name.clone(),
            backend: self.backend.clone(),
            weight_spec: self.weight_spec.clone(),
            class_map: self.class_map.clone(),
            feature_columns: features.columns().to_vec(),
            train_predictions: predictions,
            train_classes: object_classes.to_vec(),
            folds: artifacts,
        });

        Ok(TrainingReport {
            folds: summaries,
            weighted_logloss,
            unweighted_logloss,
            original_weighted_logloss,
            original_unweighted_logloss,
        })
    }

    /// Average the class probabilities of every fold model. Columns are named
    /// by dataset label when a class map was used in training.
    pub fn predict(&self, dataset: &Dataset) -> Result<PredictionTable> {
        let bundle = self.bundle.as_ref().ok_or(ClassifierError::NotTrained)?;
        if bundle.folds.is_empty() {
            return Err(ClassifierError::NotTrained);
        }

        let features =
            dataset.select_features(&FeatureSubset(bundle.feature_columns.clone()))?;

        let mut predictions = Array2::<f64>::zeros((dataset.len(), bundle.classes().len()));
        for (fold, artifact) in bundle.folds.iter().enumerate() {
            log::debug!("Predicting with fold {} of {}", fold, bundle.folds.len());
            predictions += &artifact.predict_proba(features.values())?;
        }
        predictions /= bundle.folds.len() as f64;

        PredictionTable::new(
            dataset.metadata().object_ids().to_vec(),
            invert_class_map(bundle.classes(), bundle.class_map.as_ref()),
            predictions,
        )
    }

    /// Write the trained bundle to [`Classifier::path`].
    pub fn write(&self, overwrite: bool) -> Result<()> {
        let bundle = self.bundle.as_ref().ok_or(ClassifierError::NotTrained)?;
        let path = self.path();

        fs::create_dir_all(&self.settings.classifier_directory)?;

        if path.exists() {
            if overwrite {
                log::warn!("Overwriting {:?}...", path);
                fs::remove_file(&path)?;
            } else {
                return Err(ClassifierError::PersistenceConflict { path });
            }
        }

        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(writer, bundle)?;
        log::info!("Wrote classifier {} to {:?}", self.name, path);
        Ok(())
    }

    /// Load a classifier previously written under `name`.
    pub fn load(name: &str, settings: Settings) -> Result<Self> {
        let path = settings.classifier_path(name);
        let reader = BufReader::new(File::open(&path)?);
        let bundle: ClassifierBundle = serde_json::from_reader(reader)?;
        log::debug!("Loaded classifier {} from {:?}", name, path);

        let sink = sink_for_backend(&bundle.backend)?;
        Ok(Self {
            name: name.to_string(),
            settings,
            backend: bundle.backend.clone(),
            weight_spec: bundle.weight_spec.clone(),
            class_map: bundle.class_map.clone(),
            featurizer: Box::new(FeatureSubset(bundle.feature_columns.clone())),
            sink,
            bundle: Some(bundle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_class_map_merges_and_keeps_unlisted() {
        let class_map: ClassMap = [
            ("snia".to_string(), "sn".to_string()),
            ("snii".to_string(), "sn".to_string()),
        ]
        .into_iter()
        .collect();
        let mapped = apply_class_map(&labels(&["snia", "agn", "snii"]), Some(&class_map));
        assert_eq!(mapped, labels(&["sn", "agn", "sn"]));
        assert_eq!(
            apply_class_map(&labels(&["snia"]), None),
            labels(&["snia"])
        );
    }

    #[test]
    fn test_invert_class_map_restores_renamed_columns() {
        let class_map: ClassMap = [
            ("agn".to_string(), "active".to_string()),
            ("snia".to_string(), "sn".to_string()),
            ("snii".to_string(), "sn".to_string()),
        ]
        .into_iter()
        .collect();
        let columns = labels(&["active", "kn", "sn"]);
        assert_eq!(
            invert_class_map(&columns, Some(&class_map)),
            labels(&["agn", "kn", "sn"])
        );
        assert_eq!(invert_class_map(&columns, None), columns);
    }
}
